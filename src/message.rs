use crate::nrc::NegativeResponseCode;

/// A DoIP logical address, naming a tester or an ECU function.
pub type LogicalAddress = u16;

/// A CAN identifier, as carried by the diagnostic frames of a route.
pub type CanId = u16;

/// DoIP protocol version emitted by the gateway (ISO 13400-2:2012).
pub const DOIP_VERSION: u8 = 0x02;

/// Size of the DoIP generic header.
pub const DOIP_HEADER_LENGTH: usize = 8;

/// Size of the fixed part of a diagnostic payload, in both directions.
pub const DIAGNOSTIC_FIXED_LENGTH: usize = 8;

/// Flag bit set in a diagnostic response when it carries a negative response
/// code instead of data.
pub const RESPONSE_FLAG_NEGATIVE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// DoIP payload types handled by the gateway.
pub enum PayloadType {
    /// Generic DoIP header negative acknowledge.
    GenericNack,
    /// Diagnostic message, both as a request and as a response.
    DiagnosticMessage,
    /// Diagnostic message negative acknowledgement.
    DiagnosticMessageNegativeAck,
}

impl PayloadType {
    /// Wire value of the payload type.
    pub fn value(self) -> u16 {
        match self {
            PayloadType::GenericNack => 0x0000,
            PayloadType::DiagnosticMessage => 0x8001,
            PayloadType::DiagnosticMessageNegativeAck => 0x8003,
        }
    }

    /// Payload type for a wire value, if handled.
    pub fn from_value(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(PayloadType::GenericNack),
            0x8001 => Some(PayloadType::DiagnosticMessage),
            0x8003 => Some(PayloadType::DiagnosticMessageNegativeAck),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Generic header negative acknowledge codes.
pub enum GenericNackCode {
    /// 0x00: the header pattern (version/inverse version) is wrong.
    IncorrectPatternFormat,
    /// 0x01
    UnknownPayloadType,
    /// 0x02
    MessageTooLarge,
    /// 0x03
    OutOfMemory,
    /// 0x04
    InvalidPayloadLength,
    /// Reserved values.
    Reserved(u8),
}

impl From<u8> for GenericNackCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::IncorrectPatternFormat,
            0x01 => Self::UnknownPayloadType,
            0x02 => Self::MessageTooLarge,
            0x03 => Self::OutOfMemory,
            0x04 => Self::InvalidPayloadLength,
            other => Self::Reserved(other),
        }
    }
}

impl From<GenericNackCode> for u8 {
    fn from(code: GenericNackCode) -> Self {
        match code {
            GenericNackCode::IncorrectPatternFormat => 0x00,
            GenericNackCode::UnknownPayloadType => 0x01,
            GenericNackCode::MessageTooLarge => 0x02,
            GenericNackCode::OutOfMemory => 0x03,
            GenericNackCode::InvalidPayloadLength => 0x04,
            GenericNackCode::Reserved(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Diagnostic message negative acknowledgement codes.
pub enum DiagnosticNackCode {
    /// 0x02
    InvalidSourceAddress,
    /// 0x03: no route is configured for the target address.
    UnknownTargetAddress,
    /// 0x04
    DiagnosticMessageTooLarge,
    /// 0x05
    OutOfMemory,
    /// 0x06: the route exists but its bus refused the request.
    TargetUnreachable,
    /// 0x07: the route names a bus the gateway does not drive.
    UnknownNetwork,
    /// 0x08
    TransportProtocolError,
    /// Reserved values.
    Reserved(u8),
}

impl From<u8> for DiagnosticNackCode {
    fn from(value: u8) -> Self {
        match value {
            0x02 => Self::InvalidSourceAddress,
            0x03 => Self::UnknownTargetAddress,
            0x04 => Self::DiagnosticMessageTooLarge,
            0x05 => Self::OutOfMemory,
            0x06 => Self::TargetUnreachable,
            0x07 => Self::UnknownNetwork,
            0x08 => Self::TransportProtocolError,
            other => Self::Reserved(other),
        }
    }
}

impl From<DiagnosticNackCode> for u8 {
    fn from(code: DiagnosticNackCode) -> Self {
        match code {
            DiagnosticNackCode::InvalidSourceAddress => 0x02,
            DiagnosticNackCode::UnknownTargetAddress => 0x03,
            DiagnosticNackCode::DiagnosticMessageTooLarge => 0x04,
            DiagnosticNackCode::OutOfMemory => 0x05,
            DiagnosticNackCode::TargetUnreachable => 0x06,
            DiagnosticNackCode::UnknownNetwork => 0x07,
            DiagnosticNackCode::TransportProtocolError => 0x08,
            DiagnosticNackCode::Reserved(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A diagnostic request, as sent by a tester to the gateway.
pub struct DiagnosticRequest {
    /// Tester logical address.
    pub source_address: LogicalAddress,
    /// ECU logical address.
    pub target_address: LogicalAddress,
    /// UDS service identifier.
    pub service_id: u8,
    /// Sub-function or flags byte, reserved for most services.
    pub flags: u8,
    /// Data identifier the service applies to.
    pub identifier: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A diagnostic response, as sent by the gateway back to a tester.
///
/// `service_id` is always the service of the request being answered, for
/// positive and negative responses alike.
pub struct DiagnosticResponse {
    /// ECU logical address.
    pub source_address: LogicalAddress,
    /// Tester logical address.
    pub target_address: LogicalAddress,
    /// UDS service identifier of the request.
    pub service_id: u8,
    /// Data identifier of the request.
    pub identifier: u16,
    /// Data returned by the ECU, empty for negative responses.
    pub payload: Vec<u8>,
    /// Negative response code, if the request was not positively answered.
    pub nrc: Option<NegativeResponseCode>,
}

impl DiagnosticResponse {
    /// A positive response to `request`, carrying `payload`.
    pub fn positive(request: &DiagnosticRequest, payload: Vec<u8>) -> Self {
        DiagnosticResponse {
            source_address: request.target_address,
            target_address: request.source_address,
            service_id: request.service_id,
            identifier: request.identifier,
            payload,
            nrc: None,
        }
    }

    /// A negative response to `request`.
    pub fn negative(request: &DiagnosticRequest, nrc: NegativeResponseCode) -> Self {
        DiagnosticResponse {
            source_address: request.target_address,
            target_address: request.source_address,
            service_id: request.service_id,
            identifier: request.identifier,
            payload: vec![],
            nrc: Some(nrc),
        }
    }

    /// Whether the response is positive.
    pub fn is_positive(&self) -> bool {
        self.nrc.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A diagnostic message negative acknowledgement: the gateway refuses the
/// message itself, regardless of its UDS content.
pub struct DiagnosticNack {
    /// The address the refused request was sent to.
    pub source_address: LogicalAddress,
    /// Tester logical address.
    pub target_address: LogicalAddress,
    /// Refusal reason.
    pub code: DiagnosticNackCode,
}

impl DiagnosticNack {
    /// Refuse `request` with `code`.
    pub fn refuse(request: &DiagnosticRequest, code: DiagnosticNackCode) -> Self {
        DiagnosticNack {
            source_address: request.target_address,
            target_address: request.source_address,
            code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The one message the gateway emits for each inbound DoIP message.
pub enum GatewayReply {
    /// A positive or negative diagnostic response.
    Response(DiagnosticResponse),
    /// The diagnostic message was refused before reaching any bus.
    DiagnosticNack(DiagnosticNack),
    /// The DoIP message could not be decoded.
    GenericNack(GenericNackCode),
}

impl GatewayReply {
    /// Whether the reply reports any kind of failure.
    pub fn is_negative(&self) -> bool {
        match self {
            GatewayReply::Response(rsp) => !rsp.is_positive(),
            GatewayReply::DiagnosticNack(_) | GatewayReply::GenericNack(_) => true,
        }
    }

    /// Payload type used to carry the reply.
    pub fn payload_type(&self) -> PayloadType {
        match self {
            GatewayReply::Response(_) => PayloadType::DiagnosticMessage,
            GatewayReply::DiagnosticNack(_) => PayloadType::DiagnosticMessageNegativeAck,
            GatewayReply::GenericNack(_) => PayloadType::GenericNack,
        }
    }
}
