//
// This module encodes and decodes the DoIP header and the diagnostic payloads
// exchanged between a tester and the gateway.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::message::{
    DiagnosticNack, DiagnosticRequest, DiagnosticResponse, GatewayReply, GenericNackCode,
    PayloadType, DIAGNOSTIC_FIXED_LENGTH, DOIP_HEADER_LENGTH, DOIP_VERSION,
    RESPONSE_FLAG_NEGATIVE,
};
use crate::nrc::NegativeResponseCode;

/// Errors raised while decoding a DoIP message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DoIpCodecError {
    /// Less bytes than a DoIP header.
    #[error("malformed header: {available} bytes available, 8 required")]
    MalformedHeader {
        /// Bytes available.
        available: usize,
    },
    /// The version is not the supported protocol version, or the inverse
    /// version byte is not its complement.
    #[error("version mismatch: version 0x{version:02x}, inverse version 0x{inverse:02x}")]
    VersionMismatch {
        /// Version byte.
        version: u8,
        /// Inverse version byte.
        inverse: u8,
    },
    /// The header declares another payload length than the bytes following it.
    #[error("length mismatch: header declares {declared} payload bytes, {available} available")]
    LengthMismatch {
        /// Declared payload length.
        declared: u32,
        /// Bytes available after the header.
        available: usize,
    },
    /// The payload type is not accepted in this direction.
    #[error("unsupported payload type 0x{0:04x}")]
    UnsupportedPayloadType(u16),
    /// The payload length does not fit the payload type.
    #[error("invalid payload length {length} for payload type 0x{payload_type:04x}")]
    InvalidPayloadLength {
        /// Payload type.
        payload_type: u16,
        /// Payload length.
        length: usize,
    },
    /// The header declares a payload above the accepted maximum.
    #[error("payload of {length} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge {
        /// Declared payload length.
        length: usize,
        /// Accepted maximum.
        limit: usize,
    },
    /// A diagnostic response sets flag bits other than the negative flag.
    #[error("reserved response flags 0x{0:02x}")]
    ReservedFlags(u8),
}

impl DoIpCodecError {
    /// Generic header negative acknowledge code reporting this error.
    pub fn nack_code(&self) -> GenericNackCode {
        match self {
            DoIpCodecError::VersionMismatch { .. } | DoIpCodecError::ReservedFlags(_) => {
                GenericNackCode::IncorrectPatternFormat
            }
            DoIpCodecError::UnsupportedPayloadType(_) => GenericNackCode::UnknownPayloadType,
            DoIpCodecError::PayloadTooLarge { .. } => GenericNackCode::MessageTooLarge,
            DoIpCodecError::MalformedHeader { .. }
            | DoIpCodecError::LengthMismatch { .. }
            | DoIpCodecError::InvalidPayloadLength { .. } => GenericNackCode::InvalidPayloadLength,
        }
    }

    /// Whether the byte stream carrying the message can no longer be trusted
    /// to be aligned on message boundaries.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DoIpCodecError::MalformedHeader { .. }
                | DoIpCodecError::VersionMismatch { .. }
                | DoIpCodecError::PayloadTooLarge { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// DoIP generic header.
pub struct DoIpHeader {
    /// Protocol version.
    pub version: u8,
    /// Bitwise complement of `version`.
    pub inverse_version: u8,
    /// Raw payload type.
    pub payload_type: u16,
    /// Number of payload bytes following the header.
    pub payload_length: u32,
}

impl DoIpHeader {
    /// Header for a payload emitted by the gateway.
    pub fn new(payload_type: PayloadType, payload_length: u32) -> Self {
        DoIpHeader {
            version: DOIP_VERSION,
            inverse_version: !DOIP_VERSION,
            payload_type: payload_type.value(),
            payload_length,
        }
    }

    /// Decode the header at the start of `buffer`.
    pub fn decode(buffer: &[u8]) -> Result<Self, DoIpCodecError> {
        if buffer.len() < DOIP_HEADER_LENGTH {
            return Err(DoIpCodecError::MalformedHeader {
                available: buffer.len(),
            });
        }
        let (version, inverse_version) = (buffer[0], buffer[1]);
        if version != DOIP_VERSION || inverse_version != !version {
            return Err(DoIpCodecError::VersionMismatch {
                version,
                inverse: inverse_version,
            });
        }
        Ok(DoIpHeader {
            version,
            inverse_version,
            payload_type: BigEndian::read_u16(&buffer[2..4]),
            payload_length: BigEndian::read_u32(&buffer[4..8]),
        })
    }

    /// Append the header to `buffer`.
    pub fn encode(&self, buffer: &mut Vec<u8>) {
        let mut header = [0u8; DOIP_HEADER_LENGTH];
        header[0] = self.version;
        header[1] = self.inverse_version;
        BigEndian::write_u16(&mut header[2..4], self.payload_type);
        BigEndian::write_u32(&mut header[4..8], self.payload_length);
        buffer.extend_from_slice(&header);
    }
}

/// Split a whole DoIP message into its header and its payload.
pub fn split_message(buffer: &[u8]) -> Result<(DoIpHeader, &[u8]), DoIpCodecError> {
    let header = DoIpHeader::decode(buffer)?;
    let payload = &buffer[DOIP_HEADER_LENGTH..];
    if payload.len() != header.payload_length as usize {
        return Err(DoIpCodecError::LengthMismatch {
            declared: header.payload_length,
            available: payload.len(),
        });
    }
    Ok((header, payload))
}

fn invalid_length(payload_type: PayloadType, length: usize) -> DoIpCodecError {
    DoIpCodecError::InvalidPayloadLength {
        payload_type: payload_type.value(),
        length,
    }
}

fn read_fixed(payload: &[u8]) -> (u16, u16, u8, u8, u16) {
    (
        BigEndian::read_u16(&payload[0..2]),
        BigEndian::read_u16(&payload[2..4]),
        payload[4],
        payload[5],
        BigEndian::read_u16(&payload[6..8]),
    )
}

fn write_fixed(
    buffer: &mut Vec<u8>,
    source_address: u16,
    target_address: u16,
    service_id: u8,
    flags: u8,
    identifier: u16,
) {
    let mut fixed = [0u8; DIAGNOSTIC_FIXED_LENGTH];
    BigEndian::write_u16(&mut fixed[0..2], source_address);
    BigEndian::write_u16(&mut fixed[2..4], target_address);
    fixed[4] = service_id;
    fixed[5] = flags;
    BigEndian::write_u16(&mut fixed[6..8], identifier);
    buffer.extend_from_slice(&fixed);
}

/// Decode a diagnostic request sent by a tester.
pub fn decode_request(buffer: &[u8]) -> Result<DiagnosticRequest, DoIpCodecError> {
    let (header, payload) = split_message(buffer)?;
    if PayloadType::from_value(header.payload_type) != Some(PayloadType::DiagnosticMessage) {
        return Err(DoIpCodecError::UnsupportedPayloadType(header.payload_type));
    }
    if payload.len() != DIAGNOSTIC_FIXED_LENGTH {
        return Err(invalid_length(PayloadType::DiagnosticMessage, payload.len()));
    }
    let (source_address, target_address, service_id, flags, identifier) = read_fixed(payload);
    Ok(DiagnosticRequest {
        source_address,
        target_address,
        service_id,
        flags,
        identifier,
    })
}

/// Encode a diagnostic request into `buffer`, replacing its content.
pub fn encode_request(request: &DiagnosticRequest, buffer: &mut Vec<u8>) {
    buffer.clear();
    DoIpHeader::new(PayloadType::DiagnosticMessage, DIAGNOSTIC_FIXED_LENGTH as u32)
        .encode(buffer);
    write_fixed(
        buffer,
        request.source_address,
        request.target_address,
        request.service_id,
        request.flags,
        request.identifier,
    );
}

fn decode_response(payload: &[u8]) -> Result<DiagnosticResponse, DoIpCodecError> {
    if payload.len() < DIAGNOSTIC_FIXED_LENGTH {
        return Err(invalid_length(PayloadType::DiagnosticMessage, payload.len()));
    }
    let (source_address, target_address, service_id, flags, identifier) = read_fixed(payload);
    if flags & !RESPONSE_FLAG_NEGATIVE != 0 {
        return Err(DoIpCodecError::ReservedFlags(flags));
    }
    let data = &payload[DIAGNOSTIC_FIXED_LENGTH..];
    let (payload_data, nrc) = if flags & RESPONSE_FLAG_NEGATIVE != 0 {
        if data.len() != 1 {
            return Err(invalid_length(PayloadType::DiagnosticMessage, payload.len()));
        }
        (vec![], Some(NegativeResponseCode::from(data[0])))
    } else {
        (data.to_vec(), None)
    };
    Ok(DiagnosticResponse {
        source_address,
        target_address,
        service_id,
        identifier,
        payload: payload_data,
        nrc,
    })
}

fn decode_diagnostic_nack(payload: &[u8]) -> Result<DiagnosticNack, DoIpCodecError> {
    if payload.len() != 5 {
        return Err(invalid_length(
            PayloadType::DiagnosticMessageNegativeAck,
            payload.len(),
        ));
    }
    Ok(DiagnosticNack {
        source_address: BigEndian::read_u16(&payload[0..2]),
        target_address: BigEndian::read_u16(&payload[2..4]),
        code: payload[4].into(),
    })
}

/// Decode a message sent by the gateway to a tester.
pub fn decode_reply(buffer: &[u8]) -> Result<GatewayReply, DoIpCodecError> {
    let (header, payload) = split_message(buffer)?;
    match PayloadType::from_value(header.payload_type) {
        Some(PayloadType::DiagnosticMessage) => decode_response(payload).map(GatewayReply::Response),
        Some(PayloadType::DiagnosticMessageNegativeAck) => {
            decode_diagnostic_nack(payload).map(GatewayReply::DiagnosticNack)
        }
        Some(PayloadType::GenericNack) => match payload {
            [code] => Ok(GatewayReply::GenericNack((*code).into())),
            _ => Err(invalid_length(PayloadType::GenericNack, payload.len())),
        },
        None => Err(DoIpCodecError::UnsupportedPayloadType(header.payload_type)),
    }
}

/// Encode a gateway reply into `buffer`, replacing its content.
pub fn encode_reply(reply: &GatewayReply, buffer: &mut Vec<u8>) {
    buffer.clear();
    buffer.resize(DOIP_HEADER_LENGTH, 0);
    match reply {
        GatewayReply::Response(rsp) => {
            let flags = match rsp.nrc {
                Some(_) => RESPONSE_FLAG_NEGATIVE,
                None => 0,
            };
            write_fixed(
                buffer,
                rsp.source_address,
                rsp.target_address,
                rsp.service_id,
                flags,
                rsp.identifier,
            );
            match rsp.nrc {
                Some(nrc) => buffer.push(nrc.into()),
                None => buffer.extend_from_slice(&rsp.payload),
            }
        }
        GatewayReply::DiagnosticNack(nack) => {
            let mut fixed = [0u8; 5];
            BigEndian::write_u16(&mut fixed[0..2], nack.source_address);
            BigEndian::write_u16(&mut fixed[2..4], nack.target_address);
            fixed[4] = nack.code.into();
            buffer.extend_from_slice(&fixed);
        }
        GatewayReply::GenericNack(code) => buffer.push((*code).into()),
    }
    let payload_length = (buffer.len() - DOIP_HEADER_LENGTH) as u32;
    let mut header = Vec::with_capacity(DOIP_HEADER_LENGTH);
    DoIpHeader::new(reply.payload_type(), payload_length).encode(&mut header);
    buffer[..DOIP_HEADER_LENGTH].copy_from_slice(&header);
}
