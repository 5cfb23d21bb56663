//! CAN side of the gateway.
//!
//! A diagnostic service frame ([`CanMessage`]) is carried on the bus as one or
//! more classic CAN frames ([`CanFrame`], at most 8 data bytes). The message
//! body `[service_id][identifier:2][data]` is segmented the ISO-TP way:
//!
//! - up to [`SINGLE_FRAME_CAPACITY`] body bytes fit a single frame
//!   `[0x0L][body]`;
//! - longer bodies start with a first frame `[0x1H][LL][6 bytes]` declaring the
//!   total length (at most [`MAX_MESSAGE_LENGTH`]), followed by consecutive
//!   frames `[0x2N][up to 7 bytes]` whose index `N` starts at 1 and wraps
//!   modulo 16.
//!
//! No flow control frame is exchanged: the bus transport delivers frames in
//! order.

use byteorder::{BigEndian, ByteOrder};
use log::{trace, warn};
use thiserror::Error;

use crate::message::{CanId, DiagnosticRequest, DiagnosticResponse, LogicalAddress};
use crate::nrc::NegativeResponseCode;

/// Data bytes of a classic CAN frame.
pub const CAN_MAX_DATA_LENGTH: usize = 8;
/// Body bytes carried by a single frame.
pub const SINGLE_FRAME_CAPACITY: usize = 7;
/// Body bytes carried by a first frame.
pub const FIRST_FRAME_CAPACITY: usize = 6;
/// Body bytes carried by a consecutive frame.
pub const CONSECUTIVE_FRAME_CAPACITY: usize = 7;
/// Longest body a first frame can declare.
pub const MAX_MESSAGE_LENGTH: usize = 0x0fff;
/// `[service_id][identifier:2]`
pub const SERVICE_HEADER_LENGTH: usize = 3;
/// Service byte of a UDS negative response.
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7f;
/// Added to a request service byte in a UDS positive response.
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

const SF_PCI: u8 = 0x00;
const FF_PCI: u8 = 0x10;
const CF_PCI: u8 = 0x20;

/// Errors of the CAN codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CanCodecError {
    /// Not enough bytes for the announced content.
    #[error("frame too short: {length} bytes, {minimum} required")]
    FrameTooShort {
        /// Bytes available.
        length: usize,
        /// Bytes required.
        minimum: usize,
    },
    /// The CAN identifier is not the one of the expected class.
    #[error("unexpected CAN identifier 0x{actual:03x}, expected 0x{expected:03x}")]
    UnexpectedIdentifier {
        /// Expected identifier.
        expected: CanId,
        /// Received identifier.
        actual: CanId,
    },
    /// More than 8 data bytes in a frame.
    #[error("frame of {0} data bytes exceeds the CAN limit")]
    FrameTooLong(usize),
    /// A message body too long to be segmented.
    #[error("message body of {0} bytes cannot be segmented")]
    MessageTooLong(usize),
    /// A protocol control byte of unknown kind.
    #[error("invalid protocol control information 0x{0:02x}")]
    InvalidPci(u8),
    /// A consecutive frame with an unexpected index.
    #[error("consecutive frame index {actual}, expected {expected}")]
    SequenceError {
        /// Expected index.
        expected: u8,
        /// Received index.
        actual: u8,
    },
    /// A consecutive frame without a first frame.
    #[error("consecutive frame without first frame")]
    UnexpectedConsecutiveFrame,
    /// A response whose service byte is neither positive nor negative.
    #[error("service 0x{0:02x} is not a response service")]
    InvalidResponseService(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A classic CAN frame.
pub struct CanFrame {
    /// CAN identifier.
    pub id: CanId,
    /// Data bytes, at most [`CAN_MAX_DATA_LENGTH`].
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Build a frame, checking the data length.
    pub fn new(id: CanId, data: Vec<u8>) -> Result<Self, CanCodecError> {
        if data.len() > CAN_MAX_DATA_LENGTH {
            return Err(CanCodecError::FrameTooLong(data.len()));
        }
        Ok(CanFrame { id, data })
    }

    /// Byte form `[id:2][data]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; 2];
        BigEndian::write_u16(&mut bytes[0..2], self.id);
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Parse the byte form `[id:2][data]`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CanCodecError> {
        if bytes.len() < 2 {
            return Err(CanCodecError::FrameTooShort {
                length: bytes.len(),
                minimum: 2,
            });
        }
        CanFrame::new(BigEndian::read_u16(&bytes[0..2]), bytes[2..].to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A diagnostic service frame exchanged with an ECU.
pub struct CanMessage {
    /// Request or response identifier of the route.
    pub can_id: CanId,
    /// UDS service byte.
    pub service_id: u8,
    /// Data identifier.
    pub identifier: u16,
    /// Service data.
    pub data: Vec<u8>,
}

impl CanMessage {
    /// The bus form of a tester request, for the route's request identifier.
    pub fn request(request_id: CanId, request: &DiagnosticRequest) -> Self {
        CanMessage {
            can_id: request_id,
            service_id: request.service_id,
            identifier: request.identifier,
            data: vec![],
        }
    }

    /// A UDS positive response to `service_id`.
    pub fn positive_response(
        response_id: CanId,
        service_id: u8,
        identifier: u16,
        data: Vec<u8>,
    ) -> Self {
        CanMessage {
            can_id: response_id,
            service_id: service_id.wrapping_add(POSITIVE_RESPONSE_OFFSET),
            identifier,
            data,
        }
    }

    /// A UDS negative response to `service_id`.
    pub fn negative_response(
        response_id: CanId,
        service_id: u8,
        identifier: u16,
        nrc: NegativeResponseCode,
    ) -> Self {
        CanMessage {
            can_id: response_id,
            service_id: NEGATIVE_RESPONSE_SID,
            identifier,
            data: vec![service_id, nrc.into()],
        }
    }

    /// Interpret an ECU response, attributing it to `source_address`.
    ///
    /// The target address of the result is left to the caller, which knows
    /// the tester the response goes back to.
    pub fn into_response(
        self,
        source_address: LogicalAddress,
    ) -> Result<DiagnosticResponse, CanCodecError> {
        let (service_id, payload, nrc) = match self.service_id {
            NEGATIVE_RESPONSE_SID => match self.data[..] {
                [service_id, nrc] => (service_id, vec![], Some(NegativeResponseCode::from(nrc))),
                _ => {
                    return Err(CanCodecError::FrameTooShort {
                        length: SERVICE_HEADER_LENGTH + self.data.len(),
                        minimum: SERVICE_HEADER_LENGTH + 2,
                    })
                }
            },
            sid if sid >= POSITIVE_RESPONSE_OFFSET => {
                (sid - POSITIVE_RESPONSE_OFFSET, self.data, None)
            }
            sid => return Err(CanCodecError::InvalidResponseService(sid)),
        };
        Ok(DiagnosticResponse {
            source_address,
            target_address: 0,
            service_id,
            identifier: self.identifier,
            payload,
            nrc,
        })
    }

    /// Take an ECU response echoing the request service byte as a positive
    /// response from `source_address`.
    pub fn into_echoed_response(self, source_address: LogicalAddress) -> DiagnosticResponse {
        DiagnosticResponse {
            source_address,
            target_address: 0,
            service_id: self.service_id,
            identifier: self.identifier,
            payload: self.data,
            nrc: None,
        }
    }

    /// Flat form `[can_id:2][service_id][identifier:2][data]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; 2];
        BigEndian::write_u16(&mut bytes[0..2], self.can_id);
        bytes.extend_from_slice(&self.body());
        bytes
    }

    /// Parse the flat form, expecting the identifier `expected_id`.
    pub fn decode(bytes: &[u8], expected_id: CanId) -> Result<Self, CanCodecError> {
        let minimum = 2 + SERVICE_HEADER_LENGTH;
        if bytes.len() < minimum {
            return Err(CanCodecError::FrameTooShort {
                length: bytes.len(),
                minimum,
            });
        }
        let can_id = BigEndian::read_u16(&bytes[0..2]);
        if can_id != expected_id {
            return Err(CanCodecError::UnexpectedIdentifier {
                expected: expected_id,
                actual: can_id,
            });
        }
        CanMessage::from_body(can_id, &bytes[2..])
    }

    fn body(&self) -> Vec<u8> {
        let mut body = vec![0u8; SERVICE_HEADER_LENGTH];
        body[0] = self.service_id;
        BigEndian::write_u16(&mut body[1..3], self.identifier);
        body.extend_from_slice(&self.data);
        body
    }

    fn from_body(can_id: CanId, body: &[u8]) -> Result<Self, CanCodecError> {
        if body.len() < SERVICE_HEADER_LENGTH {
            return Err(CanCodecError::FrameTooShort {
                length: body.len(),
                minimum: SERVICE_HEADER_LENGTH,
            });
        }
        Ok(CanMessage {
            can_id,
            service_id: body[0],
            identifier: BigEndian::read_u16(&body[1..3]),
            data: body[SERVICE_HEADER_LENGTH..].to_vec(),
        })
    }

    /// Split the message into the CAN frames carrying it on the bus.
    pub fn to_frames(&self) -> Result<Vec<CanFrame>, CanCodecError> {
        let body = self.body();
        let total = body.len();
        if total <= SINGLE_FRAME_CAPACITY {
            let mut data = Vec::with_capacity(1 + total);
            data.push(SF_PCI | total as u8);
            data.extend_from_slice(&body);
            return Ok(vec![CanFrame {
                id: self.can_id,
                data,
            }]);
        }
        if total > MAX_MESSAGE_LENGTH {
            return Err(CanCodecError::MessageTooLong(total));
        }

        let mut frames = Vec::with_capacity(
            1 + (total - FIRST_FRAME_CAPACITY).div_ceil(CONSECUTIVE_FRAME_CAPACITY),
        );
        let mut first = vec![FF_PCI | (total >> 8) as u8, total as u8];
        first.extend_from_slice(&body[..FIRST_FRAME_CAPACITY]);
        frames.push(CanFrame {
            id: self.can_id,
            data: first,
        });
        for (n, chunk) in body[FIRST_FRAME_CAPACITY..]
            .chunks(CONSECUTIVE_FRAME_CAPACITY)
            .enumerate()
        {
            let mut data = Vec::with_capacity(1 + chunk.len());
            data.push(CF_PCI | ((n + 1) & 0x0f) as u8);
            data.extend_from_slice(chunk);
            frames.push(CanFrame {
                id: self.can_id,
                data,
            });
        }
        trace!(target: "can", "0x{:03x}: {} bytes segmented in {} frames", self.can_id, total, frames.len());
        Ok(frames)
    }
}

struct Partial {
    expected_len: usize,
    next_index: u8,
    body: Vec<u8>,
}

/// Rebuilds the messages sent on one CAN identifier.
pub struct Reassembler {
    id: CanId,
    partial: Option<Partial>,
}

impl Reassembler {
    /// Reassembler accepting frames of `id` only.
    pub fn new(id: CanId) -> Self {
        Reassembler { id, partial: None }
    }

    /// Whether a segmented message is partially received.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Feed one frame. Returns the message once its last frame is received.
    ///
    /// On error any partially received message is dropped.
    pub fn push(&mut self, frame: &CanFrame) -> Result<Option<CanMessage>, CanCodecError> {
        let result = self.accept(frame);
        if result.is_err() {
            self.partial = None;
        }
        result
    }

    fn accept(&mut self, frame: &CanFrame) -> Result<Option<CanMessage>, CanCodecError> {
        if frame.id != self.id {
            return Err(CanCodecError::UnexpectedIdentifier {
                expected: self.id,
                actual: frame.id,
            });
        }
        let pci = *frame.data.first().ok_or(CanCodecError::FrameTooShort {
            length: 0,
            minimum: 1,
        })?;
        match pci & 0xf0 {
            SF_PCI => {
                self.discard_partial();
                let len = (pci & 0x0f) as usize;
                if len == 0 || len > SINGLE_FRAME_CAPACITY {
                    return Err(CanCodecError::InvalidPci(pci));
                }
                if frame.data.len() < 1 + len {
                    return Err(CanCodecError::FrameTooShort {
                        length: frame.data.len(),
                        minimum: 1 + len,
                    });
                }
                CanMessage::from_body(self.id, &frame.data[1..1 + len]).map(Some)
            }
            FF_PCI => {
                self.discard_partial();
                if frame.data.len() < 2 + FIRST_FRAME_CAPACITY {
                    return Err(CanCodecError::FrameTooShort {
                        length: frame.data.len(),
                        minimum: 2 + FIRST_FRAME_CAPACITY,
                    });
                }
                let expected_len = (((pci & 0x0f) as usize) << 8) | frame.data[1] as usize;
                if expected_len <= SINGLE_FRAME_CAPACITY {
                    return Err(CanCodecError::InvalidPci(pci));
                }
                let mut body = Vec::with_capacity(expected_len);
                body.extend_from_slice(&frame.data[2..2 + FIRST_FRAME_CAPACITY]);
                self.partial = Some(Partial {
                    expected_len,
                    next_index: 1,
                    body,
                });
                Ok(None)
            }
            CF_PCI => {
                let partial = self
                    .partial
                    .as_mut()
                    .ok_or(CanCodecError::UnexpectedConsecutiveFrame)?;
                let index = pci & 0x0f;
                if index != partial.next_index {
                    return Err(CanCodecError::SequenceError {
                        expected: partial.next_index,
                        actual: index,
                    });
                }
                let remaining = partial.expected_len - partial.body.len();
                let chunk = remaining.min(CONSECUTIVE_FRAME_CAPACITY);
                if frame.data.len() < 1 + chunk {
                    return Err(CanCodecError::FrameTooShort {
                        length: frame.data.len(),
                        minimum: 1 + chunk,
                    });
                }
                partial.body.extend_from_slice(&frame.data[1..1 + chunk]);
                partial.next_index = (partial.next_index + 1) & 0x0f;
                if partial.body.len() < partial.expected_len {
                    return Ok(None);
                }
                let body = std::mem::take(&mut partial.body);
                self.partial = None;
                CanMessage::from_body(self.id, &body).map(Some)
            }
            _ => Err(CanCodecError::InvalidPci(pci)),
        }
    }

    fn discard_partial(&mut self) {
        if let Some(partial) = self.partial.take() {
            warn!(
                target: "can",
                "0x{:03x}: dropping partial message ({}/{} bytes)",
                self.id,
                partial.body.len(),
                partial.expected_len
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(frames: &[CanFrame], id: CanId) -> Option<CanMessage> {
        let mut reassembler = Reassembler::new(id);
        let mut out = None;
        for frame in frames {
            out = reassembler.push(frame).unwrap();
        }
        out
    }

    #[test]
    fn vin_request_flat_layout() {
        let req = DiagnosticRequest {
            source_address: 0x0e80,
            target_address: 0x0205,
            service_id: 0x22,
            flags: 0,
            identifier: 0xf190,
        };
        let msg = CanMessage::request(0x600, &req);
        assert_eq!(msg.encode(), vec![0x06, 0x00, 0x22, 0xf1, 0x90]);
        assert_eq!(CanMessage::decode(&msg.encode(), 0x600), Ok(msg));
    }

    #[test]
    fn flat_decode_checks_class_and_length() {
        assert_eq!(
            CanMessage::decode(&[0x06, 0x01, 0x62, 0xf1, 0x90], 0x600),
            Err(CanCodecError::UnexpectedIdentifier {
                expected: 0x600,
                actual: 0x601
            })
        );
        assert_eq!(
            CanMessage::decode(&[0x06, 0x00, 0x22, 0xf1], 0x600),
            Err(CanCodecError::FrameTooShort {
                length: 4,
                minimum: 5
            })
        );
    }

    #[test]
    fn short_message_fits_single_frame() {
        let msg = CanMessage {
            can_id: 0x600,
            service_id: 0x22,
            identifier: 0xf190,
            data: vec![1, 2, 3, 4],
        };
        let frames = msg.to_frames().unwrap();
        assert_eq!(
            frames,
            vec![CanFrame {
                id: 0x600,
                data: vec![0x07, 0x22, 0xf1, 0x90, 1, 2, 3, 4]
            }]
        );
        assert_eq!(reassemble(&frames, 0x600), Some(msg));
    }

    #[test]
    fn vin_response_is_segmented() {
        let msg = CanMessage::positive_response(0x601, 0x22, 0xf190, b"1HGBH41JXMN109186".to_vec());
        let frames = msg.to_frames().unwrap();
        // 20 body bytes: 6 in the first frame, then 7 + 7.
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data[..2], [0x10, 20]);
        assert_eq!(frames[1].data[0], 0x21);
        assert_eq!(frames[2].data[0], 0x22);
        assert_eq!(frames[2].data.len(), 8);
        assert!(frames.iter().all(|f| f.data.len() <= CAN_MAX_DATA_LENGTH));
        assert_eq!(reassemble(&frames, 0x601), Some(msg));
    }

    #[test]
    fn consecutive_index_wraps() {
        let msg = CanMessage {
            can_id: 0x7e8,
            service_id: 0x62,
            identifier: 0x0100,
            data: (0..200u8).collect(),
        };
        let frames = msg.to_frames().unwrap();
        assert_eq!(frames[15].data[0], 0x2f);
        assert_eq!(frames[16].data[0], 0x20);
        assert_eq!(reassemble(&frames, 0x7e8), Some(msg));
    }

    #[test]
    fn oversized_message_is_refused() {
        let msg = CanMessage {
            can_id: 0x600,
            service_id: 0x2e,
            identifier: 0x0100,
            data: vec![0; MAX_MESSAGE_LENGTH],
        };
        assert_eq!(
            msg.to_frames(),
            Err(CanCodecError::MessageTooLong(MAX_MESSAGE_LENGTH + 3))
        );
    }

    #[test]
    fn reassembly_errors() {
        let mut reassembler = Reassembler::new(0x601);
        assert_eq!(
            reassembler.push(&CanFrame {
                id: 0x600,
                data: vec![0x03, 0x62, 0xf1, 0x90]
            }),
            Err(CanCodecError::UnexpectedIdentifier {
                expected: 0x601,
                actual: 0x600
            })
        );
        assert_eq!(
            reassembler.push(&CanFrame {
                id: 0x601,
                data: vec![0x21, 0, 0]
            }),
            Err(CanCodecError::UnexpectedConsecutiveFrame)
        );

        let msg = CanMessage::positive_response(0x601, 0x22, 0xf190, vec![0xaa; 20]);
        let frames = msg.to_frames().unwrap();
        assert_eq!(reassembler.push(&frames[0]), Ok(None));
        assert!(reassembler.in_progress());
        assert_eq!(
            reassembler.push(&frames[2]),
            Err(CanCodecError::SequenceError {
                expected: 1,
                actual: 2
            })
        );
        assert!(!reassembler.in_progress());
    }

    #[test]
    fn new_first_frame_restarts_message() {
        let msg = CanMessage::positive_response(0x601, 0x22, 0xf190, vec![0x55; 12]);
        let frames = msg.to_frames().unwrap();
        let mut reassembler = Reassembler::new(0x601);
        assert_eq!(reassembler.push(&frames[0]), Ok(None));
        let mut out = None;
        for frame in &frames {
            out = reassembler.push(frame).unwrap();
        }
        assert_eq!(out, Some(msg));
    }

    #[test]
    fn responses_map_to_request_service() {
        let positive = CanMessage::positive_response(0x601, 0x22, 0xf190, b"VIN".to_vec())
            .into_response(0x0205)
            .unwrap();
        assert_eq!(positive.service_id, 0x22);
        assert_eq!(positive.payload, b"VIN".to_vec());
        assert!(positive.is_positive());

        let negative = CanMessage::negative_response(
            0x601,
            0x22,
            0xf190,
            NegativeResponseCode::RequestOutOfRange,
        )
        .into_response(0x0205)
        .unwrap();
        assert_eq!(negative.service_id, 0x22);
        assert_eq!(negative.identifier, 0xf190);
        assert_eq!(negative.nrc, Some(NegativeResponseCode::RequestOutOfRange));
    }

    #[test]
    fn echoed_service_is_kept_as_is() {
        let echoed = CanMessage {
            can_id: 0x601,
            service_id: 0x85,
            identifier: 0x0002,
            data: vec![0x01],
        }
        .into_echoed_response(0x0205);
        assert_eq!(echoed.service_id, 0x85);
        assert_eq!(echoed.identifier, 0x0002);
        assert_eq!(echoed.payload, vec![0x01]);
        assert!(echoed.is_positive());
    }

    #[test]
    fn frame_byte_form() {
        let frame = CanFrame::new(0x601, vec![0x03, 0x62, 0xf1, 0x90]).unwrap();
        assert_eq!(frame.to_bytes(), vec![0x06, 0x01, 0x03, 0x62, 0xf1, 0x90]);
        assert_eq!(CanFrame::from_bytes(&frame.to_bytes()), Ok(frame));
        assert_eq!(
            CanFrame::new(0x601, vec![0; 9]),
            Err(CanCodecError::FrameTooLong(9))
        );
    }
}
