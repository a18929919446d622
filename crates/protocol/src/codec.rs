//! Wire frame encoding and decoding
//!
//! # Frame Format
//!
//! Requests (host -> device), all fields little-endian:
//! ```text
//! [sequence: u16][endpoint id | read flag: u16][expected response length: u16][payload][trailer: u16]
//! ```
//!
//! The read flag is bit 15 of the endpoint id field. The trailer is the JSON
//! schema CRC, except for requests against the schema endpoint itself, which
//! carry the protocol version (see [`trailer_for`]).
//!
//! Responses (device -> host):
//! ```text
//! [echoed sequence: u16][body]
//! ```
//!
//! The device may set bit 15 of the echoed sequence, so responses are matched
//! to requests on the low 14 bits only. An empty body is a valid response
//! that marks end-of-data when paging through the schema.

use crate::error::{ProtocolError, Result};
use crate::version::PROTOCOL_VERSION;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Fixed request header: sequence, endpoint id, expected length
pub const HEADER_LEN: usize = 6;

/// Trailing schema CRC / protocol version
pub const TRAILER_LEN: usize = 2;

/// Echoed sequence number in front of every response body
pub const RESPONSE_PREFIX_LEN: usize = 2;

/// Bit 15 of the endpoint id field marks a read request
pub const READ_FLAG: u16 = 0x8000;

/// Bits of the sequence field that carry the sequence number
pub const SEQUENCE_MASK: u16 = 0x3fff;

/// Sequence numbers wrap at this value
pub const SEQUENCE_MODULUS: u16 = 4096;

/// Reserved endpoint serving the JSON schema
pub const SCHEMA_ENDPOINT_ID: u16 = 0;

/// Largest endpoint id that leaves the read flag clear
pub const MAX_ENDPOINT_ID: u16 = READ_FLAG - 1;

/// Trailer to send with a request against `endpoint_id`
///
/// The schema endpoint is addressed before the schema CRC is known, so it is
/// always validated against the protocol version instead.
pub fn trailer_for(endpoint_id: u16, schema_crc: u16) -> u16 {
    if endpoint_id == SCHEMA_ENDPOINT_ID {
        PROTOCOL_VERSION
    } else {
        schema_crc
    }
}

/// Request payload for fetching the schema chunk at `offset`
pub fn schema_offset_payload(offset: u32) -> Vec<u8> {
    offset.to_le_bytes().to_vec()
}

/// Host-to-device request frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub sequence: u16,
    pub endpoint_id: u16,
    pub read: bool,
    pub expected_len: u16,
    pub payload: Vec<u8>,
    pub trailer: u16,
}

impl RequestFrame {
    /// Read request expecting `expected_len` response bytes
    pub fn read(
        sequence: u16,
        endpoint_id: u16,
        expected_len: u16,
        payload: Vec<u8>,
        trailer: u16,
    ) -> Self {
        Self {
            sequence,
            endpoint_id,
            read: true,
            expected_len,
            payload,
            trailer,
        }
    }

    /// Write request carrying `payload`; no response body is expected
    pub fn write(sequence: u16, endpoint_id: u16, payload: Vec<u8>, trailer: u16) -> Self {
        Self {
            sequence,
            endpoint_id,
            read: false,
            expected_len: 0,
            payload,
            trailer,
        }
    }

    /// Length of the encoded frame in bytes
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + TRAILER_LEN
    }

    /// Encode the frame for a single bulk-out transfer
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.endpoint_id > MAX_ENDPOINT_ID {
            return Err(ProtocolError::EndpointIdOutOfRange(self.endpoint_id));
        }
        if self.sequence > SEQUENCE_MASK {
            return Err(ProtocolError::SequenceOutOfRange(self.sequence));
        }

        let endpoint_field = if self.read {
            self.endpoint_id | READ_FLAG
        } else {
            self.endpoint_id
        };

        let mut frame = Vec::with_capacity(self.encoded_len());
        frame.write_u16::<LittleEndian>(self.sequence)?;
        frame.write_u16::<LittleEndian>(endpoint_field)?;
        frame.write_u16::<LittleEndian>(self.expected_len)?;
        frame.extend_from_slice(&self.payload);
        frame.write_u16::<LittleEndian>(self.trailer)?;
        Ok(frame)
    }

    /// Decode a request frame (used by device simulators and capture tools)
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let min_len = HEADER_LEN + TRAILER_LEN;
        if frame.len() < min_len {
            return Err(ProtocolError::IncompleteFrame {
                expected: min_len,
                actual: frame.len(),
            });
        }

        let mut header = Cursor::new(&frame[..HEADER_LEN]);
        let sequence = header.read_u16::<LittleEndian>()?;
        let endpoint_field = header.read_u16::<LittleEndian>()?;
        let expected_len = header.read_u16::<LittleEndian>()?;

        let trailer_start = frame.len() - TRAILER_LEN;
        let payload = frame[HEADER_LEN..trailer_start].to_vec();
        let trailer = Cursor::new(&frame[trailer_start..]).read_u16::<LittleEndian>()?;

        Ok(Self {
            sequence,
            endpoint_id: endpoint_field & !READ_FLAG,
            read: endpoint_field & READ_FLAG != 0,
            expected_len,
            payload,
            trailer,
        })
    }
}

/// Device-to-host response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Sequence as echoed by the device, flag bits included
    pub sequence: u16,
    pub body: Vec<u8>,
}

impl ResponseFrame {
    /// Split one bulk-in transfer into echoed sequence and body
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RESPONSE_PREFIX_LEN {
            return Err(ProtocolError::IncompleteFrame {
                expected: RESPONSE_PREFIX_LEN,
                actual: bytes.len(),
            });
        }
        let sequence = Cursor::new(bytes).read_u16::<LittleEndian>()?;
        Ok(Self {
            sequence,
            body: bytes[RESPONSE_PREFIX_LEN..].to_vec(),
        })
    }

    /// Encode a response the way a device would send it
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(RESPONSE_PREFIX_LEN + self.body.len());
        bytes.extend_from_slice(&self.sequence.to_le_bytes());
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Whether this response answers the request sent with `sequence`
    pub fn matches(&self, sequence: u16) -> bool {
        self.sequence & SEQUENCE_MASK == sequence & SEQUENCE_MASK
    }

    /// Empty body: the device has no more data at the requested offset
    pub fn is_end_of_data(&self) -> bool {
        self.body.is_empty()
    }
}

/// Per-session sequence number generator, wrapping modulo [`SEQUENCE_MODULUS`]
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    next: u16,
}

impl SequenceCounter {
    /// Counter starting at sequence 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter starting at an arbitrary sequence
    pub fn starting_at(sequence: u16) -> Self {
        Self {
            next: sequence % SEQUENCE_MODULUS,
        }
    }

    /// Take the next sequence number
    pub fn advance(&mut self) -> u16 {
        let sequence = self.next;
        self.next = (self.next + 1) % SEQUENCE_MODULUS;
        sequence
    }

    /// Sequence number the next call to [`advance`](Self::advance) returns
    pub fn peek(&self) -> u16 {
        self.next
    }
}
