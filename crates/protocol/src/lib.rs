//! Wire protocol for ODrive motor controllers over USB
//!
//! This crate is pure: it knows how frames, checksums, values and schemas
//! look on the wire, but performs no I/O. Transport and session handling live
//! in the `backend` crate.
//!
//! # Example
//!
//! ```
//! use protocol::{RequestFrame, ResponseFrame, Schema, EndpointValue, trailer_for};
//!
//! let schema = Schema::parse(
//!     r#"[{"name":"vbus_voltage","type":"float","access":"r","id":5}]"#,
//!     0,
//! ).unwrap();
//! let info = schema.resolve("vbus_voltage").unwrap();
//!
//! // Read request for the 4-byte float
//! let request = RequestFrame::read(1, info.id, 4, Vec::new(), trailer_for(info.id, schema.crc()));
//! let bytes = request.encode().unwrap();
//! assert_eq!(&bytes[..4], &[0x01, 0x00, 0x05, 0x80]);
//!
//! // Device answers with the echoed sequence and the value
//! let response = ResponseFrame::decode(&[0x01, 0x80, 0x00, 0x00, 0xc0, 0x41]).unwrap();
//! assert!(response.matches(request.sequence));
//! let value = EndpointValue::from_bytes(info.value_type.unwrap(), &response.body).unwrap();
//! assert_eq!(value.get::<f32>().unwrap(), 24.0);
//! ```

pub mod codec;
pub mod crc;
pub mod error;
pub mod schema;
pub mod types;
pub mod version;

pub use codec::{
    READ_FLAG, RequestFrame, ResponseFrame, SCHEMA_ENDPOINT_ID, SEQUENCE_MASK, SEQUENCE_MODULUS,
    SequenceCounter, schema_offset_payload, trailer_for,
};
pub use crc::{crc8, crc16, crc16_json};
pub use error::{ProtocolError, Result};
pub use schema::{Endpoint, EndpointInfo, EndpointKind, Schema};
pub use types::{EndpointValue, Scalar, ValueType};
pub use version::PROTOCOL_VERSION;
