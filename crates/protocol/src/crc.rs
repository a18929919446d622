//! Checksums used by the device protocol
//!
//! Both CRCs are plain MSB-first, non-reflected, table-free bitwise CRCs:
//! - CRC-8: polynomial 0x37, initial remainder 0x42
//! - CRC-16: polynomial 0x3D65, initial remainder 0x1337
//!
//! The JSON schema CRC runs the same CRC-16 over the full schema text but is
//! seeded with [`PROTOCOL_VERSION`]. The device computes the same value over
//! its own schema and ignores any request whose trailer does not match, so a
//! client holding a stale schema cannot clobber endpoints by id.
//!
//! # Usage
//!
//! ```
//! use protocol::crc::{crc16, crc16_json};
//!
//! assert_eq!(crc16(b"123456789"), 0xAA01);
//! let token = crc16_json(br#"[{"name":"vbus_voltage","type":"float","access":"r","id":5}]"#);
//! assert_eq!(token, 0x6DA6);
//! ```

use crate::version::PROTOCOL_VERSION;

/// CRC-8 generator polynomial
pub const CRC8_POLYNOMIAL: u8 = 0x37;
/// CRC-8 initial remainder
pub const CRC8_INIT: u8 = 0x42;
/// CRC-16 generator polynomial
pub const CRC16_POLYNOMIAL: u16 = 0x3d65;
/// CRC-16 initial remainder
pub const CRC16_INIT: u16 = 0x1337;

/// Continue a CRC-8 computation from `remainder` over `data`
pub fn crc8_update(mut remainder: u8, data: &[u8]) -> u8 {
    for &byte in data {
        remainder ^= byte;
        for _ in 0..8 {
            remainder = if remainder & 0x80 != 0 {
                (remainder << 1) ^ CRC8_POLYNOMIAL
            } else {
                remainder << 1
            };
        }
    }
    remainder
}

/// Continue a CRC-16 computation from `remainder` over `data`
pub fn crc16_update(mut remainder: u16, data: &[u8]) -> u16 {
    for &byte in data {
        remainder ^= u16::from(byte) << 8;
        for _ in 0..8 {
            remainder = if remainder & 0x8000 != 0 {
                (remainder << 1) ^ CRC16_POLYNOMIAL
            } else {
                remainder << 1
            };
        }
    }
    remainder
}

/// CRC-8 over `data`
#[inline]
pub fn crc8(data: &[u8]) -> u8 {
    crc8_update(CRC8_INIT, data)
}

/// CRC-16 over `data`
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(CRC16_INIT, data)
}

/// Schema compatibility token: CRC-16 over the concatenated JSON text
#[inline]
pub fn crc16_json(json: &[u8]) -> u16 {
    crc16_update(PROTOCOL_VERSION, json)
}
