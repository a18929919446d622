//! Protocol version
//!
//! The device firmware speaks a single framing version with no negotiation
//! step. It is carried in two places on the wire: as the trailer of every
//! request against the schema endpoint (the schema CRC is not known yet at
//! that point) and as the seed of the JSON schema CRC.

/// Framing protocol version understood by this crate
pub const PROTOCOL_VERSION: u16 = 1;
