//! Encoding and decoding of SMPTE ST 291-1 ancillary data, packed into payloads as described in
//!  RFC 8331.

pub mod parity;
pub mod packet;
pub mod payload;

pub use payload::{packetize, payload_size_bytes, unpacketize, AncPacketErrors, AncPayloadReader, AncillaryDataPacket, FieldKind};
