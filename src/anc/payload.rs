//! An ANC payload is a 32-bit payload header followed by the packets back to back:
//!
//! ```ascii
//! 0: ANC_Count (16) | F (2) | reserved (14)
//! 4: packet 0 (see [crate::anc::packet])
//! *: packet 1 ...
//! ```

use std::borrow::Borrow;
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, error};
use crate::anc::packet::{packet_size_words, parse_packet, parse_packet_header, write_packet, AncPacket, PayloadErrorCounters, MAX_DATA_COUNT};
use crate::anc::parity::{check_parity_bits, with_parity_bits};
use crate::error::{CdiError, CdiResult};
use crate::safe_converter::PrecheckedCast;
use crate::sgl::SgList;

/// Field the ANC data belongs to, for interlaced video
#[repr(u8)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum FieldKind {
    #[default]
    Unspecified = 0,
    Invalid = 1,
    InterlacedFirst = 2,
    InterlacedSecond = 3,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AncillaryPayloadHeader {
    pub packet_count: u16,
    pub field_kind: FieldKind,
}

impl AncillaryPayloadHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u32>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        let field_kind: u8 = self.field_kind.into();
        buf.put_u32((self.packet_count as u32) << 16 | (field_kind as u32) << 14);
    }

    pub fn deser(buf: &mut impl Buf) -> CdiResult<Self> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(CdiError::InvalidParameter);
        }
        let raw = buf.get_u32();
        let field_kind = FieldKind::try_from_primitive(((raw >> 14) & 0x3) as u8)
            .map_err(|_| CdiError::InvalidPayload)?;

        Ok(AncillaryPayloadHeader {
            packet_count: (raw >> 16) as u16,
            field_kind,
        })
    }
}

/// An ANC packet as seen by the application, with 8-bit user data words. Parity bits are added
///  when encoding and checked when decoding.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AncillaryDataPacket {
    /// Byte offset of this packet inside the payload it was decoded from. Ignored for encoding.
    pub packet_offset: usize,
    /// Size of this packet in bytes as it was decoded, including padding. Ignored for encoding.
    pub packet_size: usize,
    pub is_color_difference_channel: bool,
    pub line_number: u16,
    pub horizontal_offset: u16,
    pub is_valid_source_stream_number: bool,
    pub source_stream_number: u8,
    pub did: u8,
    pub sdid: u8,
    /// at most 255 user data words
    pub user_data: Vec<u8>,
}

impl AncillaryDataPacket {
    pub fn data_count(&self) -> usize {
        self.user_data.len()
    }

    fn to_internal(&self) -> CdiResult<AncPacket> {
        if self.user_data.len() > MAX_DATA_COUNT {
            return Err(CdiError::InvalidParameter);
        }

        Ok(AncPacket {
            is_color_difference_channel: self.is_color_difference_channel,
            line_number: self.line_number,
            horizontal_offset: self.horizontal_offset,
            is_valid_source_stream_number: self.is_valid_source_stream_number,
            source_stream_number: self.source_stream_number,
            did: self.did,
            sdid: self.sdid,
            data_count: self.user_data.len() as u8,
            user_data: self.user_data.iter()
                .map(|&udw| with_parity_bits(udw))
                .collect(),
        })
    }

    /// Converts a decoded packet, counting parity errors in its user data words
    fn from_internal(packet: &AncPacket, packet_offset: usize, packet_size: usize, parity_errors: &mut u32) -> AncillaryDataPacket {
        AncillaryDataPacket {
            packet_offset,
            packet_size,
            is_color_difference_channel: packet.is_color_difference_channel,
            line_number: packet.line_number,
            horizontal_offset: packet.horizontal_offset,
            is_valid_source_stream_number: packet.is_valid_source_stream_number,
            source_stream_number: packet.source_stream_number,
            did: packet.did,
            sdid: packet.sdid,
            user_data: packet.user_data.iter()
                .map(|&udw| check_parity_bits(udw, parity_errors))
                .collect(),
        }
    }
}

/// Integrity problems of a single decoded packet, or of a whole payload when passed along with
///  the end-of-payload marker
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AncPacketErrors {
    pub has_parity_error: bool,
    pub has_checksum_error: bool,
}

impl From<&PayloadErrorCounters> for AncPacketErrors {
    fn from(value: &PayloadErrorCounters) -> Self {
        AncPacketErrors {
            has_parity_error: value.parity_errors != 0,
            has_checksum_error: value.checksum_errors != 0,
        }
    }
}

/// The number of bytes a payload with packets of the given data counts occupies
pub fn payload_size_bytes(data_counts: &[u8]) -> usize {
    let num_words = 1 + data_counts.iter()
        .map(|&data_count| packet_size_words(data_count))
        .sum::<usize>();
    num_words * 4
}

/// Serializes the packets returned by `produce_next` into `buffer`, until it returns `None`.
///  Returns the payload size in bytes.
///
/// If the packets do not fit into the buffer, nothing is reported as written and the result is
///  `BufferOverflow`. The payload header is written last, once the number of packets is known.
pub fn packetize<P: Borrow<AncillaryDataPacket>>(
    mut produce_next: impl FnMut() -> Option<P>,
    field_kind: FieldKind,
    buffer: &mut [u8],
) -> CdiResult<usize> {
    let mut offset_words = 1;
    let mut total_size = AncillaryPayloadHeader::SERIALIZED_LEN;
    let mut packet_count = 0usize;

    while let Some(packet) = produce_next() {
        let packet = packet.borrow().to_internal()?;

        total_size += packet_size_words(packet.data_count) * 4;
        if total_size > buffer.len() {
            debug!("ANC payload exceeds buffer size of {} bytes", buffer.len());
            return Err(CdiError::BufferOverflow);
        }
        if packet_count == u16::MAX as usize {
            return Err(CdiError::InvalidParameter);
        }

        offset_words += write_packet(&mut buffer[offset_words * 4..], &packet)?;
        packet_count += 1;
    }

    if buffer.len() < AncillaryPayloadHeader::SERIALIZED_LEN {
        return Err(CdiError::BufferOverflow);
    }
    let header = AncillaryPayloadHeader {
        packet_count: packet_count.prechecked_cast(),
        field_kind,
    };
    header.ser(&mut &mut buffer[..AncillaryPayloadHeader::SERIALIZED_LEN]);

    Ok(total_size)
}

/// Walks all packet headers to check that the declared packet count and the packets' declared
///  sizes add up to exactly the payload size
fn precheck_payload(buffer: &[u8]) -> CdiResult<AncillaryPayloadHeader> {
    if buffer.len() % 4 != 0 || buffer.len() < AncillaryPayloadHeader::SERIALIZED_LEN {
        return Err(CdiError::InvalidParameter);
    }
    let size_in_words = buffer.len() / 4;

    let header = AncillaryPayloadHeader::deser(&mut &buffer[..])?;

    let mut packet = AncPacket::default();
    let mut errors = PayloadErrorCounters::default();
    let mut remaining = header.packet_count;
    let mut offset = 1;
    while offset < size_in_words && remaining != 0 {
        parse_packet_header(&buffer[offset * 4..], &mut packet, &mut errors)?;
        offset += packet_size_words(packet.data_count);
        remaining -= 1;
    }

    if offset != size_in_words || remaining != 0 {
        debug!("ANC payload of {} bytes does not match its {} declared packets", buffer.len(), header.packet_count);
        return Err(CdiError::InvalidPayload);
    }
    Ok(header)
}

/// Decodes the packets of an ANC payload one at a time. The payload's structure is checked when
///  the reader is created, so a reader never yields packets from a truncated payload.
pub struct AncPayloadReader {
    buffer: Bytes,
    header: AncillaryPayloadHeader,
    remaining: u16,
    offset_words: usize,
    errors: PayloadErrorCounters,
}

impl AncPayloadReader {
    pub fn new(sgl: &SgList) -> CdiResult<AncPayloadReader> {
        let buffer = sgl.linearize();
        let header = precheck_payload(&buffer)?;

        Ok(AncPayloadReader {
            buffer,
            header,
            remaining: header.packet_count,
            offset_words: 1,
            errors: PayloadErrorCounters::default(),
        })
    }

    pub fn field_kind(&self) -> FieldKind {
        self.header.field_kind
    }

    pub fn packet_count(&self) -> u16 {
        self.header.packet_count
    }

    /// accumulated over the packets decoded so far
    pub fn errors(&self) -> &PayloadErrorCounters {
        &self.errors
    }

    pub fn is_finished(&self) -> bool {
        self.remaining == 0 && self.offset_words * 4 == self.buffer.len()
    }
}

impl Iterator for AncPayloadReader {
    type Item = (AncillaryDataPacket, AncPacketErrors);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let mut internal = AncPacket::default();
        let mut packet_errors = PayloadErrorCounters::default();
        let size = match parse_packet(&self.buffer[self.offset_words * 4..], &mut internal, &mut packet_errors) {
            Ok(size) => size,
            Err(e) => {
                error!("failed to parse ANC packet at word {} of a prechecked payload: {}", self.offset_words, e);
                self.remaining = 0;
                return None;
            }
        };

        let packet = AncillaryDataPacket::from_internal(&internal, self.offset_words * 4, size * 4, &mut packet_errors.parity_errors);

        self.offset_words += size;
        self.remaining -= 1;
        self.errors.add_errors(&packet_errors);

        Some((packet, (&packet_errors).into()))
    }
}

/// Decodes an ANC payload, passing each packet to `consume_next`, followed by a final call with
///  `None` and the payload's aggregated error flags.
///
/// Structural problems are detected before the first packet is decoded: a payload size that is not
///  a positive multiple of 4 is an `InvalidParameter`, a payload whose packets do not add up to its
///  size is an `InvalidPayload`. In both cases `consume_next` is not called at all. Parity or
///  checksum errors do not stop decoding, they are reported as `RxPayloadError` at the end.
pub fn unpacketize(
    sgl: &SgList,
    mut consume_next: impl FnMut(FieldKind, Option<AncillaryDataPacket>, AncPacketErrors),
) -> CdiResult<()> {
    let mut reader = AncPayloadReader::new(sgl)?;
    let field_kind = reader.field_kind();

    for (packet, errors) in reader.by_ref() {
        consume_next(field_kind, Some(packet), errors);
    }

    if !reader.is_finished() {
        return Err(CdiError::InvalidPayload);
    }

    let payload_errors = *reader.errors();
    consume_next(field_kind, None, (&payload_errors).into());

    if payload_errors.has_errors() {
        return Err(CdiError::RxPayloadError);
    }
    Ok(())
}
