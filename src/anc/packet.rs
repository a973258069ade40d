//! Wire format of a single ancillary data packet (RFC 8331 section 2.1). All words are 32-bit big
//!  endian:
//!
//! ```ascii
//! word 0:  C (1) | line number (11) | horizontal offset (12) | S (1) | stream number (7)
//! word 1:  DID (10) | SDID (10) | DATA_COUNT (10) | 2 MSBs of the first user data word
//! word 2+: 10-bit user data words, followed by a 10-bit checksum word, zero padded to
//!          the next word boundary
//! ```
//!
//! DID, SDID and DATA_COUNT are 8-bit values with two parity bits. The checksum is the 9-bit sum of
//!  DID through the last user data word, with the inverse of its bit 8 as bit 9.

use std::iter::once;
use bytes::{Buf, BufMut};
use tracing::trace;
use crate::anc::parity::{check_parity_bits, finish_checksum, with_parity_bits};
use crate::error::{CdiError, CdiResult};
use crate::safe_converter::SafeCast;

pub const PACKET_HEADER_WORDS: usize = 2;
pub const MAX_DATA_COUNT: usize = 255;
/// size of a packet with [MAX_DATA_COUNT] user data words
pub const MAX_PACKET_WORDS: usize = 82;

/// An ANC packet as it is represented on the wire, i.e. with 10-bit user data words. The first
///  `data_count` entries of `user_data` are the user data words.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AncPacket {
    pub is_color_difference_channel: bool,
    /// 11 bits
    pub line_number: u16,
    /// 12 bits
    pub horizontal_offset: u16,
    pub is_valid_source_stream_number: bool,
    /// 7 bits
    pub source_stream_number: u8,
    pub did: u8,
    pub sdid: u8,
    pub data_count: u8,
    pub user_data: Vec<u16>,
}

impl AncPacket {
    fn validate(&self) -> CdiResult<()> {
        if self.line_number > 0x7ff || self.horizontal_offset > 0xfff || self.source_stream_number > 0x7f {
            return Err(CdiError::InvalidParameter);
        }
        if self.user_data.len() != self.data_count.safe_cast() {
            return Err(CdiError::InvalidParameter);
        }
        if self.user_data.iter().any(|&udw| udw > 0x3ff) {
            return Err(CdiError::InvalidParameter);
        }
        Ok(())
    }
}

/// Error counts of parsing one packet or payload. `checksum` is the running checksum of the
///  packet currently being parsed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PayloadErrorCounters {
    pub checksum: u32,
    pub checksum_errors: u32,
    pub parity_errors: u32,
}

impl PayloadErrorCounters {
    pub fn has_errors(&self) -> bool {
        self.checksum_errors != 0 || self.parity_errors != 0
    }

    pub fn add_errors(&mut self, other: &PayloadErrorCounters) {
        self.checksum_errors += other.checksum_errors;
        self.parity_errors += other.parity_errors;
    }
}

/// Position of user data word `i` for `i % 16`. User data words repeat their alignment every 16
///  words, i.e. every 5 network words. `word` is relative to packet word `1 + 5 * (i / 16)`, `msb`
///  is the bit index (31 is the first bit on the wire) of the word's most significant bit. Words
///  with `msb < 9` continue at the top of the following network word.
const UDW_LAYOUT: [UdwLayout; 16] = [
    UdwLayout { word: 0, msb: 1 },
    UdwLayout { word: 1, msb: 23 },
    UdwLayout { word: 1, msb: 13 },
    UdwLayout { word: 1, msb: 3 },
    UdwLayout { word: 2, msb: 25 },
    UdwLayout { word: 2, msb: 15 },
    UdwLayout { word: 2, msb: 5 },
    UdwLayout { word: 3, msb: 27 },
    UdwLayout { word: 3, msb: 17 },
    UdwLayout { word: 3, msb: 7 },
    UdwLayout { word: 4, msb: 29 },
    UdwLayout { word: 4, msb: 19 },
    UdwLayout { word: 4, msb: 9 },
    UdwLayout { word: 5, msb: 31 },
    UdwLayout { word: 5, msb: 21 },
    UdwLayout { word: 5, msb: 11 },
];

#[derive(Clone, Copy)]
struct UdwLayout {
    word: usize,
    msb: u32,
}

/// A contiguous range of bits inside one network word that holds (part of) a 10-bit value
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct BitRange {
    word: usize,
    lsb: u32,
    width: u32,
    /// position of this range's LSB inside the 10-bit value
    shift: u32,
}

impl BitRange {
    fn mask(&self) -> u32 {
        (1 << self.width) - 1
    }

    fn extract(&self, words: &[u32]) -> u16 {
        (((words[self.word] >> self.lsb) & self.mask()) << self.shift) as u16
    }

    fn insert(&self, words: &mut [u32], value: u16) {
        words[self.word] |= ((value as u32 >> self.shift) & self.mask()) << self.lsb;
    }
}

/// The bit ranges holding user data word `index`, most significant part first. The checksum is
///  located like the user data word following the last one.
fn udw_bit_ranges(index: usize) -> (BitRange, Option<BitRange>) {
    let layout = UDW_LAYOUT[index % 16];
    let word = 1 + 5 * (index / 16) + layout.word;

    if layout.msb >= 9 {
        (BitRange { word, lsb: layout.msb - 9, width: 10, shift: 0 }, None)
    }
    else {
        let high_width = layout.msb + 1;
        let low_width = 10 - high_width;
        (
            BitRange { word, lsb: 0, width: high_width, shift: low_width },
            Some(BitRange { word: word + 1, lsb: 32 - low_width, width: low_width, shift: 0 }),
        )
    }
}

/// Packet size in 32-bit words: 62 header bits, 10 bits per user data word and 10 checksum bits,
///  rounded up to a full word.
pub fn packet_size_words(data_count: u8) -> usize {
    let data_count: usize = data_count.safe_cast();
    (62 + 10 * data_count + 10).div_ceil(32)
}

fn read_words(words: &[u8], dest: &mut [u32]) {
    let mut buf = &words[..dest.len() * 4];
    for word in dest.iter_mut() {
        *word = buf.get_u32();
    }
}

/// Parses the two header words, leaving the 2 MSBs of the first user data word in `user_data[0]`.
///  `user_data` is sized to hold `data_count` user data words plus the checksum.
pub fn parse_packet_header(words: &[u8], packet: &mut AncPacket, errors: &mut PayloadErrorCounters) -> CdiResult<()> {
    if words.len() < PACKET_HEADER_WORDS * 4 {
        return Err(CdiError::InvalidPayload);
    }

    let mut buf = words;
    let word0 = buf.get_u32();
    let word1 = buf.get_u32();

    packet.is_color_difference_channel = word0 >> 31 != 0;
    packet.line_number = ((word0 >> 20) & 0x7ff) as u16;
    packet.horizontal_offset = ((word0 >> 8) & 0xfff) as u16;
    packet.is_valid_source_stream_number = (word0 >> 7) & 1 != 0;
    packet.source_stream_number = (word0 & 0x7f) as u8;

    let raw_did = ((word1 >> 22) & 0x3ff) as u16;
    let raw_sdid = ((word1 >> 12) & 0x3ff) as u16;
    let raw_data_count = ((word1 >> 2) & 0x3ff) as u16;
    packet.did = check_parity_bits(raw_did, &mut errors.parity_errors);
    packet.sdid = check_parity_bits(raw_sdid, &mut errors.parity_errors);
    packet.data_count = check_parity_bits(raw_data_count, &mut errors.parity_errors);

    packet.user_data.clear();
    packet.user_data.resize(packet.data_count.safe_cast() + 1, 0);
    packet.user_data[0] = ((word1 & 0x3) << 8) as u16;

    errors.checksum = raw_did as u32 + raw_sdid as u32 + raw_data_count as u32;
    Ok(())
}

/// Parses a packet starting at the beginning of `words`, returning the number of 32-bit words it
///  occupies. Parity and checksum mismatches are counted in `errors`, they do not cause parsing
///  to fail. The only error is a buffer that is too short for the packet's declared size.
pub fn parse_packet(words: &[u8], packet: &mut AncPacket, errors: &mut PayloadErrorCounters) -> CdiResult<usize> {
    parse_packet_header(words, packet, errors)?;

    let data_count: usize = packet.data_count.safe_cast();
    let size = packet_size_words(packet.data_count);
    if words.len() < size * 4 {
        return Err(CdiError::InvalidPayload);
    }

    let mut net_words = [0u32; MAX_PACKET_WORDS];
    read_words(words, &mut net_words[..size]);

    for index in 0..=data_count {
        let (high, low) = udw_bit_ranges(index);
        let mut value = packet.user_data[index];
        for range in once(high).chain(low) {
            // header bits were taken care of by the header parser
            if range.word >= PACKET_HEADER_WORDS {
                value |= range.extract(&net_words);
            }
        }
        packet.user_data[index] = value;

        if index < data_count {
            errors.checksum += value as u32;
        }
    }

    let transmitted_checksum = packet.user_data[data_count];
    packet.user_data.truncate(data_count);

    let checksum = finish_checksum(errors.checksum);
    if checksum != transmitted_checksum {
        trace!("ANC packet checksum mismatch: calculated {:#x}, received {:#x}", checksum, transmitted_checksum);
        errors.checksum_errors += 1;
    }

    Ok(size)
}

fn header_words(packet: &AncPacket, checksum: &mut u32) -> (u32, u32) {
    let word0 = (packet.is_color_difference_channel as u32) << 31
        | (packet.line_number as u32) << 20
        | (packet.horizontal_offset as u32) << 8
        | (packet.is_valid_source_stream_number as u32) << 7
        | packet.source_stream_number as u32;

    let did = with_parity_bits(packet.did);
    let sdid = with_parity_bits(packet.sdid);
    let data_count = with_parity_bits(packet.data_count);
    *checksum = did as u32 + sdid as u32 + data_count as u32;

    // an empty packet has the checksum in place of the first user data word
    let udw0 = match packet.user_data.first() {
        Some(&udw) if packet.data_count > 0 => udw,
        _ => finish_checksum(*checksum),
    };

    let word1 = (did as u32) << 22
        | (sdid as u32) << 12
        | (data_count as u32) << 2
        | (udw0 as u32) >> 8;

    (word0, word1)
}

/// Writes the two header words and seeds `checksum`
pub fn write_packet_header(words: &mut [u8], packet: &AncPacket, checksum: &mut u32) -> CdiResult<()> {
    packet.validate()?;
    if words.len() < PACKET_HEADER_WORDS * 4 {
        return Err(CdiError::BufferOverflow);
    }

    let (word0, word1) = header_words(packet, checksum);
    let mut buf = &mut words[..PACKET_HEADER_WORDS * 4];
    buf.put_u32(word0);
    buf.put_u32(word1);
    Ok(())
}

/// Writes a complete packet, returning the number of 32-bit words written
pub fn write_packet(words: &mut [u8], packet: &AncPacket) -> CdiResult<usize> {
    packet.validate()?;
    let size = packet_size_words(packet.data_count);
    if words.len() < size * 4 {
        return Err(CdiError::BufferOverflow);
    }

    let mut checksum = 0;
    let mut net_words = [0u32; MAX_PACKET_WORDS];
    let (word0, word1) = header_words(packet, &mut checksum);
    net_words[0] = word0;
    net_words[1] = word1;

    let data_count: usize = packet.data_count.safe_cast();
    for index in 0..=data_count {
        let value = if index < data_count {
            let udw = packet.user_data[index];
            checksum += udw as u32;
            udw
        }
        else {
            finish_checksum(checksum)
        };

        let (high, low) = udw_bit_ranges(index);
        for range in once(high).chain(low) {
            if range.word >= PACKET_HEADER_WORDS {
                range.insert(&mut net_words, value);
            }
        }
    }

    let mut buf = &mut words[..size * 4];
    for word in &net_words[..size] {
        buf.put_u32(*word);
    }
    Ok(size)
}
