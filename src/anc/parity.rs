//! Parity and checksum primitives of SMPTE ST 291-1. An 8-bit header value is transmitted as a
//!  10-bit word: bits 7-0 carry the value, bit 8 its even parity and bit 9 the inverted parity.

/// Even parity of a byte, i.e. `true` if the number of set bits is odd
pub fn parity8(value: u8) -> bool {
    value.count_ones() % 2 == 1
}

pub fn with_parity_bits(value: u8) -> u16 {
    let parity = parity8(value) as u16;
    ((parity ^ 1) << 9) | (parity << 8) | value as u16
}

/// Extracts the 8-bit value from a parity protected 10-bit word. A parity mismatch is counted in
///  `parity_errors`, but the value is returned anyway.
pub fn check_parity_bits(word: u16, parity_errors: &mut u32) -> u8 {
    let value = (word & 0xff) as u8;
    let parity = parity8(value);
    let bit8 = word & 0x100 != 0;
    let bit9 = word & 0x200 != 0;
    if bit8 != parity || bit9 == parity {
        *parity_errors += 1;
    }
    value
}

/// Turns a running checksum into the transmitted checksum word: the 9 LSBs of the sum, with bit 9
///  set to the inverse of bit 8.
pub fn finish_checksum(checksum: u32) -> u16 {
    ((checksum & 0x1ff) | ((!checksum & 0x100) << 1)) as u16
}
