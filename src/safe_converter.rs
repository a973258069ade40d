//! Width conversions that show up on the wire paths. Widening conversions go through [SafeCast]
//!  so call sites do not accumulate `as` casts that silently truncate if a type changes later.

pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<usize> for u8 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// For narrowing casts where the surrounding logic has already checked the range, e.g. a packet
///  count that was compared against `u16::MAX` before.
/// NB: The implementations panic if that check was missing
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: value range should have been checked before")
    }
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: value range should have been checked before")
    }
}
