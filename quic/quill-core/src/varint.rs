// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::{
    convert::{TryFrom, TryInto},
    fmt,
    ops::{Add, AddAssign, Deref, Sub, SubAssign},
};
use s2n_codec::{decoder_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-16
//# QUIC packets and frames commonly use a variable-length encoding for
//# non-negative integer values.  This encoding ensures that smaller
//# integer values need fewer bytes to encode.

//= https://www.rfc-editor.org/rfc/rfc9000#section-16
//# This means that integers are encoded on 1, 2, 4, or 8 bytes and can
//# encode 6-, 14-, 30-, or 62-bit values, respectively.

pub const MAX_VARINT_VALUE: u64 = (1 << 62) - 1;

const ONE_BYTE_MAX: u64 = (1 << 6) - 1;
const TWO_BYTE_MAX: u64 = (1 << 14) - 1;
const FOUR_BYTE_MAX: u64 = (1 << 30) - 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VarIntError;

impl fmt::Display for VarIntError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "varint range exceeded")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for VarIntError {}

/// A QUIC variable-length integer: an unsigned value less than `2^62`.
///
/// The type guarantees its contents are encodable, so encoding is
/// infallible; an attempt to construct an oversized value fails instead.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct VarInt(u64);

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl VarInt {
    pub const MAX: Self = Self(MAX_VARINT_VALUE);
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn new(value: u64) -> Result<Self, VarIntError> {
        if value > MAX_VARINT_VALUE {
            return Err(VarIntError);
        }
        Ok(Self(value))
    }

    /// Returns a `VarInt` without validating the value is in range
    ///
    /// # Safety
    ///
    /// Callers need to ensure the value is less than or equal to `VarInt::MAX`
    pub const unsafe fn new_unchecked(value: u64) -> Self {
        Self(value)
    }

    pub const fn from_u8(value: u8) -> Self {
        Self(value as u64)
    }

    pub const fn from_u16(value: u16) -> Self {
        Self(value as u64)
    }

    pub const fn from_u32(value: u32) -> Self {
        Self(value as u64)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        Self::new(self.0.checked_add(rhs.0)?).ok()
    }

    #[inline]
    pub fn checked_add_usize(self, rhs: usize) -> Option<Self> {
        let rhs: u64 = rhs.try_into().ok()?;
        self.checked_add(Self::new(rhs).ok()?)
    }

    #[inline]
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        Some(Self(self.0.checked_sub(rhs.0)?))
    }

    #[inline]
    pub fn checked_mul(self, rhs: Self) -> Option<Self> {
        Self::new(self.0.checked_mul(rhs.0)?).ok()
    }

    #[inline]
    pub fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0).min(MAX_VARINT_VALUE))
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// Returns the number of bytes the value occupies on the wire
    #[inline]
    pub fn encoding_size(self) -> usize {
        match self.0 {
            0..=ONE_BYTE_MAX => 1,
            0..=TWO_BYTE_MAX => 2,
            0..=FOUR_BYTE_MAX => 4,
            _ => 8,
        }
    }
}

impl Deref for VarInt {
    type Target = u64;

    #[inline]
    fn deref(&self) -> &u64 {
        &self.0
    }
}

impl From<VarInt> for u64 {
    #[inline]
    fn from(value: VarInt) -> Self {
        value.0
    }
}

impl From<u8> for VarInt {
    #[inline]
    fn from(value: u8) -> Self {
        Self(value as u64)
    }
}

impl From<u16> for VarInt {
    #[inline]
    fn from(value: u16) -> Self {
        Self(value as u64)
    }
}

impl From<u32> for VarInt {
    #[inline]
    fn from(value: u32) -> Self {
        Self(value as u64)
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntError;

    #[inline]
    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<usize> for VarInt {
    type Error = VarIntError;

    #[inline]
    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value as u64)
    }
}

impl TryFrom<VarInt> for usize {
    type Error = VarIntError;

    #[inline]
    fn try_from(value: VarInt) -> Result<Self, Self::Error> {
        value.0.try_into().map_err(|_| VarIntError)
    }
}

impl PartialEq<u64> for VarInt {
    #[inline]
    fn eq(&self, other: &u64) -> bool {
        self.0.eq(other)
    }
}

impl PartialOrd<u64> for VarInt {
    #[inline]
    fn partial_cmp(&self, other: &u64) -> Option<core::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

impl Add for VarInt {
    type Output = Self;

    /// Panics on overflow, like integer addition. Use `checked_add` on
    /// untrusted inputs.
    #[inline]
    fn add(self, rhs: Self) -> Self {
        self.checked_add(rhs).expect("varint overflow")
    }
}

impl AddAssign for VarInt {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for VarInt {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        self.checked_sub(rhs).expect("varint underflow")
    }
}

impl SubAssign for VarInt {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-16
//# The QUIC variable-length integer encoding reserves the two most
//# significant bits of the first byte to encode the base 2 logarithm of
//# the integer encoding length in bytes.  The integer value is encoded
//# on the remaining bits, in network byte order.

decoder_value!(
    impl<'a> VarInt {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (first, buffer) = buffer.decode::<u8>()?;
            let two_bit = first >> 6;
            let first = (first & 0b0011_1111) as u64;

            Ok(match two_bit {
                0b00 => (VarInt(first), buffer),
                0b01 => {
                    let (low, buffer) = buffer.decode::<u8>()?;
                    (VarInt(first << 8 | low as u64), buffer)
                }
                0b10 => {
                    let (low, buffer) = buffer.decode_slice(3)?;
                    let low = low.as_less_safe_slice();
                    let value = first << 24
                        | (low[0] as u64) << 16
                        | (low[1] as u64) << 8
                        | low[2] as u64;
                    (VarInt(value), buffer)
                }
                _ => {
                    let (low, buffer) = buffer.decode_slice(7)?;
                    let mut value = first;
                    for byte in low.as_less_safe_slice() {
                        value = value << 8 | *byte as u64;
                    }
                    (VarInt(value), buffer)
                }
            })
        }
    }
);

impl EncoderValue for VarInt {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        let len = self.encoding_size();
        encoder.write_sized(len, |buf| {
            let two_bit = (len.trailing_zeros() as u8) << 6;
            let bytes = self.0.to_be_bytes();
            buf.copy_from_slice(&bytes[8 - len..]);
            buf[0] |= two_bit;
        });
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        (*self).encoding_size()
    }

    #[inline]
    fn encoding_size_for_encoder<E: Encoder>(&self, _encoder: &E) -> usize {
        (*self).encoding_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s2n_codec::{DecoderBuffer, EncoderBuffer};

    fn round_trip(value: u64) -> usize {
        let value = VarInt::new(value).unwrap();
        let mut bytes = [0u8; 8];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&value);
        let len = encoder.len();

        let buffer = DecoderBuffer::new(&bytes[..len]);
        let (decoded, remaining) = buffer.decode::<VarInt>().unwrap();
        assert!(remaining.is_empty());
        assert_eq!(decoded, value);
        len
    }

    #[test]
    fn boundary_encodings() {
        assert_eq!(round_trip(0), 1);
        assert_eq!(round_trip(63), 1);
        assert_eq!(round_trip(64), 2);
        assert_eq!(round_trip(16_383), 2);
        assert_eq!(round_trip(16_384), 4);
        assert_eq!(round_trip((1 << 30) - 1), 4);
        assert_eq!(round_trip(1 << 30), 8);
        assert_eq!(round_trip(MAX_VARINT_VALUE), 8);
    }

    #[test]
    fn out_of_range() {
        assert!(VarInt::new(MAX_VARINT_VALUE).is_ok());
        assert!(VarInt::new(MAX_VARINT_VALUE + 1).is_err());
        assert!(VarInt::MAX.checked_add(VarInt::from_u8(1)).is_none());
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.1
    //# For example, the eight-byte sequence 0xc2197c5eff14e88c decodes to
    //# the decimal value 151,288,809,941,952,652
    #[test]
    fn rfc_examples() {
        for (bytes, expected) in [
            (&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c][..], 151_288_809_941_952_652u64),
            (&[0x9d, 0x7f, 0x3e, 0x7d][..], 494_878_333),
            (&[0x7b, 0xbd][..], 15_293),
            (&[0x25][..], 37),
        ] {
            let (value, _) = DecoderBuffer::new(bytes).decode::<VarInt>().unwrap();
            assert_eq!(value.as_u64(), expected);
        }
    }

    #[test]
    fn insufficient_input() {
        for bytes in [&[0x40][..], &[0x80, 0, 0][..], &[0xc0, 0, 0, 0, 0, 0, 0][..]] {
            assert!(DecoderBuffer::new(bytes).decode::<VarInt>().is_err());
        }
    }

    #[test]
    fn round_trip_check() {
        bolero::check!().with_type::<u64>().for_each(|value| {
            let value = value & MAX_VARINT_VALUE;
            round_trip(value);
        });
    }
}
