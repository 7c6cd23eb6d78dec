// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet numbers and their truncated wire representation.
//!
//! A packet number is a 62-bit per-space counter. On the wire only the
//! low 1-4 bytes travel; the receiver reconstructs the full value from
//! the largest packet number it has successfully processed.

use crate::varint::VarInt;
use s2n_codec::{DecoderBuffer, DecoderBufferResult, DecoderError, Encoder, EncoderValue};

/// The encryption level a packet number space belongs to.
///
/// 0-RTT packets count in the `ApplicationData` space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PacketNumberSpace {
    Initial,
    Handshake,
    ApplicationData,
}

impl PacketNumberSpace {
    pub const COUNT: usize = 3;

    #[inline]
    pub fn as_index(self) -> usize {
        match self {
            Self::Initial => 0,
            Self::Handshake => 1,
            Self::ApplicationData => 2,
        }
    }

    #[inline]
    pub fn all() -> [Self; Self::COUNT] {
        [Self::Initial, Self::Handshake, Self::ApplicationData]
    }
}

/// A full, untruncated packet number
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketNumber(VarInt);

impl PacketNumber {
    pub const ZERO: Self = Self(VarInt::ZERO);

    #[inline]
    pub const fn from_varint(value: VarInt) -> Self {
        Self(value)
    }

    #[inline]
    pub fn new(value: u64) -> Option<Self> {
        VarInt::new(value).ok().map(Self)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    #[inline]
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(VarInt::from_u8(1)).map(Self)
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.2
    //# The sender MUST use a packet number size able to represent more than
    //# twice as large a range as the difference between the largest
    //# acknowledged packet number and the packet number being sent.
    #[inline]
    pub fn truncate(self, largest_acked: Option<PacketNumber>) -> TruncatedPacketNumber {
        let num_unacked = match largest_acked {
            Some(acked) => {
                debug_assert!(acked <= self);
                self.as_u64() - acked.as_u64()
            }
            None => self.as_u64() + 1,
        };

        let range = num_unacked.saturating_mul(2).saturating_add(1);
        let len = match 64 - range.leading_zeros() {
            0..=8 => PacketNumberLen::ONE,
            9..=16 => PacketNumberLen::TWO,
            17..=24 => PacketNumberLen::THREE,
            _ => PacketNumberLen::FOUR,
        };

        TruncatedPacketNumber {
            value: (self.as_u64() & len.value_mask()) as u32,
            len,
        }
    }
}

/// The number of bytes a truncated packet number occupies (1-4)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PacketNumberLen(u8);

impl PacketNumberLen {
    pub const ONE: Self = Self(1);
    pub const TWO: Self = Self(2);
    pub const THREE: Self = Self(3);
    pub const FOUR: Self = Self(4);

    pub const MAX_LEN: usize = 4;

    /// Extracts the length from the low two bits of an unprotected
    /// packet tag byte
    #[inline]
    pub fn from_packet_tag(tag: u8) -> Self {
        Self((tag & 0b11) + 1)
    }

    /// The low two tag-byte bits encoding this length
    #[inline]
    pub fn into_packet_tag_bits(self) -> u8 {
        self.0 - 1
    }

    #[inline]
    pub fn bytesize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    fn bits(self) -> u32 {
        self.0 as u32 * 8
    }

    #[inline]
    fn value_mask(self) -> u64 {
        (1u64 << self.bits()) - 1
    }
}

/// The low bytes of a packet number as they appear on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TruncatedPacketNumber {
    value: u32,
    len: PacketNumberLen,
}

impl TruncatedPacketNumber {
    #[inline]
    pub fn new(value: u32, len: PacketNumberLen) -> Self {
        debug_assert!(u64::from(value) <= len.value_mask());
        Self { value, len }
    }

    #[inline]
    pub fn len(self) -> PacketNumberLen {
        self.len
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.value
    }

    #[inline]
    pub fn decode(buffer: DecoderBuffer, len: PacketNumberLen) -> DecoderBufferResult<Self> {
        let (bytes, buffer) = buffer.decode_slice(len.bytesize())?;
        let mut value = 0u32;
        for byte in bytes.as_less_safe_slice() {
            value = value << 8 | *byte as u32;
        }
        Ok((Self { value, len }, buffer))
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.3
    //# expected_pn  = largest_pn + 1
    //# pn_win       = 1 << pn_nbits
    //# pn_hwin      = pn_win / 2
    //# pn_mask      = pn_win - 1
    #[inline]
    pub fn expand(self, largest_pn: Option<PacketNumber>) -> Result<PacketNumber, DecoderError> {
        let expected_pn = match largest_pn {
            Some(largest) => largest.as_u64() + 1,
            None => 0,
        };

        let pn_win = 1u64 << self.len.bits();
        let pn_hwin = pn_win / 2;
        let pn_mask = pn_win - 1;

        let candidate_pn = (expected_pn & !pn_mask) | u64::from(self.value);

        let candidate = if candidate_pn + pn_hwin <= expected_pn && candidate_pn + pn_win < (1 << 62)
        {
            candidate_pn + pn_win
        } else if candidate_pn > expected_pn + pn_hwin && candidate_pn >= pn_win {
            candidate_pn - pn_win
        } else {
            candidate_pn
        };

        PacketNumber::new(candidate)
            .ok_or(DecoderError::InvariantViolation("packet number out of range"))
    }
}

impl EncoderValue for TruncatedPacketNumber {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        let bytes = self.value.to_be_bytes();
        encoder.write_slice(&bytes[4 - self.len.bytesize()..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pn(value: u64) -> PacketNumber {
        PacketNumber::new(value).unwrap()
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.2
    //# For example, if an endpoint has received an acknowledgment for packet
    //# 0xabe8b3 and is sending a packet with a number of 0xac5c02, there are
    //# 29,519 (0x734f) outstanding packet numbers.
    #[test]
    fn truncate_rfc_example() {
        let truncated = pn(0xac5c02).truncate(Some(pn(0xabe8b3)));
        assert_eq!(truncated.len(), PacketNumberLen::TWO);
        assert_eq!(truncated.as_u32(), 0x5c02);

        let truncated = pn(0xace8fe).truncate(Some(pn(0xabe8b3)));
        assert_eq!(truncated.len(), PacketNumberLen::THREE);
        assert_eq!(truncated.as_u32(), 0xace8fe & 0xff_ffff);
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.3
    //# For example, if the highest successfully authenticated packet had a
    //# packet number of 0xa82f30ea, then a packet containing a 16-bit value
    //# of 0x9b32 will be decoded as 0xa82f9b32.
    #[test]
    fn expand_rfc_example() {
        let truncated = TruncatedPacketNumber::new(0x9b32, PacketNumberLen::TWO);
        let expanded = truncated.expand(Some(pn(0xa82f30ea))).unwrap();
        assert_eq!(expanded.as_u64(), 0xa82f9b32);
    }

    #[test]
    fn expand_across_wrap() {
        // truncated values that wrap the 4-byte boundary expand forward
        let largest = pn(0xffff_fffe);
        let truncated = TruncatedPacketNumber::new(0x02, PacketNumberLen::ONE);
        assert_eq!(truncated.expand(Some(largest)).unwrap(), pn(0x1_0000_0002));

        let truncated = TruncatedPacketNumber::new(0x0000_0001, PacketNumberLen::FOUR);
        assert_eq!(truncated.expand(Some(largest)).unwrap(), pn(0x1_0000_0001));
    }

    #[test]
    fn truncate_expand_round_trip() {
        for (value, largest_acked) in [
            (0u64, None),
            (1, Some(0u64)),
            (0xff, Some(0x80)),
            (0x1_0000_0005, Some(0xffff_ffff)),
            ((1 << 62) - 1, Some((1 << 62) - 100)),
        ] {
            let truncated = pn(value).truncate(largest_acked.map(pn));
            // the receiver's largest is at least the sender's largest acked
            let expanded = truncated.expand(largest_acked.map(pn)).unwrap();
            assert_eq!(expanded.as_u64(), value, "value={value:#x}");
        }
    }

    #[test]
    fn tag_bits_round_trip() {
        for len in [
            PacketNumberLen::ONE,
            PacketNumberLen::TWO,
            PacketNumberLen::THREE,
            PacketNumberLen::FOUR,
        ] {
            assert_eq!(PacketNumberLen::from_packet_tag(len.into_packet_tag_bits()), len);
        }
    }
}
