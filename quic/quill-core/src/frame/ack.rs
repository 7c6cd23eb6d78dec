// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, range::RangeSet, varint::VarInt};
use core::ops::RangeInclusive;
use s2n_codec::{
    decoder_parameterized_value, decoder_value, DecoderBuffer, Encoder, EncoderValue,
};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3
//# Receivers send ACK frames (types 0x02 and 0x03) to inform senders of
//# packets they have received and processed.  The ACK frame contains one
//# or more ACK Ranges.  ACK Ranges identify acknowledged packets.  If
//# the frame type is 0x03, ACK frames also contain the cumulative count
//# of QUIC packets with associated ECN marks received on the connection
//# up until this point.

pub const ACK_TAG: u8 = 0x02;
pub const ACK_W_ECN_TAG: u8 = 0x03;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3
//# ACK Frame {
//#   Type (i) = 0x02..0x03,
//#   Largest Acknowledged (i),
//#   ACK Delay (i),
//#   ACK Range Count (i),
//#   First ACK Range (i),
//#   ACK Range (..) ...,
//#   [ECN Counts (..)],
//# }

/// Packet-number ranges carried by an ACK frame, iterated from the
/// largest range downward
pub trait AckRanges {
    type Iter: Iterator<Item = RangeInclusive<u64>> + ExactSizeIterator;

    fn ack_ranges(&self) -> Self::Iter;

    fn largest_acknowledged(&self) -> u64 {
        *self
            .ack_ranges()
            .next()
            .expect("an ack frame must acknowledge at least one packet")
            .end()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Ack<AckRanges> {
    /// Microseconds (scaled by the peer's ack_delay_exponent) between
    /// receipt of the largest packet and this ACK being sent
    pub ack_delay: VarInt,

    pub ack_ranges: AckRanges,

    pub ecn_counts: Option<EcnCounts>,
}

impl<A> Ack<A> {
    #[inline]
    pub fn tag(&self) -> u8 {
        if self.ecn_counts.is_some() {
            ACK_W_ECN_TAG
        } else {
            ACK_TAG
        }
    }
}

impl<A: AckRanges> Ack<A> {
    #[inline]
    pub fn ack_ranges(&self) -> A::Iter {
        self.ack_ranges.ack_ranges()
    }

    #[inline]
    pub fn largest_acknowledged(&self) -> u64 {
        self.ack_ranges.largest_acknowledged()
    }

    #[inline]
    pub fn ack_delay(&self) -> core::time::Duration {
        core::time::Duration::from_micros(self.ack_delay.as_u64())
    }
}

impl<A: core::fmt::Debug> core::fmt::Debug for Ack<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Ack")
            .field("ack_delay", &self.ack_delay)
            .field("ack_ranges", &self.ack_ranges)
            .field("ecn_counts", &self.ecn_counts)
            .finish()
    }
}

decoder_parameterized_value!(
    impl<'a> Ack<AckRangesDecoder<'a>> {
        fn decode(tag: Tag, buffer: Buffer) -> Result<Self> {
            let (largest_acknowledged, buffer) = buffer.decode::<VarInt>()?;
            let (ack_delay, buffer) = buffer.decode::<VarInt>()?;
            let (ack_ranges, buffer) =
                buffer.decode_parameterized::<AckRangesDecoder>(largest_acknowledged)?;

            let (ecn_counts, buffer) = if tag == ACK_W_ECN_TAG {
                let (ecn_counts, buffer) = buffer.decode()?;
                (Some(ecn_counts), buffer)
            } else {
                (None, buffer)
            };

            let frame = Ack {
                ack_delay,
                ack_ranges,
                ecn_counts,
            };

            Ok((frame, buffer))
        }
    }
);

impl<A: AckRanges> EncoderValue for Ack<A> {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.tag());

        let mut iter = self.ack_ranges.ack_ranges();
        let first_range = iter.next().expect("at least one ack range is required");
        let (mut smallest, largest) = first_range.into_inner();

        let range_count = VarInt::try_from(iter.len()).expect("range count fits a varint");

        let varint = |value: u64| VarInt::new(value).expect("packet numbers fit a varint");

        encoder.encode(&varint(largest));
        encoder.encode(&self.ack_delay);
        encoder.encode(&range_count);
        encoder.encode(&varint(largest - smallest));

        for range in iter {
            let (range_smallest, range_largest) = range.into_inner();
            debug_assert!(range_largest + 2 <= smallest, "ranges must descend");

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.1
            //# Gap:  A variable-length integer indicating the number of
            //# contiguous unacknowledged packets preceding the packet number
            //# one lower than the smallest in the preceding ACK Range.
            encoder.encode(&varint(smallest - range_largest - 2));
            encoder.encode(&varint(range_largest - range_smallest));
            smallest = range_smallest;
        }

        if let Some(ecn_counts) = self.ecn_counts.as_ref() {
            encoder.encode(ecn_counts);
        }
    }
}

/// Lazily decoded ACK ranges; the gap/length pairs are validated up
/// front and re-walked on iteration
#[derive(Clone, Copy)]
pub struct AckRangesDecoder<'a> {
    largest_acknowledged: VarInt,
    range_count: VarInt,
    range_buffer: DecoderBuffer<'a>,
}

impl<'a> AckRanges for AckRangesDecoder<'a> {
    type Iter = AckRangesIter<'a>;

    #[inline]
    fn ack_ranges(&self) -> Self::Iter {
        AckRangesIter {
            largest: self.largest_acknowledged.as_u64(),
            remaining: self.range_count.as_u64(),
            range_buffer: self.range_buffer,
            first: true,
        }
    }

    #[inline]
    fn largest_acknowledged(&self) -> u64 {
        self.largest_acknowledged.as_u64()
    }
}

impl PartialEq for AckRangesDecoder<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.ack_ranges().eq(other.ack_ranges())
    }
}

impl Eq for AckRangesDecoder<'_> {}

impl core::fmt::Debug for AckRangesDecoder<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_list().entries(self.ack_ranges()).finish()
    }
}

decoder_parameterized_value!(
    impl<'a> AckRangesDecoder<'a> {
        fn decode(largest_acknowledged: VarInt, buffer: Buffer) -> Result<AckRangesDecoder<'a>> {
            let (range_count, buffer) = buffer.decode::<VarInt>()?;

            // the count excludes the first range
            let range_count = range_count
                .checked_add(VarInt::from_u8(1))
                .ok_or_else(|| s2n_codec::DecoderError::InvariantViolation("invalid ack ranges"))?;

            let mut validator = AckRangesIter {
                largest: largest_acknowledged.as_u64(),
                remaining: range_count.as_u64(),
                range_buffer: buffer.peek(),
                first: true,
            };

            for _ in 0..range_count.as_u64() {
                validator
                    .next()
                    .ok_or(s2n_codec::DecoderError::InvariantViolation(
                        "invalid ack ranges",
                    ))?;
            }

            let consumed = buffer.len() - validator.range_buffer.len();
            let (range_buffer, buffer) = buffer.decode_slice(consumed)?;
            let range_buffer = DecoderBuffer::new(&range_buffer.into_less_safe_slice()[..]);

            let ack_ranges = AckRangesDecoder {
                largest_acknowledged,
                range_count,
                range_buffer,
            };

            Ok((ack_ranges, buffer))
        }
    }
);

pub struct AckRangesIter<'a> {
    largest: u64,
    remaining: u64,
    range_buffer: DecoderBuffer<'a>,
    first: bool,
}

impl Iterator for AckRangesIter<'_> {
    type Item = RangeInclusive<u64>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        if !self.first {
            let (gap, buffer) = self.range_buffer.decode::<VarInt>().ok()?;
            self.range_buffer = buffer;
            // the next largest is two below the previous smallest, plus
            // the gap
            self.largest = self.largest.checked_sub(gap.as_u64().checked_add(2)?)?;
        }
        self.first = false;

        let (len, buffer) = self.range_buffer.decode::<VarInt>().ok()?;
        self.range_buffer = buffer;

        let smallest = self.largest.checked_sub(len.as_u64())?;
        let range = smallest..=self.largest;
        self.largest = smallest;
        self.remaining -= 1;

        Some(range)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for AckRangesIter<'_> {}

/// Borrows a [`RangeSet`] of received packet numbers as ACK ranges
#[derive(Clone, Copy, Debug)]
pub struct RangeSetAckRanges<'a>(pub &'a RangeSet);

fn subrange_to_inclusive(subrange: &crate::range::Subrange) -> RangeInclusive<u64> {
    subrange.low..=subrange.high()
}

impl<'a> AckRanges for RangeSetAckRanges<'a> {
    type Iter = core::iter::Map<
        core::iter::Rev<core::slice::Iter<'a, crate::range::Subrange>>,
        fn(&crate::range::Subrange) -> RangeInclusive<u64>,
    >;

    #[inline]
    fn ack_ranges(&self) -> Self::Iter {
        self.0.as_slice().iter().rev().map(subrange_to_inclusive)
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.2
//# ECN Counts {
//#   ECT0 Count (i),
//#   ECT1 Count (i),
//#   ECN-CE Count (i),
//# }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect_0_count: VarInt,
    pub ect_1_count: VarInt,
    pub ce_count: VarInt,
}

decoder_value!(
    impl<'a> EcnCounts {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (ect_0_count, buffer) = buffer.decode()?;
            let (ect_1_count, buffer) = buffer.decode()?;
            let (ce_count, buffer) = buffer.decode()?;

            let counts = EcnCounts {
                ect_0_count,
                ect_1_count,
                ce_count,
            };

            Ok((counts, buffer))
        }
    }
);

impl EncoderValue for EcnCounts {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.ect_0_count);
        encoder.encode(&self.ect_1_count);
        encoder.encode(&self.ce_count);
    }
}
