// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.6
//# A CRYPTO frame (type=0x06) is used to transmit cryptographic
//# handshake messages.

pub const CRYPTO_TAG: u8 = 0x06;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.6
//# CRYPTO Frame {
//#   Type (i) = 0x06,
//#   Offset (i),
//#   Length (i),
//#   Crypto Data (..),
//# }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Crypto<'a> {
    /// The byte offset within the handshake stream
    pub offset: VarInt,

    /// The handshake bytes
    pub data: &'a [u8],
}

impl Crypto<'_> {
    #[inline]
    pub fn tag(&self) -> u8 {
        CRYPTO_TAG
    }

    /// Shrinks the frame to fit `capacity` bytes of encoding, returning
    /// how many data bytes survive, or `None` if not even one fits
    #[inline]
    pub fn max_data_for_capacity(&self, capacity: usize) -> Option<usize> {
        let overhead = 1 + self.offset.encoding_size() + VarInt::try_from(self.data.len()).ok()?.encoding_size();
        let remaining = capacity.checked_sub(overhead)?;
        Some(remaining.min(self.data.len()))
    }
}

decoder_parameterized_value!(
    impl<'a> Crypto<'a> {
        fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let (offset, buffer) = buffer.decode()?;
            let (data, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;

            #[allow(clippy::all)]
            let data = &data.into_less_safe_slice()[..];

            let frame = Crypto { offset, data };

            Ok((frame, buffer))
        }
    }
);

impl EncoderValue for Crypto<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.tag());
        encoder.encode(&self.offset);
        encoder.encode_with_len_prefix::<VarInt, _>(&self.data);
    }
}
