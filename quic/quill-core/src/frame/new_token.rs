// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use s2n_codec::{decoder_invariant, decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
//# A server sends a NEW_TOKEN frame (type=0x07) to provide the client
//# with a token to send in the header of an Initial packet for a future
//# connection.

pub const NEW_TOKEN_TAG: u8 = 0x07;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewToken<'a> {
    /// An opaque blob the client may present on a future connection
    pub token: &'a [u8],
}

impl NewToken<'_> {
    #[inline]
    pub fn tag(&self) -> u8 {
        NEW_TOKEN_TAG
    }
}

decoder_parameterized_value!(
    impl<'a> NewToken<'a> {
        fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let (token, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
            //# A client MUST treat receipt of a NEW_TOKEN frame with an empty
            //# Token field as a connection error of type FRAME_ENCODING_ERROR.
            decoder_invariant!(!token.is_empty(), "empty new token");

            #[allow(clippy::all)]
            let token = &token.into_less_safe_slice()[..];

            let frame = NewToken { token };

            Ok((frame, buffer))
        }
    }
);

impl EncoderValue for NewToken<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.tag());
        encoder.encode_with_len_prefix::<VarInt, _>(&self.token);
    }
}
