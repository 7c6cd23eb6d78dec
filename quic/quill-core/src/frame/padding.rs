// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.1
//# A PADDING frame (type=0x00) has no semantic value.  PADDING frames
//# can be used to increase the size of a packet.

pub const PADDING_TAG: u8 = 0x00;

/// A run of consecutive PADDING bytes, decoded as one frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Padding {
    pub length: usize,
}

impl Padding {
    #[inline]
    pub fn tag(&self) -> u8 {
        PADDING_TAG
    }
}

decoder_parameterized_value!(
    impl<'a> Padding {
        fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            // consume the run; the leading tag byte was already skipped
            let mut length = 1;
            let mut buffer = buffer;
            while buffer.peek_byte(0).ok() == Some(PADDING_TAG) {
                buffer = buffer.skip(1)?;
                length += 1;
            }

            Ok((Padding { length }, buffer))
        }
    }
);

impl EncoderValue for Padding {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_repeated(self.length, PADDING_TAG);
    }
}
