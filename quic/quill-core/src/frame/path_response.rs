// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::path_challenge::DATA_LEN;
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.18
//# A PATH_RESPONSE frame (type=0x1b) is sent in response to a
//# PATH_CHALLENGE frame.

pub const PATH_RESPONSE_TAG: u8 = 0x1b;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathResponse {
    /// The data carried by the PATH_CHALLENGE being answered
    pub data: [u8; DATA_LEN],
}

impl PathResponse {
    #[inline]
    pub fn tag(&self) -> u8 {
        PATH_RESPONSE_TAG
    }
}

decoder_parameterized_value!(
    impl<'a> PathResponse {
        fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let (slice, buffer) = buffer.decode_slice(DATA_LEN)?;
            let mut data = [0u8; DATA_LEN];
            data.copy_from_slice(&slice.into_less_safe_slice()[..]);

            Ok((PathResponse { data }, buffer))
        }
    }
);

impl EncoderValue for PathResponse {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.tag());
        encoder.write_slice(&self.data);
    }
}
