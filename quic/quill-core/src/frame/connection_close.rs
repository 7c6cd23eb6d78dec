// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, varint::VarInt};
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.19
//# An endpoint sends a CONNECTION_CLOSE frame (type=0x1c or 0x1d) to
//# notify its peer that the connection is being closed.  The
//# CONNECTION_CLOSE frame with a type of 0x1c is used to signal errors
//# at only the QUIC layer, or the absence of errors (with the NO_ERROR
//# code).  The CONNECTION_CLOSE frame with a type of 0x1d is used to
//# signal an error with the application that uses QUIC.

pub const TRANSPORT_TAG: u8 = 0x1c;
pub const APPLICATION_TAG: u8 = 0x1d;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionClose<'a> {
    /// The 62-bit error code; transport codes for 0x1c, application
    /// codes for 0x1d
    pub error_code: VarInt,

    /// The frame type that triggered the error; absent in the
    /// application flavor
    pub frame_type: Option<VarInt>,

    /// Optional UTF-8 diagnostic text
    pub reason: Option<&'a [u8]>,
}

impl ConnectionClose<'_> {
    #[inline]
    pub fn tag(&self) -> u8 {
        if self.frame_type.is_some() {
            TRANSPORT_TAG
        } else {
            APPLICATION_TAG
        }
    }

    /// True for the application-error flavor (type 0x1d)
    #[inline]
    pub fn is_application_error(&self) -> bool {
        self.frame_type.is_none()
    }
}

decoder_parameterized_value!(
    impl<'a> ConnectionClose<'a> {
        fn decode(tag: Tag, buffer: Buffer) -> Result<Self> {
            let (error_code, buffer) = buffer.decode()?;

            let (frame_type, buffer) = if tag == TRANSPORT_TAG {
                let (frame_type, buffer) = buffer.decode()?;
                (Some(frame_type), buffer)
            } else {
                (None, buffer)
            };

            let (reason, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;

            let reason = if reason.is_empty() {
                None
            } else {
                #[allow(clippy::all)]
                Some(&reason.into_less_safe_slice()[..])
            };

            let frame = ConnectionClose {
                error_code,
                frame_type,
                reason,
            };

            Ok((frame, buffer))
        }
    }
);

impl EncoderValue for ConnectionClose<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.tag());
        encoder.encode(&self.error_code);

        if let Some(frame_type) = &self.frame_type {
            encoder.encode(frame_type);
        }

        if let Some(reason) = &self.reason {
            encoder.encode_with_len_prefix::<VarInt, _>(reason);
        } else {
            encoder.encode(&0u8);
        }
    }
}
