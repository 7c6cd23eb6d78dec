// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.4
//# An endpoint uses a RESET_STREAM frame (type=0x04) to abruptly
//# terminate the sending part of a stream.

pub const RESET_STREAM_TAG: u8 = 0x04;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetStream {
    /// The stream being terminated
    pub stream_id: VarInt,

    /// The application error code conveyed to the receiver
    pub application_error_code: VarInt,

    /// The final size of the stream in bytes
    pub final_size: VarInt,
}

impl ResetStream {
    #[inline]
    pub fn tag(&self) -> u8 {
        RESET_STREAM_TAG
    }
}

simple_frame_codec!(
    ResetStream {
        stream_id,
        application_error_code,
        final_size
    },
    RESET_STREAM_TAG
);
