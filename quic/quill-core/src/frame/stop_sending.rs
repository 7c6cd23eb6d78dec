// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.5
//# An endpoint uses a STOP_SENDING frame (type=0x05) to communicate that
//# incoming data is being discarded on receipt per application request.
//# STOP_SENDING requests that a peer cease transmission on a stream.

pub const STOP_SENDING_TAG: u8 = 0x05;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StopSending {
    /// The stream being asked to stop
    pub stream_id: VarInt,

    /// The application error code conveyed to the sender
    pub application_error_code: VarInt,
}

impl StopSending {
    #[inline]
    pub fn tag(&self) -> u8 {
        STOP_SENDING_TAG
    }
}

simple_frame_codec!(
    StopSending {
        stream_id,
        application_error_code
    },
    STOP_SENDING_TAG
);
