// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.10
//# A MAX_STREAM_DATA frame (type=0x11) is used in flow control to inform
//# a peer of the maximum amount of data that can be sent on a stream.

pub const MAX_STREAM_DATA_TAG: u8 = 0x11;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxStreamData {
    /// The stream ID of the affected stream
    pub stream_id: VarInt,

    /// The maximum amount of data that can be sent on the stream, in
    /// bytes
    pub maximum_stream_data: VarInt,
}

impl MaxStreamData {
    #[inline]
    pub fn tag(&self) -> u8 {
        MAX_STREAM_DATA_TAG
    }
}

simple_frame_codec!(
    MaxStreamData {
        stream_id,
        maximum_stream_data
    },
    MAX_STREAM_DATA_TAG
);
