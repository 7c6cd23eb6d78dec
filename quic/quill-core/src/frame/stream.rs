// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, varint::VarInt};
use core::mem::size_of;
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# STREAM frames implicitly create a stream and carry stream data.  The
//# Type field in the STREAM frame takes the form 0b00001XXX (or the set
//# of values from 0x08 to 0x0f).

pub const STREAM_TAG_MIN: u8 = 0x08;
pub const STREAM_TAG_MAX: u8 = 0x0f;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# *  The OFF bit (0x04) in the frame type is set to indicate that there
//#    is an Offset field present.
const OFF_BIT: u8 = 0x04;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# *  The LEN bit (0x02) in the frame type is set to indicate that there
//#    is a Length field present.
const LEN_BIT: u8 = 0x02;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# *  The FIN bit (0x01) indicates that the frame marks the end of the
//#    stream.
const FIN_BIT: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stream<'a> {
    /// The stream carrying the data
    pub stream_id: VarInt,

    /// The byte offset of `data` within the stream
    pub offset: VarInt,

    /// True if the frame extends to the end of the packet and omits its
    /// length field
    pub is_last_frame: bool,

    /// True if the frame marks the end of the stream
    pub is_fin: bool,

    pub data: &'a [u8],
}

impl Stream<'_> {
    #[inline]
    pub fn tag(&self) -> u8 {
        let mut tag = STREAM_TAG_MIN;

        if *self.offset != 0 {
            tag |= OFF_BIT;
        }

        if !self.is_last_frame {
            tag |= LEN_BIT;
        }

        if self.is_fin {
            tag |= FIN_BIT;
        }

        tag
    }

    /// The encoded size of everything but the data bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        let mut size = size_of::<Tag>() + self.stream_id.encoding_size();
        if *self.offset != 0 {
            size += self.offset.encoding_size();
        }
        if !self.is_last_frame {
            size += VarInt::try_from(self.data.len())
                .expect("frame data fits a varint")
                .encoding_size();
        }
        size
    }

    /// Shrinks the frame to fit `capacity` bytes of encoding, returning
    /// how many data bytes survive, or `None` if none fit.
    ///
    /// `is_last_frame` is recomputed: a frame that exactly fills the
    /// packet drops its length field.
    #[inline]
    pub fn max_data_for_capacity(&mut self, capacity: usize) -> Option<usize> {
        let mut fixed = size_of::<Tag>() + self.stream_id.encoding_size();
        if *self.offset != 0 {
            fixed += self.offset.encoding_size();
        }

        let remaining = capacity.checked_sub(fixed)?;
        if remaining >= self.data.len() {
            // everything fits; prefer an explicit length so more frames
            // may follow, unless it no longer fits with the prefix
            let len_prefix = VarInt::try_from(self.data.len()).ok()?.encoding_size();
            if remaining >= self.data.len() + len_prefix {
                self.is_last_frame = false;
            } else {
                self.is_last_frame = true;
            }
            return Some(self.data.len());
        }

        // data must be truncated; a length prefix is pointless
        self.is_last_frame = true;
        Some(remaining)
    }
}

decoder_parameterized_value!(
    impl<'a> Stream<'a> {
        fn decode(tag: Tag, buffer: Buffer) -> Result<Self> {
            let has_offset = tag & OFF_BIT == OFF_BIT;
            let is_last_frame = tag & LEN_BIT != LEN_BIT;
            let is_fin = tag & FIN_BIT == FIN_BIT;

            let (stream_id, buffer) = buffer.decode()?;

            let (offset, buffer) = if has_offset {
                buffer.decode()?
            } else {
                (Default::default(), buffer)
            };

            let (data, buffer) = if is_last_frame {
                let len = buffer.len();
                buffer.decode_slice(len)?
            } else {
                buffer.decode_slice_with_len_prefix::<VarInt>()?
            };

            #[allow(clippy::all)]
            let data = &data.into_less_safe_slice()[..];

            let frame = Stream {
                stream_id,
                offset,
                is_last_frame,
                is_fin,
                data,
            };

            Ok((frame, buffer))
        }
    }
);

impl EncoderValue for Stream<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.tag());
        encoder.encode(&self.stream_id);

        if *self.offset != 0 {
            encoder.encode(&self.offset);
        }

        if self.is_last_frame {
            encoder.write_slice(self.data);
        } else {
            encoder.encode_with_len_prefix::<VarInt, _>(&self.data);
        }
    }
}
