// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Codecs for every QUIC version 1 frame.
//!
//! Each frame lives in its own module with a
//! `decoder_parameterized_value!` decoder (parameterized on the tag
//! byte, which several frame types fold flags into) and an
//! `EncoderValue` encoder. `Frame::decode` dispatches on the tag.

use s2n_codec::{DecoderBuffer, DecoderBufferResult, DecoderError, Encoder, EncoderValue};

// Implements the codec for a frame whose fields are plain values with
// no tag-dependent variation
macro_rules! simple_frame_codec {
    ($name:ident { $( $field:ident ),* $(,)? }, $tag:expr) => {
        s2n_codec::decoder_parameterized_value!(
            impl<'a> $name {
                fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
                    $(
                        let ($field, buffer) = buffer.decode()?;
                    )*

                    let frame = $name { $($field),* };

                    Ok((frame, buffer))
                }
            }
        );

        impl s2n_codec::EncoderValue for $name {
            #[inline]
            fn encode<E: s2n_codec::Encoder>(&self, encoder: &mut E) {
                encoder.encode(&$tag);
                $(
                    encoder.encode(&self.$field);
                )*
            }
        }
    };
}

pub mod ack;
pub mod connection_close;
pub mod crypto;
pub mod data_blocked;
pub mod handshake_done;
pub mod max_data;
pub mod max_stream_data;
pub mod max_streams;
pub mod new_connection_id;
pub mod new_token;
pub mod padding;
pub mod path_challenge;
pub mod path_response;
pub mod ping;
pub mod reset_stream;
pub mod retire_connection_id;
pub mod stop_sending;
pub mod stream;
pub mod streams_blocked;
pub mod stream_data_blocked;

pub use ack::Ack;
pub use connection_close::ConnectionClose;
pub use crypto::Crypto;
pub use data_blocked::DataBlocked;
pub use handshake_done::HandshakeDone;
pub use max_data::MaxData;
pub use max_stream_data::MaxStreamData;
pub use max_streams::MaxStreams;
pub use new_connection_id::NewConnectionId;
pub use new_token::NewToken;
pub use padding::Padding;
pub use path_challenge::PathChallenge;
pub use path_response::PathResponse;
pub use ping::Ping;
pub use reset_stream::ResetStream;
pub use retire_connection_id::RetireConnectionId;
pub use stop_sending::StopSending;
pub use stream::Stream;
pub use streams_blocked::StreamsBlocked;
pub use stream_data_blocked::StreamDataBlocked;

pub(crate) type Tag = u8;

/// A frame decoded from a packet payload
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Padding(Padding),
    Ping(Ping),
    Ack(Ack<ack::AckRangesDecoder<'a>>),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto<'a>),
    NewToken(NewToken<'a>),
    Stream(Stream<'a>),
    MaxData(MaxData),
    MaxStreamData(MaxStreamData),
    MaxStreams(MaxStreams),
    DataBlocked(DataBlocked),
    StreamDataBlocked(StreamDataBlocked),
    StreamsBlocked(StreamsBlocked),
    NewConnectionId(NewConnectionId),
    RetireConnectionId(RetireConnectionId),
    PathChallenge(PathChallenge),
    PathResponse(PathResponse),
    ConnectionClose(ConnectionClose<'a>),
    HandshakeDone(HandshakeDone),
}

impl<'a> Frame<'a> {
    /// Decodes the next frame from a cleartext payload
    pub fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Frame<'a>> {
        let tag = buffer.peek_byte(0)?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
        //# An endpoint MUST treat the receipt of a frame of unknown type as a
        //# connection error of type FRAME_ENCODING_ERROR.
        macro_rules! parse {
            ($module:ident, $variant:ident) => {{
                let buffer = buffer.skip(core::mem::size_of::<Tag>())?;
                let (frame, buffer) = buffer.decode_parameterized(tag)?;
                Ok((Frame::$variant(frame), buffer))
            }};
        }

        match tag {
            padding::PADDING_TAG => parse!(padding, Padding),
            ping::PING_TAG => parse!(ping, Ping),
            ack::ACK_TAG..=ack::ACK_W_ECN_TAG => parse!(ack, Ack),
            reset_stream::RESET_STREAM_TAG => parse!(reset_stream, ResetStream),
            stop_sending::STOP_SENDING_TAG => parse!(stop_sending, StopSending),
            crypto::CRYPTO_TAG => parse!(crypto, Crypto),
            new_token::NEW_TOKEN_TAG => parse!(new_token, NewToken),
            stream::STREAM_TAG_MIN..=stream::STREAM_TAG_MAX => parse!(stream, Stream),
            max_data::MAX_DATA_TAG => parse!(max_data, MaxData),
            max_stream_data::MAX_STREAM_DATA_TAG => parse!(max_stream_data, MaxStreamData),
            max_streams::BIDI_TAG | max_streams::UNI_TAG => parse!(max_streams, MaxStreams),
            data_blocked::DATA_BLOCKED_TAG => parse!(data_blocked, DataBlocked),
            stream_data_blocked::STREAM_DATA_BLOCKED_TAG => {
                parse!(stream_data_blocked, StreamDataBlocked)
            }
            streams_blocked::BIDI_TAG | streams_blocked::UNI_TAG => {
                parse!(streams_blocked, StreamsBlocked)
            }
            new_connection_id::NEW_CONNECTION_ID_TAG => parse!(new_connection_id, NewConnectionId),
            retire_connection_id::RETIRE_CONNECTION_ID_TAG => {
                parse!(retire_connection_id, RetireConnectionId)
            }
            path_challenge::PATH_CHALLENGE_TAG => parse!(path_challenge, PathChallenge),
            path_response::PATH_RESPONSE_TAG => parse!(path_response, PathResponse),
            connection_close::TRANSPORT_TAG | connection_close::APPLICATION_TAG => {
                parse!(connection_close, ConnectionClose)
            }
            handshake_done::HANDSHAKE_DONE_TAG => parse!(handshake_done, HandshakeDone),
            _ => Err(DecoderError::InvariantViolation("invalid frame")),
        }
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        match self {
            Frame::Padding(frame) => frame.tag(),
            Frame::Ping(frame) => frame.tag(),
            Frame::Ack(frame) => frame.tag(),
            Frame::ResetStream(frame) => frame.tag(),
            Frame::StopSending(frame) => frame.tag(),
            Frame::Crypto(frame) => frame.tag(),
            Frame::NewToken(frame) => frame.tag(),
            Frame::Stream(frame) => frame.tag(),
            Frame::MaxData(frame) => frame.tag(),
            Frame::MaxStreamData(frame) => frame.tag(),
            Frame::MaxStreams(frame) => frame.tag(),
            Frame::DataBlocked(frame) => frame.tag(),
            Frame::StreamDataBlocked(frame) => frame.tag(),
            Frame::StreamsBlocked(frame) => frame.tag(),
            Frame::NewConnectionId(frame) => frame.tag(),
            Frame::RetireConnectionId(frame) => frame.tag(),
            Frame::PathChallenge(frame) => frame.tag(),
            Frame::PathResponse(frame) => frame.tag(),
            Frame::ConnectionClose(frame) => frame.tag(),
            Frame::HandshakeDone(frame) => frame.tag(),
        }
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-2
    //# Packets that contain ack-eliciting frames elicit an ACK from the
    //# receiver within the maximum acknowledgment delay and are called
    //# ack-eliciting packets.
    #[inline]
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding(_) | Frame::Ack(_) | Frame::ConnectionClose(_)
        )
    }
}

impl<'a> EncoderValue for Frame<'a> {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        match self {
            Frame::Padding(frame) => encoder.encode(frame),
            Frame::Ping(frame) => encoder.encode(frame),
            Frame::Ack(frame) => encoder.encode(frame),
            Frame::ResetStream(frame) => encoder.encode(frame),
            Frame::StopSending(frame) => encoder.encode(frame),
            Frame::Crypto(frame) => encoder.encode(frame),
            Frame::NewToken(frame) => encoder.encode(frame),
            Frame::Stream(frame) => encoder.encode(frame),
            Frame::MaxData(frame) => encoder.encode(frame),
            Frame::MaxStreamData(frame) => encoder.encode(frame),
            Frame::MaxStreams(frame) => encoder.encode(frame),
            Frame::DataBlocked(frame) => encoder.encode(frame),
            Frame::StreamDataBlocked(frame) => encoder.encode(frame),
            Frame::StreamsBlocked(frame) => encoder.encode(frame),
            Frame::NewConnectionId(frame) => encoder.encode(frame),
            Frame::RetireConnectionId(frame) => encoder.encode(frame),
            Frame::PathChallenge(frame) => encoder.encode(frame),
            Frame::PathResponse(frame) => encoder.encode(frame),
            Frame::ConnectionClose(frame) => encoder.encode(frame),
            Frame::HandshakeDone(frame) => encoder.encode(frame),
        }
    }
}

#[cfg(test)]
mod tests;
