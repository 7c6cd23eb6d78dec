// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{connection::ConnectionId, range::RangeSet, stateless_reset, varint::VarInt};
use s2n_codec::EncoderBuffer;

fn varint(value: u64) -> VarInt {
    VarInt::new(value).unwrap()
}

/// Encodes `frame`, decodes the bytes, and checks the round trip
fn round_trip(frame: Frame) {
    let mut bytes = [0u8; 1500];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&frame);
    let len = encoder.len();

    let (decoded, remaining) = Frame::decode(DecoderBuffer::new(&bytes[..len])).unwrap();
    assert!(remaining.is_empty(), "{frame:?} leaves undecoded bytes");
    assert_eq!(decoded, frame);

    // encoding the decoded value reproduces the bytes
    let mut reencoded = [0u8; 1500];
    let mut encoder = EncoderBuffer::new(&mut reencoded);
    encoder.encode(&decoded);
    let reencoded_len = encoder.len();
    assert_eq!(&bytes[..len], &reencoded[..reencoded_len]);
}

#[test]
fn padding() {
    round_trip(Frame::Padding(Padding { length: 1 }));
    round_trip(Frame::Padding(Padding { length: 37 }));
}

#[test]
fn ping() {
    round_trip(Frame::Ping(Ping));
}

#[test]
fn ack() {
    let mut set = RangeSet::new();
    set.add(1, 3);
    set.add(7, 1);
    set.add(10_000, 100);

    let frame = Ack {
        ack_delay: varint(1234),
        ack_ranges: ack::RangeSetAckRanges(&set),
        ecn_counts: None,
    };

    let mut bytes = [0u8; 256];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&frame);
    let len = encoder.len();

    let (decoded, remaining) = Frame::decode(DecoderBuffer::new(&bytes[..len])).unwrap();
    assert!(remaining.is_empty());
    let Frame::Ack(decoded) = decoded else {
        panic!("expected ack");
    };

    assert_eq!(decoded.largest_acknowledged(), 10_099);
    assert_eq!(decoded.ack_delay, varint(1234));
    let ranges: Vec<_> = decoded.ack_ranges().collect();
    assert_eq!(ranges, vec![10_000..=10_099, 7..=7, 1..=3]);
}

#[test]
fn ack_with_ecn() {
    let mut set = RangeSet::new();
    set.add(5, 10);

    let frame = Ack {
        ack_delay: varint(0),
        ack_ranges: ack::RangeSetAckRanges(&set),
        ecn_counts: Some(ack::EcnCounts {
            ect_0_count: varint(4),
            ect_1_count: varint(0),
            ce_count: varint(1),
        }),
    };

    let mut bytes = [0u8; 64];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&frame);
    let len = encoder.len();

    let (decoded, _) = Frame::decode(DecoderBuffer::new(&bytes[..len])).unwrap();
    let Frame::Ack(decoded) = decoded else {
        panic!("expected ack");
    };
    assert_eq!(decoded.tag(), ack::ACK_W_ECN_TAG);
    assert_eq!(decoded.ecn_counts.unwrap().ce_count, varint(1));
}

#[test]
fn malformed_ack_ranges() {
    // largest=2 but first range claims 5 acked packets
    let bytes = [ack::ACK_TAG, 0x02, 0x00, 0x00, 0x05];
    assert!(Frame::decode(DecoderBuffer::new(&bytes)).is_err());

    // range count promises more ranges than are present
    let bytes = [ack::ACK_TAG, 0x0a, 0x00, 0x02, 0x01];
    assert!(Frame::decode(DecoderBuffer::new(&bytes)).is_err());
}

#[test]
fn reset_stream() {
    round_trip(Frame::ResetStream(ResetStream {
        stream_id: varint(4),
        application_error_code: varint(77),
        final_size: varint(1 << 20),
    }));
}

#[test]
fn stop_sending() {
    round_trip(Frame::StopSending(StopSending {
        stream_id: varint(3),
        application_error_code: varint(0),
    }));
}

#[test]
fn crypto() {
    round_trip(Frame::Crypto(Crypto {
        offset: varint(0),
        data: b"client hello",
    }));
    round_trip(Frame::Crypto(Crypto {
        offset: varint(16_384),
        data: &[],
    }));
}

#[test]
fn new_token() {
    round_trip(Frame::NewToken(NewToken { token: b"opaque" }));

    // empty tokens are a FRAME_ENCODING_ERROR
    let bytes = [new_token::NEW_TOKEN_TAG, 0x00];
    assert!(Frame::decode(DecoderBuffer::new(&bytes)).is_err());
}

#[test]
fn stream() {
    for offset in [0u64, 63, 1 << 20] {
        for is_fin in [false, true] {
            for is_last_frame in [false, true] {
                round_trip(Frame::Stream(Stream {
                    stream_id: varint(8),
                    offset: varint(offset),
                    is_last_frame,
                    is_fin,
                    data: b"stream payload",
                }));
            }
        }
    }
}

#[test]
fn stream_fitting() {
    let mut frame = Stream {
        stream_id: varint(4),
        offset: varint(0),
        is_last_frame: false,
        is_fin: false,
        data: &[0x55; 100],
    };

    // plenty of room: all data plus a length prefix
    assert_eq!(frame.max_data_for_capacity(200), Some(100));
    assert!(!frame.is_last_frame);

    // exactly data + header, no room for the length prefix
    let fixed = 2; // tag + stream id
    assert_eq!(frame.max_data_for_capacity(fixed + 100), Some(100));
    assert!(frame.is_last_frame);

    // truncation
    assert_eq!(frame.max_data_for_capacity(fixed + 10), Some(10));
    assert!(frame.is_last_frame);

    // nothing fits
    assert_eq!(frame.max_data_for_capacity(1), None);
}

#[test]
fn max_data() {
    round_trip(Frame::MaxData(MaxData {
        maximum_data: varint(1 << 30),
    }));
}

#[test]
fn max_stream_data() {
    round_trip(Frame::MaxStreamData(MaxStreamData {
        stream_id: varint(0),
        maximum_stream_data: varint(65_536),
    }));
}

#[test]
fn max_streams() {
    for stream_type in [
        crate::stream::StreamType::Bidirectional,
        crate::stream::StreamType::Unidirectional,
    ] {
        round_trip(Frame::MaxStreams(MaxStreams {
            stream_type,
            maximum_streams: varint(100),
        }));
    }
}

#[test]
fn blocked_frames() {
    round_trip(Frame::DataBlocked(DataBlocked {
        data_limit: varint(4096),
    }));
    round_trip(Frame::StreamDataBlocked(StreamDataBlocked {
        stream_id: varint(8),
        stream_data_limit: varint(1024),
    }));
    for stream_type in [
        crate::stream::StreamType::Bidirectional,
        crate::stream::StreamType::Unidirectional,
    ] {
        round_trip(Frame::StreamsBlocked(StreamsBlocked {
            stream_type,
            stream_limit: varint(2),
        }));
    }
}

#[test]
fn new_connection_id() {
    round_trip(Frame::NewConnectionId(NewConnectionId {
        sequence_number: varint(3),
        retire_prior_to: varint(1),
        connection_id: ConnectionId::try_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap(),
        stateless_reset_token: stateless_reset::Token::new([0xee; 16]),
    }));

    // retire_prior_to above the sequence number is invalid
    let frame = NewConnectionId {
        sequence_number: varint(1),
        retire_prior_to: varint(1),
        connection_id: ConnectionId::try_from_slice(&[9; 4]).unwrap(),
        stateless_reset_token: stateless_reset::Token::new([0; 16]),
    };
    let mut bytes = [0u8; 64];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&frame);
    let len = encoder.len();
    bytes[1] = 0; // sequence number below retire_prior_to
    assert!(Frame::decode(DecoderBuffer::new(&bytes[..len])).is_err());
}

#[test]
fn retire_connection_id() {
    round_trip(Frame::RetireConnectionId(RetireConnectionId {
        sequence_number: varint(9),
    }));
}

#[test]
fn path_frames() {
    round_trip(Frame::PathChallenge(PathChallenge {
        data: [1, 2, 3, 4, 5, 6, 7, 8],
    }));
    round_trip(Frame::PathResponse(PathResponse {
        data: [8, 7, 6, 5, 4, 3, 2, 1],
    }));
}

#[test]
fn connection_close() {
    round_trip(Frame::ConnectionClose(ConnectionClose {
        error_code: varint(0x0a),
        frame_type: Some(varint(0x18)),
        reason: Some(b"retire_prior_to exceeds sequence number"),
    }));
    round_trip(Frame::ConnectionClose(ConnectionClose {
        error_code: varint(99),
        frame_type: None,
        reason: None,
    }));
}

#[test]
fn handshake_done() {
    round_trip(Frame::HandshakeDone(HandshakeDone));
}

#[test]
fn unknown_frame_types() {
    for tag in [0x1fu8, 0x40, 0x80, 0xff] {
        let bytes = [tag, 0, 0, 0];
        assert!(Frame::decode(DecoderBuffer::new(&bytes)).is_err());
    }
}

#[test]
fn ack_elicitation() {
    assert!(!Frame::Padding(Padding { length: 1 }).is_ack_eliciting());
    assert!(!Frame::ConnectionClose(ConnectionClose {
        error_code: varint(0),
        frame_type: None,
        reason: None,
    })
    .is_ack_eliciting());
    assert!(Frame::Ping(Ping).is_ack_eliciting());
    assert!(Frame::Stream(Stream {
        stream_id: varint(0),
        offset: varint(0),
        is_last_frame: true,
        is_fin: false,
        data: &[],
    })
    .is_ack_eliciting());

    let mut set = RangeSet::new();
    set.add_value(0);
    let ack = Ack {
        ack_delay: varint(0),
        ack_ranges: ack::RangeSetAckRanges(&set),
        ecn_counts: None,
    };
    let mut bytes = [0u8; 16];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&ack);
    let len = encoder.len();
    let (decoded, _) = Frame::decode(DecoderBuffer::new(&bytes[..len])).unwrap();
    assert!(!decoded.is_ack_eliciting());
}