// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{endpoint, stream::StreamType, varint::VarInt};

//= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
//# The two least significant bits from a stream ID therefore identify a
//# stream as one of four types, as summarized in Table 1.
//#
//#        +======+==================================+
//#        | Bits | Stream Type                      |
//#        +======+==================================+
//#        | 0x00 | Client-Initiated, Bidirectional  |
//#        +------+----------------------------------+
//#        | 0x01 | Server-Initiated, Bidirectional  |
//#        +------+----------------------------------+
//#        | 0x02 | Client-Initiated, Unidirectional |
//#        +------+----------------------------------+
//#        | 0x03 | Server-Initiated, Unidirectional |
//#        +------+----------------------------------+

/// A 62-bit stream ID; the two low bits carry initiator and direction
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
pub struct StreamId(VarInt);

impl StreamId {
    #[inline]
    pub const fn from_varint(id: VarInt) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn as_varint(self) -> VarInt {
        self.0
    }

    /// The first stream ID of the given type; e.g. the first
    /// server-initiated unidirectional stream is ID 3
    #[inline]
    pub fn initial(initiator: endpoint::Type, stream_type: StreamType) -> Self {
        let type_bits = match (initiator, stream_type) {
            (endpoint::Type::Client, StreamType::Bidirectional) => 0,
            (endpoint::Type::Server, StreamType::Bidirectional) => 1,
            (endpoint::Type::Client, StreamType::Unidirectional) => 2,
            (endpoint::Type::Server, StreamType::Unidirectional) => 3,
        };
        Self(VarInt::from_u8(type_bits))
    }

    /// The `n`-th stream ID of the given type, `None` past the ID space
    #[inline]
    pub fn nth(initiator: endpoint::Type, stream_type: StreamType, n: u64) -> Option<Self> {
        let initial = Self::initial(initiator, stream_type);
        let id = n
            .checked_mul(4)?
            .checked_add(initial.as_varint().as_u64())?;
        VarInt::new(id).ok().map(Self)
    }

    /// The ordinal of this ID within its type (inverse of [`Self::nth`])
    #[inline]
    pub fn ordinal(self) -> u64 {
        self.0.as_u64() >> 2
    }

    /// The next stream ID of the same type, `None` past the ID space
    #[inline]
    pub fn next_of_type(self) -> Option<Self> {
        self.0.checked_add(VarInt::from_u8(4)).map(Self)
    }

    #[inline]
    pub fn initiator(self) -> endpoint::Type {
        if self.0.as_u64() & 0x01 == 0 {
            endpoint::Type::Client
        } else {
            endpoint::Type::Server
        }
    }

    #[inline]
    pub fn stream_type(self) -> StreamType {
        if self.0.as_u64() & 0x02 == 0 {
            StreamType::Bidirectional
        } else {
            StreamType::Unidirectional
        }
    }

    /// True if the peer of `local_role` initiated this stream
    #[inline]
    pub fn is_peer_initiated(self, local_role: endpoint::Type) -> bool {
        self.initiator() != local_role
    }
}

impl From<StreamId> for VarInt {
    #[inline]
    fn from(id: StreamId) -> Self {
        id.0
    }
}

impl From<StreamId> for u64 {
    #[inline]
    fn from(id: StreamId) -> Self {
        id.0.as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varint::MAX_VARINT_VALUE;

    #[test]
    fn type_boundaries() {
        for (id, initiator, stream_type) in [
            (0u64, endpoint::Type::Client, StreamType::Bidirectional),
            (1, endpoint::Type::Server, StreamType::Bidirectional),
            (2, endpoint::Type::Client, StreamType::Unidirectional),
            (3, endpoint::Type::Server, StreamType::Unidirectional),
        ] {
            let initial = StreamId::initial(initiator, stream_type);
            assert_eq!(initial.as_varint().as_u64(), id);
            assert_eq!(initial.initiator(), initiator);
            assert_eq!(initial.stream_type(), stream_type);
            assert_eq!(initial.ordinal(), 0);
        }
    }

    #[test]
    fn id_space_end() {
        // 2^62 - 4 is the last client-bidi stream
        let id = StreamId::from_varint(VarInt::new(MAX_VARINT_VALUE - 3).unwrap());
        assert_eq!(id.initiator(), endpoint::Type::Client);
        assert_eq!(id.stream_type(), StreamType::Bidirectional);
        assert!(id.next_of_type().is_none());

        let n = id.ordinal();
        assert_eq!(
            StreamId::nth(endpoint::Type::Client, StreamType::Bidirectional, n),
            Some(id)
        );
        assert_eq!(
            StreamId::nth(endpoint::Type::Client, StreamType::Bidirectional, n + 1),
            None
        );
    }

    #[test]
    fn nth_round_trip() {
        for n in [0u64, 1, 2, 100, 1 << 40] {
            for initiator in [endpoint::Type::Client, endpoint::Type::Server] {
                for ty in [StreamType::Bidirectional, StreamType::Unidirectional] {
                    let id = StreamId::nth(initiator, ty, n).unwrap();
                    assert_eq!(id.ordinal(), n);
                    assert_eq!(id.initiator(), initiator);
                    assert_eq!(id.stream_type(), ty);
                }
            }
        }
    }
}
