// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{connection::ConnectionId, stateless_reset, varint::VarInt};
use s2n_codec::{decoder_invariant, decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
//# An endpoint sends a NEW_CONNECTION_ID frame (type=0x18) to provide
//# its peer with alternative connection IDs that can be used to break
//# linkability when migrating connections.

pub const NEW_CONNECTION_ID_TAG: u8 = 0x18;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
//# NEW_CONNECTION_ID Frame {
//#   Type (i) = 0x18,
//#   Sequence Number (i),
//#   Retire Prior To (i),
//#   Length (8),
//#   Connection ID (8..160),
//#   Stateless Reset Token (128),
//# }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewConnectionId {
    /// The sequence number assigned by the issuer
    pub sequence_number: VarInt,

    /// Connection IDs with sequence numbers below this are retired
    pub retire_prior_to: VarInt,

    pub connection_id: ConnectionId,

    /// The token to use if a stateless reset arrives under this ID
    pub stateless_reset_token: stateless_reset::Token,
}

impl NewConnectionId {
    #[inline]
    pub fn tag(&self) -> u8 {
        NEW_CONNECTION_ID_TAG
    }
}

decoder_parameterized_value!(
    impl<'a> NewConnectionId {
        fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let (sequence_number, buffer) = buffer.decode::<VarInt>()?;
            let (retire_prior_to, buffer) = buffer.decode::<VarInt>()?;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# Receiving a value in the Retire Prior To field that is greater
            //# than that in the Sequence Number field MUST be treated as a
            //# connection error of type FRAME_ENCODING_ERROR.
            decoder_invariant!(
                retire_prior_to <= sequence_number,
                "retire_prior_to exceeds sequence number"
            );

            let (connection_id, buffer) = buffer.decode::<ConnectionId>()?;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# Values less than 1 and greater than 20 are invalid and MUST be
            //# treated as a connection error of type FRAME_ENCODING_ERROR.
            decoder_invariant!(!connection_id.is_empty(), "zero-length connection id");

            let (stateless_reset_token, buffer) = buffer.decode()?;

            let frame = NewConnectionId {
                sequence_number,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            };

            Ok((frame, buffer))
        }
    }
);

impl EncoderValue for NewConnectionId {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.tag());
        encoder.encode(&self.sequence_number);
        encoder.encode(&self.retire_prior_to);
        encoder.encode(&self.connection_id);
        encoder.encode(&self.stateless_reset_token);
    }
}
