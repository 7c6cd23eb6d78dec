// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! 1-RTT short header packets

use crate::{
    connection::ConnectionId,
    packet::{
        number::TruncatedPacketNumber, Encrypted, PacketType, ProtectedPacket, FIXED_BIT,
        KEY_PHASE_BIT, SPIN_BIT,
    },
};
use s2n_codec::{decoder_invariant, DecoderBufferMut, DecoderError, EncoderBuffer, Encoder};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.3.1
//# 1-RTT Packet {
//#   Header Form (1) = 0,
//#   Fixed Bit (1) = 1,
//#   Spin Bit (1),
//#   Reserved Bits (2),
//#   Key Phase (1),
//#   Packet Number Length (2),
//#   Destination Connection ID (0..160),
//#   Packet Number (8..32),
//#   Packet Payload (8..),
//# }

pub(crate) fn decode(
    buffer: DecoderBufferMut,
    dcid_len: usize,
) -> Result<(ProtectedPacket, DecoderBufferMut), DecoderError> {
    let datagram_len = buffer.len();
    let peek = buffer.peek();

    let (first, peek) = peek.decode::<u8>()?;
    decoder_invariant!(first & FIXED_BIT != 0, "fixed bit not set");

    let (dcid, peek) = peek.decode_slice(dcid_len)?;
    let dcid = ConnectionId::try_from_slice(dcid.as_less_safe_slice())
        .map_err(|_| DecoderError::InvariantViolation("invalid connection id"))?;

    let header_len = datagram_len - peek.len();

    // a short header packet is never coalesced with a following packet
    let (bytes, remaining) = buffer.decode_slice(datagram_len)?;
    let packet = Encrypted::new(
        PacketType::OneRtt,
        0,
        dcid,
        None,
        0..0,
        header_len,
        bytes.into_less_safe_slice(),
    );
    Ok((ProtectedPacket::Encrypted(packet), remaining))
}

/// Writes a short header; unlike long headers there is no length field
/// to backfill
pub struct ShortHeaderBuilder<'a> {
    pub dcid: &'a ConnectionId,
    pub spin_bit: bool,
    pub key_phase: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct ShortHeaderMark {
    pub pn_offset: usize,
    pub pn_len: usize,
}

impl ShortHeaderBuilder<'_> {
    pub fn encode(&self, encoder: &mut EncoderBuffer, pn: TruncatedPacketNumber) -> ShortHeaderMark {
        let mut tag = FIXED_BIT | pn.len().into_packet_tag_bits();
        if self.spin_bit {
            tag |= SPIN_BIT;
        }
        if self.key_phase {
            tag |= KEY_PHASE_BIT;
        }
        encoder.encode(&tag);
        encoder.write_slice(self.dcid.as_bytes());

        let pn_offset = encoder.len();
        encoder.encode(&pn);

        ShortHeaderMark {
            pn_offset,
            pn_len: pn.len().bytesize(),
        }
    }
}
