// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Long header packets: Initial, 0-RTT, Handshake, Retry and Version
//! Negotiation

use crate::{
    connection::ConnectionId,
    crypto,
    packet::{
        number::TruncatedPacketNumber, Encrypted, PacketType, ProtectedPacket, FIXED_BIT, FORM_BIT,
        LONG_TYPE_MASK,
    },
    varint::VarInt,
};
use core::ops::Range;
use s2n_codec::{decoder_invariant, DecoderBufferMut, DecoderError, Encoder, EncoderBuffer};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# Long Header Packet {
//#   Header Form (1) = 1,
//#   Fixed Bit (1) = 1,
//#   Long Packet Type (2),
//#   Type-Specific Bits (4),
//#   Version (32),
//#   Destination Connection ID Length (8),
//#   Destination Connection ID (0..160),
//#   Source Connection ID Length (8),
//#   Source Connection ID (0..160),
//#   Type-Specific Payload (..),
//# }

pub(crate) fn decode(
    buffer: DecoderBufferMut,
) -> Result<(ProtectedPacket, DecoderBufferMut), DecoderError> {
    let datagram_len = buffer.len();
    let peek = buffer.peek();

    let (first, peek) = peek.decode::<u8>()?;
    let (version, peek) = peek.decode::<u32>()?;

    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
    //# A Version Negotiation packet is inherently not version specific.
    //# It will be identified as a Version Negotiation packet based on the
    //# Version field having a value of 0.
    if version == 0 {
        let (dcid, peek) = peek.decode::<ConnectionId>()?;
        let (scid, mut peek) = peek.decode::<ConnectionId>()?;

        let mut versions = Vec::new();
        while !peek.is_empty() {
            let (version, remaining) = peek.decode::<u32>()?;
            versions.push(version);
            peek = remaining;
        }
        decoder_invariant!(!versions.is_empty(), "empty version negotiation");

        let (_, remaining) = buffer.decode_slice(datagram_len)?;
        let packet = VersionNegotiation {
            dcid,
            scid,
            versions,
        };
        return Ok((ProtectedPacket::VersionNegotiation(packet), remaining));
    }

    decoder_invariant!(first & FIXED_BIT != 0, "fixed bit not set");

    let (dcid, peek) = peek.decode::<ConnectionId>()?;
    let (scid, peek) = peek.decode::<ConnectionId>()?;

    let packet_type = match (first & LONG_TYPE_MASK) >> 4 {
        0b00 => PacketType::Initial,
        0b01 => PacketType::ZeroRtt,
        0b10 => PacketType::Handshake,
        _ => PacketType::Retry,
    };

    if packet_type == PacketType::Retry {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5
        //# Retry Packet {
        //#   ...
        //#   Retry Token (..),
        //#   Retry Integrity Tag (128),
        //# }
        let header_len = datagram_len - peek.len();
        decoder_invariant!(
            datagram_len >= header_len + crypto::key::TAG_LEN,
            "retry packet too short"
        );
        let token = header_len..datagram_len - crypto::key::TAG_LEN;
        decoder_invariant!(!token.is_empty(), "retry token must be non-empty");

        let (bytes, remaining) = buffer.decode_slice(datagram_len)?;
        let packet = Retry {
            version,
            dcid,
            scid,
            token,
            bytes: bytes.into_less_safe_slice(),
        };
        return Ok((ProtectedPacket::Retry(packet), remaining));
    }

    // Initial packets carry an address-validation token
    let (token, peek) = if packet_type == PacketType::Initial {
        let (token_len, peek) = peek.decode::<VarInt>()?;
        let token_len: usize = token_len
            .try_into()
            .map_err(|_| DecoderError::LengthCapacityExceeded)?;
        let token_start = datagram_len - peek.len();
        let peek = peek.skip(token_len)?;
        (token_start..token_start + token_len, peek)
    } else {
        (0..0, peek)
    };

    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
    //# Length:  This is the length of the remainder of the packet (that is,
    //# the Packet Number and Payload fields) in bytes
    let (length, peek) = peek.decode::<VarInt>()?;
    let length: usize = length
        .try_into()
        .map_err(|_| DecoderError::LengthCapacityExceeded)?;

    let header_len = datagram_len - peek.len();
    let packet_len = header_len
        .checked_add(length)
        .ok_or(DecoderError::LengthCapacityExceeded)?;
    decoder_invariant!(packet_len <= datagram_len, "packet length exceeds datagram");

    let (bytes, remaining) = buffer.decode_slice(packet_len)?;
    let packet = Encrypted::new(
        packet_type,
        version,
        dcid,
        Some(scid),
        token,
        header_len,
        bytes.into_less_safe_slice(),
    );
    Ok((ProtectedPacket::Encrypted(packet), remaining))
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
//# Version Negotiation Packet {
//#   Header Form (1) = 1,
//#   Unused (7),
//#   Version (32) = 0,
//#   Destination Connection ID Length (8),
//#   Destination Connection ID (0..2040),
//#   Source Connection ID Length (8),
//#   Source Connection ID (0..2040),
//#   Supported Version (32) ...,
//# }

#[derive(Debug)]
pub struct VersionNegotiation {
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub versions: Vec<u32>,
}

/// Encodes a Version Negotiation packet answering a packet that
/// carried (`their_scid`, `their_dcid`)
pub fn encode_version_negotiation<E: Encoder>(
    encoder: &mut E,
    their_scid: &ConnectionId,
    their_dcid: &ConnectionId,
    unpredictable_bits: u8,
) {
    encoder.encode(&(FORM_BIT | unpredictable_bits));
    encoder.encode(&0u32);
    encoder.encode(their_scid);
    encoder.encode(their_dcid);
    for version in crate::packet::SUPPORTED_VERSIONS {
        encoder.encode(version);
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5
//# Retry Packet {
//#   Header Form (1) = 1,
//#   Fixed Bit (1) = 1,
//#   Long Packet Type (2) = 3,
//#   Unused (4),
//#   Version (32),
//#   Destination Connection ID Length (8),
//#   Destination Connection ID (0..160),
//#   Source Connection ID Length (8),
//#   Source Connection ID (0..160),
//#   Retry Token (..),
//#   Retry Integrity Tag (128),
//# }

pub struct Retry<'a> {
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    token: Range<usize>,
    bytes: &'a [u8],
}

impl Retry<'_> {
    #[inline]
    pub fn token(&self) -> &[u8] {
        &self.bytes[self.token.clone()]
    }

    /// Validates the integrity tag against the DCID this endpoint sent
    /// in its first Initial
    #[inline]
    pub fn is_tag_valid(&self, odcid: &ConnectionId) -> bool {
        crypto::retry::is_retry_tag_valid(odcid.as_bytes(), self.bytes)
    }
}

impl core::fmt::Debug for Retry<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Retry")
            .field("dcid", &self.dcid)
            .field("scid", &self.scid)
            .field("token_len", &self.token.len())
            .finish()
    }
}

/// Encodes a complete Retry packet, integrity tag included
pub fn encode_retry(
    encoder: &mut EncoderBuffer,
    version: u32,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    odcid: &ConnectionId,
    token: &[u8],
) {
    let start = encoder.len();

    encoder.encode(&(FORM_BIT | FIXED_BIT | (PacketType::Retry.long_type_bits() << 4)));
    encoder.encode(&version);
    encoder.encode(dcid);
    encoder.encode(scid);
    encoder.write_slice(token);

    let end = encoder.len();
    let tag = {
        let (written, _) = encoder.split_mut();
        crypto::retry::retry_tag(odcid.as_bytes(), &written[start..end])
    };
    encoder.write_slice(&tag);
}

/// Writes a long header, leaving a two-byte length placeholder to be
/// backfilled once the payload size is known
pub struct LongHeaderBuilder<'a> {
    pub packet_type: PacketType,
    pub version: u32,
    pub dcid: &'a ConnectionId,
    pub scid: &'a ConnectionId,
    pub token: &'a [u8],
}

/// The positions a [`LongHeaderBuilder`] needs to finish the packet
#[derive(Clone, Copy, Debug)]
pub struct LongHeaderMark {
    length_pos: usize,
    pub pn_offset: usize,
    pub pn_len: usize,
}

impl LongHeaderBuilder<'_> {
    pub fn encode(&self, encoder: &mut EncoderBuffer, pn: TruncatedPacketNumber) -> LongHeaderMark {
        debug_assert!(self.token.is_empty() || self.packet_type == PacketType::Initial);

        let tag = FORM_BIT
            | FIXED_BIT
            | (self.packet_type.long_type_bits() << 4)
            | pn.len().into_packet_tag_bits();
        encoder.encode(&tag);
        encoder.encode(&self.version);
        encoder.encode(self.dcid);
        encoder.encode(self.scid);

        if self.packet_type == PacketType::Initial {
            let token_len = VarInt::try_from(self.token.len()).expect("token fits a varint");
            encoder.encode(&token_len);
            encoder.write_slice(self.token);
        }

        let length_pos = encoder.len();
        encoder.write_repeated(2, 0);

        let pn_offset = encoder.len();
        encoder.encode(&pn);

        LongHeaderMark {
            length_pos,
            pn_offset,
            pn_len: pn.len().bytesize(),
        }
    }
}

impl LongHeaderMark {
    /// Backfills the length field to cover the packet number, the
    /// payload written so far and the AEAD tag that will follow
    pub fn finish(&self, encoder: &mut EncoderBuffer, tag_len: usize) {
        let end = encoder.len();
        let length = end - self.pn_offset + tag_len;
        debug_assert!(length < 1 << 14, "length must fit a two-byte varint");

        encoder.set_position(self.length_pos);
        encoder.encode(&((length as u16) | 0x4000));
        encoder.set_position(end);
    }
}
