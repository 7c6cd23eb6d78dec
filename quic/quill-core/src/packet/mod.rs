// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet header codecs.
//!
//! Decoding happens in two stages. `ProtectedPacket::decode` splits one
//! packet off the front of a datagram, parsing only the cleartext
//! header fields (enough to route and to find the packet-number
//! offset). Header protection removal and AEAD opening then happen in
//! place on the packet's bytes.

pub mod long;
pub mod number;
pub mod short;

use crate::{
    connection::ConnectionId,
    crypto::{self, CryptoError, HeaderKey, OneRttKeySet, PacketKey},
    packet::number::{PacketNumber, PacketNumberLen},
};
use core::ops::Range;
use s2n_codec::{DecoderBufferMut, DecoderError};

pub(crate) type Tag = u8;

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# Header Form:  The most significant bit (0x80) of byte 0 (the first
//# byte) is set to 1 for long headers.
pub const FORM_BIT: u8 = 0x80;

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# Fixed Bit:  The next bit (0x40) of byte 0 is set to 1, unless the
//# packet is a Version Negotiation packet.
pub const FIXED_BIT: u8 = 0x40;

pub const SPIN_BIT: u8 = 0x20;
pub const KEY_PHASE_BIT: u8 = 0x04;

const LONG_TYPE_MASK: u8 = 0x30;

/// QUIC version 1
pub const VERSION_V1: u32 = 0x0000_0001;

pub const SUPPORTED_VERSIONS: &[u32] = &[VERSION_V1];

#[inline]
pub fn is_version_supported(version: u32) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    VersionNegotiation,
    OneRtt,
}

impl PacketType {
    /// The long-header type bits for this packet type
    #[inline]
    fn long_type_bits(self) -> u8 {
        match self {
            Self::Initial => 0b00,
            Self::ZeroRtt => 0b01,
            Self::Handshake => 0b10,
            Self::Retry => 0b11,
            _ => unreachable!("not a long header type"),
        }
    }

    #[inline]
    pub fn is_long(self) -> bool {
        !matches!(self, Self::OneRtt)
    }
}

/// One packet split off a datagram, header protection still applied
pub enum ProtectedPacket<'a> {
    Encrypted(Encrypted<'a>),
    Retry(long::Retry<'a>),
    VersionNegotiation(long::VersionNegotiation),
}

impl<'a> ProtectedPacket<'a> {
    /// Splits the next packet off `buffer`.
    ///
    /// `short_dcid_len` is the length of locally issued connection IDs,
    /// needed to delimit short headers. Long-header packets consume
    /// exactly their length field; short-header and Retry packets
    /// extend to the end of the datagram.
    pub fn decode(
        buffer: DecoderBufferMut<'a>,
        short_dcid_len: usize,
    ) -> Result<(Self, DecoderBufferMut<'a>), DecoderError> {
        let first = buffer.peek_byte(0)?;

        if first & FORM_BIT == 0 {
            return short::decode(buffer, short_dcid_len);
        }

        long::decode(buffer)
    }

    #[inline]
    pub fn dcid(&self) -> ConnectionId {
        match self {
            Self::Encrypted(packet) => packet.dcid,
            Self::Retry(packet) => packet.dcid,
            Self::VersionNegotiation(packet) => packet.dcid,
        }
    }
}

/// An Initial, 0-RTT, Handshake or 1-RTT packet before unprotection.
///
/// `bytes` spans the whole packet; `header_len` is the offset of the
/// (still protected) packet number.
pub struct Encrypted<'a> {
    pub packet_type: PacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: Option<ConnectionId>,
    pub(crate) token: Range<usize>,
    pub header_len: usize,
    pub(crate) bytes: &'a mut [u8],
    pn_len: Option<PacketNumberLen>,
}

impl<'a> Encrypted<'a> {
    pub(crate) fn new(
        packet_type: PacketType,
        version: u32,
        dcid: ConnectionId,
        scid: Option<ConnectionId>,
        token: Range<usize>,
        header_len: usize,
        bytes: &'a mut [u8],
    ) -> Self {
        Self {
            packet_type,
            version,
            dcid,
            scid,
            token,
            header_len,
            bytes,
            pn_len: None,
        }
    }

    /// The address-validation token of an Initial packet, empty otherwise
    #[inline]
    pub fn token(&self) -> &[u8] {
        &self.bytes[self.token.clone()]
    }

    /// The packet's full wire bytes, e.g. for buffering until keys
    /// arrive
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Removes header protection in place, reconstructing the full
    /// packet number from the space's largest processed value
    pub fn unprotect(
        &mut self,
        header_key: &HeaderKey,
        largest_pn: Option<PacketNumber>,
    ) -> Result<PacketNumber, CryptoError> {
        let truncated = crypto::remove_header_protection(self.bytes, self.header_len, header_key)?;
        self.pn_len = Some(truncated.len());
        truncated
            .expand(largest_pn)
            .map_err(|_| CryptoError::DECODE_ERROR)
    }

    /// The key-phase bit; meaningful for 1-RTT packets after
    /// [`Self::unprotect`]
    #[inline]
    pub fn key_phase(&self) -> bool {
        debug_assert!(self.pn_len.is_some());
        self.bytes[0] & KEY_PHASE_BIT != 0
    }

    /// The latency spin bit of a 1-RTT packet
    #[inline]
    pub fn spin_bit(&self) -> bool {
        self.bytes[0] & SPIN_BIT != 0
    }

    #[inline]
    fn split_header(&mut self) -> Result<(&mut [u8], &mut [u8]), CryptoError> {
        let pn_len = self.pn_len.ok_or(CryptoError::INTERNAL_ERROR)?;
        let header_end = self.header_len + pn_len.bytesize();
        if self.bytes.len() < header_end {
            return Err(CryptoError::DECODE_ERROR);
        }
        Ok(self.bytes.split_at_mut(header_end))
    }

    /// AEAD-opens the payload in place, returning the cleartext frames
    pub fn decrypt(
        &mut self,
        key: &PacketKey,
        packet_number: PacketNumber,
    ) -> Result<&mut [u8], CryptoError> {
        let (header, payload) = self.split_header()?;
        key.open_in_place(packet_number, header, payload)
    }

    /// AEAD-opens a 1-RTT payload, resolving the key phase
    pub fn decrypt_one_rtt(
        &mut self,
        keys: &mut OneRttKeySet,
        packet_number: PacketNumber,
    ) -> Result<(&mut [u8], crypto::key::KeyPhaseOutcome), CryptoError> {
        let phase_bit = self.bytes[0] & KEY_PHASE_BIT != 0;
        let pn_len = self.pn_len.ok_or(CryptoError::INTERNAL_ERROR)?;
        let header_end = self.header_len + pn_len.bytesize();
        if self.bytes.len() < header_end {
            return Err(CryptoError::DECODE_ERROR);
        }
        let (header, payload) = self.bytes.split_at_mut(header_end);
        keys.open_in_place(phase_bit, packet_number, header, payload)
    }
}

impl core::fmt::Debug for Encrypted<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Encrypted")
            .field("packet_type", &self.packet_type)
            .field("version", &self.version)
            .field("dcid", &self.dcid)
            .field("scid", &self.scid)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Extracts the destination connection ID from a datagram's first
/// packet without consuming it; used by bindings to route
pub fn route_dcid(payload: &[u8], short_dcid_len: usize) -> Option<ConnectionId> {
    let first = *payload.first()?;

    if first & FORM_BIT == 0 {
        let dcid = payload.get(1..1 + short_dcid_len)?;
        return ConnectionId::try_from_slice(dcid).ok();
    }

    // long header: version(4), dcid len(1), dcid
    let dcid_len = *payload.get(5)? as usize;
    if dcid_len > crate::connection::id::MAX_LEN {
        return None;
    }
    let dcid = payload.get(6..6 + dcid_len)?;
    ConnectionId::try_from_slice(dcid).ok()
}

#[cfg(test)]
mod tests;
