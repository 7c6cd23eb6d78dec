// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet protection primitives.
//!
//! Keys are derived from TLS traffic secrets with the QUIC HKDF labels
//! and applied in two layers: AEAD over the packet payload, then a
//! header-protection mask derived from a ciphertext sample.

pub mod error;
pub mod initial;
pub mod key;
pub mod label;
pub mod retry;

pub use error::CryptoError;
pub use key::{HeaderKey, KeySet, OneRttKeySet, PacketKey};

use crate::packet::number::{PacketNumberLen, TruncatedPacketNumber};

/// The AEAD and hash pair protecting a connection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CipherSuite {
    #[default]
    Aes128GcmSha256,
    Aes256GcmSha384,
    ChaCha20Poly1305Sha256,
}

/// Number of payload bytes sampled for header protection
pub const HP_SAMPLE_LEN: usize = 16;

/// Offset of the header-protection sample from the start of the packet
/// number field. The sample is taken assuming a 4-byte packet number so
/// the mask does not depend on the protected length bits.
pub const HP_SAMPLE_OFFSET: usize = 4;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.1
//# mask = header_protection(hp_key, sample)
//#
//# The output of this algorithm is a 5-byte mask that is applied to the
//# protected header fields using exclusive OR.

/// Applies (or removes, the operation is an involution) the mask over
/// the packet-number bytes. The first-byte bits are handled separately
/// since the masked bit count differs between header forms.
#[inline]
fn mask_pn_bytes(packet: &mut [u8], pn_offset: usize, pn_len: usize, mask: &[u8; 5]) {
    for i in 0..pn_len {
        packet[pn_offset + i] ^= mask[1 + i];
    }
}

/// Removes header protection in place.
///
/// `packet` spans the full packet; `pn_offset` is where the packet
/// number begins. Returns the now-cleartext truncated packet number.
#[inline]
pub fn remove_header_protection(
    packet: &mut [u8],
    pn_offset: usize,
    header_key: &HeaderKey,
) -> Result<TruncatedPacketNumber, CryptoError> {
    let sample_start = pn_offset + HP_SAMPLE_OFFSET;
    let sample = packet
        .get(sample_start..sample_start + HP_SAMPLE_LEN)
        .ok_or(CryptoError::DECODE_ERROR)?;
    let mask = header_key.mask(sample)?;

    //= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.1
    //# the first byte of a long header packet has the four least
    //# significant bits masked, while a short header packet has five
    if packet[0] & crate::packet::FORM_BIT != 0 {
        packet[0] ^= mask[0] & 0x0f;
    } else {
        packet[0] ^= mask[0] & 0x1f;
    }

    let pn_len = PacketNumberLen::from_packet_tag(packet[0]);
    if packet.len() < pn_offset + pn_len.bytesize() {
        return Err(CryptoError::DECODE_ERROR);
    }
    mask_pn_bytes(packet, pn_offset, pn_len.bytesize(), &mask);

    let mut value = 0u32;
    for i in 0..pn_len.bytesize() {
        value = value << 8 | packet[pn_offset + i] as u32;
    }

    Ok(TruncatedPacketNumber::new(value, pn_len))
}

/// Applies header protection in place after the payload was encrypted
#[inline]
pub fn apply_header_protection(
    packet: &mut [u8],
    pn_offset: usize,
    pn_len: PacketNumberLen,
    header_key: &HeaderKey,
) -> Result<(), CryptoError> {
    let sample_start = pn_offset + HP_SAMPLE_OFFSET;
    let sample = packet
        .get(sample_start..sample_start + HP_SAMPLE_LEN)
        .ok_or(CryptoError::INTERNAL_ERROR)?;
    let mask = header_key.mask(sample)?;

    if packet[0] & crate::packet::FORM_BIT != 0 {
        packet[0] ^= mask[0] & 0x0f;
    } else {
        packet[0] ^= mask[0] & 0x1f;
    }
    mask_pn_bytes(packet, pn_offset, pn_len.bytesize(), &mask);

    Ok(())
}

#[cfg(test)]
mod tests;
