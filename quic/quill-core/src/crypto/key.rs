// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    crypto::{
        label::{self, hkdf_expand_label},
        CipherSuite, CryptoError,
    },
    packet::number::PacketNumber,
};
use core::fmt;
use ring::aead;
use zeroize::Zeroizing;

/// AEAD authentication tag length; identical for all supported suites
pub const TAG_LEN: usize = 16;

const NONCE_LEN: usize = 12;

#[inline]
fn aead_algorithm(suite: CipherSuite) -> &'static aead::Algorithm {
    match suite {
        CipherSuite::Aes128GcmSha256 => &aead::AES_128_GCM,
        CipherSuite::Aes256GcmSha384 => &aead::AES_256_GCM,
        CipherSuite::ChaCha20Poly1305Sha256 => &aead::CHACHA20_POLY1305,
    }
}

#[inline]
fn hp_algorithm(suite: CipherSuite) -> &'static aead::quic::Algorithm {
    match suite {
        CipherSuite::Aes128GcmSha256 => &aead::quic::AES_128,
        CipherSuite::Aes256GcmSha384 => &aead::quic::AES_256,
        CipherSuite::ChaCha20Poly1305Sha256 => &aead::quic::CHACHA20,
    }
}

#[inline]
fn key_len(suite: CipherSuite) -> usize {
    aead_algorithm(suite).key_len()
}

/// An AEAD key plus its IV, protecting packet payloads in one direction
pub struct PacketKey {
    key: aead::LessSafeKey,
    iv: Zeroizing<[u8; NONCE_LEN]>,
    suite: CipherSuite,
}

impl fmt::Debug for PacketKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PacketKey")
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

impl PacketKey {
    /// Derives the key and IV from a traffic secret
    pub fn from_secret(suite: CipherSuite, secret: &[u8]) -> Result<Self, CryptoError> {
        let mut key_bytes = Zeroizing::new([0u8; 32]);
        let key_bytes = &mut key_bytes[..key_len(suite)];
        hkdf_expand_label(suite, secret, label::KEY, key_bytes)?;

        let mut iv = Zeroizing::new([0u8; NONCE_LEN]);
        hkdf_expand_label(suite, secret, label::IV, &mut iv[..])?;

        let key = aead::UnboundKey::new(aead_algorithm(suite), key_bytes)
            .map_err(|_| CryptoError::INTERNAL_ERROR)?;

        Ok(Self {
            key: aead::LessSafeKey::new(key),
            iv,
            suite,
        })
    }

    #[inline]
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    //= https://www.rfc-editor.org/rfc/rfc9001#section-5.3
    //# The nonce, N, is formed by combining the packet protection IV with
    //# the packet number.  The 62 bits of the reconstructed QUIC packet
    //# number in network byte order are left-padded with zeros to the size
    //# of the IV.  The exclusive OR of the padded packet number and the IV
    //# forms the AEAD nonce.
    #[inline]
    fn nonce(&self, packet_number: PacketNumber) -> aead::Nonce {
        let mut nonce = *self.iv;
        let pn = packet_number.as_u64().to_be_bytes();
        for (nonce_byte, pn_byte) in nonce[NONCE_LEN - 8..].iter_mut().zip(pn) {
            *nonce_byte ^= pn_byte;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }

    /// Encrypts `in_out` in place; the final [`TAG_LEN`] bytes are
    /// overwritten with the authentication tag
    pub fn seal_in_place(
        &self,
        packet_number: PacketNumber,
        header: &[u8],
        in_out: &mut [u8],
    ) -> Result<(), CryptoError> {
        let payload_len = in_out
            .len()
            .checked_sub(TAG_LEN)
            .ok_or(CryptoError::INTERNAL_ERROR)?;
        let (payload, tag_space) = in_out.split_at_mut(payload_len);

        let tag = self
            .key
            .seal_in_place_separate_tag(self.nonce(packet_number), aead::Aad::from(header), payload)
            .map_err(|_| CryptoError::INTERNAL_ERROR)?;
        tag_space.copy_from_slice(tag.as_ref());
        Ok(())
    }

    /// Decrypts `in_out` (payload plus tag) in place, returning the
    /// cleartext prefix
    pub fn open_in_place<'a>(
        &self,
        packet_number: PacketNumber,
        header: &[u8],
        in_out: &'a mut [u8],
    ) -> Result<&'a mut [u8], CryptoError> {
        self.key
            .open_in_place(self.nonce(packet_number), aead::Aad::from(header), in_out)
            .map_err(|_| CryptoError::DECRYPT_ERROR)
    }
}

/// Derives the header-protection mask from a ciphertext sample
pub struct HeaderKey {
    key: aead::quic::HeaderProtectionKey,
    suite: CipherSuite,
}

impl fmt::Debug for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HeaderKey")
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

impl HeaderKey {
    pub fn from_secret(suite: CipherSuite, secret: &[u8]) -> Result<Self, CryptoError> {
        let mut key_bytes = Zeroizing::new([0u8; 32]);
        let key_bytes = &mut key_bytes[..key_len(suite)];
        hkdf_expand_label(suite, secret, label::HP, key_bytes)?;

        let key = aead::quic::HeaderProtectionKey::new(hp_algorithm(suite), key_bytes)
            .map_err(|_| CryptoError::INTERNAL_ERROR)?;

        Ok(Self { key, suite })
    }

    #[inline]
    pub fn mask(&self, sample: &[u8]) -> Result<[u8; 5], CryptoError> {
        self.key
            .new_mask(sample)
            .map_err(|_| CryptoError::DECRYPT_ERROR)
    }
}

/// The four keys protecting one encryption level
pub struct KeySet {
    pub sealer: PacketKey,
    pub sealer_hp: HeaderKey,
    pub opener: PacketKey,
    pub opener_hp: HeaderKey,
}

impl KeySet {
    /// Builds the level's keys from its transmit and receive secrets
    pub fn from_secrets(
        suite: CipherSuite,
        tx_secret: &[u8],
        rx_secret: &[u8],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            sealer: PacketKey::from_secret(suite, tx_secret)?,
            sealer_hp: HeaderKey::from_secret(suite, tx_secret)?,
            opener: PacketKey::from_secret(suite, rx_secret)?,
            opener_hp: HeaderKey::from_secret(suite, rx_secret)?,
        })
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeySet").finish_non_exhaustive()
    }
}

type Secret = Zeroizing<Vec<u8>>;

//= https://www.rfc-editor.org/rfc/rfc9001#section-6
//# An endpoint MUST retain old keys until it has successfully
//# unprotected a packet sent using the new keys.

/// 1-RTT keys with key-update support.
///
/// Header-protection keys never change across updates. One previous
/// generation of the receive key is retained to absorb packets
/// reordered across the key-phase boundary; the next generation is
/// pre-derived so an update initiated by the peer can be verified
/// before any state is committed.
pub struct OneRttKeySet {
    suite: CipherSuite,
    key_phase: bool,
    generation: u64,

    tx_secret: Secret,
    rx_secret: Secret,

    sealer: PacketKey,
    sealer_hp: HeaderKey,
    opener: PacketKey,
    opener_hp: HeaderKey,

    prev_opener: Option<PacketKey>,
    next_opener: PacketKey,

    /// Lowest packet number opened under the current generation; used
    /// to attribute phase-mismatched packets to the previous or the
    /// next generation without trial decryption
    phase_started_at: Option<PacketNumber>,
}

impl fmt::Debug for OneRttKeySet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OneRttKeySet")
            .field("key_phase", &self.key_phase)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// The outcome of opening a 1-RTT packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyPhaseOutcome {
    /// Opened under the current generation
    Current,
    /// Opened under the retained previous generation
    Previous,
    /// Opened under the next generation; the update was committed
    Updated,
}

impl OneRttKeySet {
    pub fn from_secrets(
        suite: CipherSuite,
        tx_secret: &[u8],
        rx_secret: &[u8],
    ) -> Result<Self, CryptoError> {
        let next_rx = next_secret(suite, rx_secret)?;
        Ok(Self {
            suite,
            key_phase: false,
            generation: 0,
            sealer: PacketKey::from_secret(suite, tx_secret)?,
            sealer_hp: HeaderKey::from_secret(suite, tx_secret)?,
            opener: PacketKey::from_secret(suite, rx_secret)?,
            opener_hp: HeaderKey::from_secret(suite, rx_secret)?,
            prev_opener: None,
            next_opener: PacketKey::from_secret(suite, &next_rx)?,
            phase_started_at: None,
            tx_secret: Zeroizing::new(tx_secret.to_vec()),
            rx_secret: Zeroizing::new(rx_secret.to_vec()),
        })
    }

    #[inline]
    pub fn key_phase(&self) -> bool {
        self.key_phase
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn sealer(&self) -> &PacketKey {
        &self.sealer
    }

    #[inline]
    pub fn sealer_hp(&self) -> &HeaderKey {
        &self.sealer_hp
    }

    #[inline]
    pub fn opener_hp(&self) -> &HeaderKey {
        &self.opener_hp
    }

    /// Rolls both directions forward one generation
    pub fn update(&mut self) -> Result<(), CryptoError> {
        let tx_secret = next_secret(self.suite, &self.tx_secret)?;
        let rx_secret = next_secret(self.suite, &self.rx_secret)?;
        let next_rx = next_secret(self.suite, &rx_secret)?;

        self.sealer = PacketKey::from_secret(self.suite, &tx_secret)?;
        self.prev_opener = Some(core::mem::replace(
            &mut self.opener,
            PacketKey::from_secret(self.suite, &rx_secret)?,
        ));
        self.next_opener = PacketKey::from_secret(self.suite, &next_rx)?;

        self.tx_secret = Zeroizing::new(tx_secret.to_vec());
        self.rx_secret = Zeroizing::new(rx_secret.to_vec());
        self.key_phase = !self.key_phase;
        self.generation += 1;
        self.phase_started_at = None;
        Ok(())
    }

    /// Opens a packet whose key-phase bit is `phase_bit`.
    ///
    /// A mismatched phase bit belongs to the previous generation when
    /// the packet number predates the current phase, otherwise it is
    /// attributed to the next generation (committing the update on
    /// success). Exactly one key is ever tried, since a failed AEAD
    /// open leaves the buffer scrambled.
    pub fn open_in_place<'a>(
        &mut self,
        phase_bit: bool,
        packet_number: PacketNumber,
        header: &[u8],
        in_out: &'a mut [u8],
    ) -> Result<(&'a mut [u8], KeyPhaseOutcome), CryptoError> {
        if phase_bit == self.key_phase {
            let cleartext = self.opener.open_in_place(packet_number, header, in_out)?;
            self.phase_started_at = Some(match self.phase_started_at {
                Some(start) => start.min(packet_number),
                None => packet_number,
            });
            return Ok((cleartext, KeyPhaseOutcome::Current));
        }

        if let (Some(start), Some(prev)) = (self.phase_started_at, self.prev_opener.as_ref()) {
            if packet_number < start {
                let cleartext = prev.open_in_place(packet_number, header, in_out)?;
                return Ok((cleartext, KeyPhaseOutcome::Previous));
            }
        }

        // the peer initiated a key update
        self.next_opener
            .open_in_place(packet_number, header, in_out)?;
        self.update()?;
        self.phase_started_at = Some(packet_number);
        let cleartext_len = in_out.len() - TAG_LEN;
        Ok((&mut in_out[..cleartext_len], KeyPhaseOutcome::Updated))
    }
}

fn next_secret(suite: CipherSuite, secret: &[u8]) -> Result<Secret, CryptoError> {
    let mut next = Zeroizing::new(vec![0u8; secret.len()]);
    hkdf_expand_label(suite, secret, label::KEY_UPDATE, &mut next)?;
    Ok(next)
}
