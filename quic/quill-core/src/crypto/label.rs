// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! HKDF-Expand-Label as used by TLS 1.3 and QUIC (RFC 8446 §7.1)

use crate::crypto::{CipherSuite, CryptoError};
use ring::hkdf;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.1
//# The keys used for packet protection are computed from the TLS secrets
//# using the KDF provided by TLS.

pub const KEY: &[u8] = b"quic key";
pub const IV: &[u8] = b"quic iv";
pub const HP: &[u8] = b"quic hp";
pub const KEY_UPDATE: &[u8] = b"quic ku";
pub const CLIENT_IN: &[u8] = b"client in";
pub const SERVER_IN: &[u8] = b"server in";

const TLS13_PREFIX: &[u8] = b"tls13 ";
const MAX_LABEL_LEN: usize = 255 - TLS13_PREFIX.len();

struct OutputLen(usize);

impl hkdf::KeyType for OutputLen {
    fn len(&self) -> usize {
        self.0
    }
}

#[inline]
pub(crate) fn hkdf_algorithm(suite: CipherSuite) -> hkdf::Algorithm {
    match suite {
        CipherSuite::Aes128GcmSha256 | CipherSuite::ChaCha20Poly1305Sha256 => hkdf::HKDF_SHA256,
        CipherSuite::Aes256GcmSha384 => hkdf::HKDF_SHA384,
    }
}

/// The digest length of the suite's hash, the size of its secrets
#[inline]
pub fn secret_len(suite: CipherSuite) -> usize {
    match suite {
        CipherSuite::Aes128GcmSha256 | CipherSuite::ChaCha20Poly1305Sha256 => 32,
        CipherSuite::Aes256GcmSha384 => 48,
    }
}

/// `HKDF-Expand-Label(secret, label, "", out.len())`
///
/// The label is given without the `"tls13 "` prefix; QUIC uses an empty
/// context for every derivation.
pub fn hkdf_expand_label(
    suite: CipherSuite,
    secret: &[u8],
    label: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    let prk = hkdf::Prk::new_less_safe(hkdf_algorithm(suite), secret);
    expand_from_prk(&prk, label, out)
}

/// `HKDF-Expand-Label` from an already-extracted PRK
pub(crate) fn expand_from_prk(
    prk: &hkdf::Prk,
    label: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    debug_assert!(label.len() <= MAX_LABEL_LEN);

    //= https://www.rfc-editor.org/rfc/rfc8446#section-7.1
    //# struct {
    //#     uint16 length = Length;
    //#     opaque label<7..255> = "tls13 " + Label;
    //#     opaque context<0..255> = Context;
    //# } HkdfLabel;
    let out_len = (out.len() as u16).to_be_bytes();
    let label_len = [(TLS13_PREFIX.len() + label.len()) as u8];
    let context_len = [0u8];

    let info = [
        &out_len[..],
        &label_len[..],
        TLS13_PREFIX,
        label,
        &context_len[..],
    ];

    prk.expand(&info, OutputLen(out.len()))
        .and_then(|okm| okm.fill(out))
        .map_err(|_| CryptoError::INTERNAL_ERROR)
}
