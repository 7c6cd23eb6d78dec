// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::crypto::{
    label::{self, hkdf_expand_label},
    CipherSuite, CryptoError, KeySet,
};
use hex_literal::hex;
use ring::hkdf;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.2
//# initial_salt = 0x38762cf7f55934b34d179ae6a4c80cadccbb7f0a
//# initial_secret = HKDF-Extract(initial_salt,
//#                               client_dst_connection_id)
pub const INITIAL_SALT_V1: [u8; 20] = hex!("38762cf7f55934b34d179ae6a4c80cadccbb7f0a");

/// Initial packets are always protected with AES-128-GCM-SHA256
pub const INITIAL_SUITE: CipherSuite = CipherSuite::Aes128GcmSha256;

const SECRET_LEN: usize = 32;

/// The client and server initial secrets for a client-chosen DCID
pub struct InitialSecrets {
    pub client: [u8; SECRET_LEN],
    pub server: [u8; SECRET_LEN],
}

impl InitialSecrets {
    pub fn new(salt: &[u8; 20], client_dcid: &[u8]) -> Result<Self, CryptoError> {
        let initial_secret = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(client_dcid);

        let mut client = [0u8; SECRET_LEN];
        label::expand_from_prk(&initial_secret, label::CLIENT_IN, &mut client)?;

        let mut server = [0u8; SECRET_LEN];
        label::expand_from_prk(&initial_secret, label::SERVER_IN, &mut server)?;

        Ok(Self { client, server })
    }
}

/// Derives the Initial-level key set for one endpoint.
///
/// The client seals with the client secret and opens with the server
/// secret; the server is the mirror image.
pub fn initial_keys(
    salt: &[u8; 20],
    client_dcid: &[u8],
    endpoint: crate::endpoint::Type,
) -> Result<KeySet, CryptoError> {
    let secrets = InitialSecrets::new(salt, client_dcid)?;
    match endpoint {
        crate::endpoint::Type::Client => {
            KeySet::from_secrets(INITIAL_SUITE, &secrets.client, &secrets.server)
        }
        crate::endpoint::Type::Server => {
            KeySet::from_secrets(INITIAL_SUITE, &secrets.server, &secrets.client)
        }
    }
}

/// Re-derives after a Retry: same salt, the server-chosen DCID
pub fn retry_initial_keys(
    salt: &[u8; 20],
    new_dcid: &[u8],
    endpoint: crate::endpoint::Type,
) -> Result<KeySet, CryptoError> {
    initial_keys(salt, new_dcid, endpoint)
}
