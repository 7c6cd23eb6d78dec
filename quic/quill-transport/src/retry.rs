// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stateless retry tokens.
//!
//! A token binds the client address, the original destination CID and
//! an issue time under an HMAC, so the server commits no state until
//! the client proves it owns its address. Tokens expire after the
//! configured lifetime.

use core::time::Duration;
use quill_core::{connection::ConnectionId, time::Timestamp};
use ring::hmac;
use std::net::SocketAddr;

const TAG_LEN: usize = 32;

/// Process-wide key used to sign retry tokens; set once at startup
#[derive(Clone)]
pub struct RetryKey {
    key: hmac::Key,
}

impl RetryKey {
    pub fn new(secret: &[u8; 32]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }
}

fn address_bytes(addr: &SocketAddr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(18);
    match addr.ip() {
        std::net::IpAddr::V4(ip) => bytes.extend_from_slice(&ip.octets()),
        std::net::IpAddr::V6(ip) => bytes.extend_from_slice(&ip.octets()),
    }
    bytes.extend_from_slice(&addr.port().to_be_bytes());
    bytes
}

fn signed_content(issued: Timestamp, remote: &SocketAddr, odcid: &ConnectionId) -> Vec<u8> {
    let mut content = Vec::with_capacity(9 + 21 + 18);
    content.extend_from_slice(&issued.as_micros().to_be_bytes());
    content.push(odcid.len() as u8);
    content.extend_from_slice(odcid.as_bytes());
    content.extend_from_slice(&address_bytes(remote));
    content
}

/// Token layout: issued(8) || odcid_len(1) || odcid || tag(32)
pub fn mint(key: &RetryKey, now: Timestamp, remote: &SocketAddr, odcid: &ConnectionId) -> Vec<u8> {
    let mut token = Vec::with_capacity(9 + odcid.len() + TAG_LEN);
    token.extend_from_slice(&now.as_micros().to_be_bytes());
    token.push(odcid.len() as u8);
    token.extend_from_slice(odcid.as_bytes());

    let tag = hmac::sign(&key.key, &signed_content(now, remote, odcid));
    token.extend_from_slice(tag.as_ref());
    token
}

/// Validates a token from a follow-up Initial; returns the original
/// destination CID the first Initial carried
pub fn validate(
    key: &RetryKey,
    token: &[u8],
    now: Timestamp,
    remote: &SocketAddr,
    lifetime: Duration,
) -> Option<ConnectionId> {
    if token.len() < 9 + TAG_LEN {
        return None;
    }
    let issued = Timestamp::from_micros(u64::from_be_bytes(token[..8].try_into().ok()?));
    let odcid_len = token[8] as usize;
    if odcid_len > quill_core::connection::id::MAX_LEN
        || token.len() != 9 + odcid_len + TAG_LEN
    {
        return None;
    }
    let odcid = ConnectionId::try_from_slice(&token[9..9 + odcid_len]).ok()?;
    let tag = &token[9 + odcid_len..];

    if now.saturating_duration_since(issued) > lifetime || issued > now {
        return None;
    }

    hmac::verify(&key.key, &signed_content(issued, remote, &odcid), tag).ok()?;
    Some(odcid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn odcid() -> ConnectionId {
        ConnectionId::try_from_slice(&[0x83, 0x94, 0xc8, 0xf0]).unwrap()
    }

    fn remote() -> SocketAddr {
        "192.0.2.7:4433".parse().unwrap()
    }

    #[test]
    fn mint_validate_round_trip() {
        let key = RetryKey::new(&[7; 32]);
        let now = Timestamp::from_micros(1_000_000);

        let token = mint(&key, now, &remote(), &odcid());
        let validated = validate(
            &key,
            &token,
            now + Duration::from_secs(1),
            &remote(),
            Duration::from_secs(30),
        );
        assert_eq!(validated, Some(odcid()));
    }

    #[test]
    fn rejects_tampering_and_expiry() {
        let key = RetryKey::new(&[7; 32]);
        let now = Timestamp::from_micros(1_000_000);
        let token = mint(&key, now, &remote(), &odcid());

        // expired
        assert_eq!(
            validate(
                &key,
                &token,
                now + Duration::from_secs(31),
                &remote(),
                Duration::from_secs(30),
            ),
            None
        );

        // wrong address
        let other: SocketAddr = "192.0.2.8:4433".parse().unwrap();
        assert_eq!(
            validate(&key, &token, now, &other, Duration::from_secs(30)),
            None
        );

        // flipped byte
        let mut corrupt = token.clone();
        *corrupt.last_mut().unwrap() ^= 1;
        assert_eq!(
            validate(&key, &corrupt, now, &remote(), Duration::from_secs(30)),
            None
        );

        // wrong key
        let other_key = RetryKey::new(&[8; 32]);
        assert_eq!(
            validate(&other_key, &token, now, &remote(), Duration::from_secs(30)),
            None
        );

        // truncated
        assert_eq!(
            validate(&key, &token[..token.len() - 1], now, &remote(), Duration::from_secs(30)),
            None
        );
    }
}
