// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A network path: the 4-tuple plus everything measured on it.
//!
//! Each path owns its RTT estimate, congestion controller, pacer, MTU
//! and validation state. Until a path is validated, a server may send
//! at most three times the bytes it received on it.

use crate::recovery::{CongestionController, Pacer, RttEstimator};
use quill_core::{endpoint, time::Timestamp};
use std::net::SocketAddr;

/// Maximum concurrently tracked paths per connection
pub const MAX_PATHS: usize = 4;

//= https://www.rfc-editor.org/rfc/rfc9000#section-8
//# an endpoint MUST limit the amount of data it sends to the
//# unvalidated address to three times the amount of data received from
//# that address.
const AMPLIFICATION_FACTOR: u64 = 3;

#[derive(Debug)]
pub struct Path {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub mtu: u16,

    validated: bool,
    bytes_received: u64,
    bytes_sent: u64,

    /// Outstanding PATH_CHALLENGE data and its abandon deadline
    challenge: Option<([u8; 8], Timestamp)>,
    /// Echo owed to the peer from a received PATH_CHALLENGE
    pub pending_response: Option<[u8; 8]>,

    pub rtt: RttEstimator,
    pub congestion: CongestionController,
    pub pacer: Pacer,
}

impl Path {
    pub fn new(local: SocketAddr, remote: SocketAddr, mtu: u16, role: endpoint::Type) -> Self {
        Self {
            local,
            remote,
            mtu,
            //= https://www.rfc-editor.org/rfc/rfc9000#section-8.1
            //# the client is not expected to validate the server's
            //# address before completing the handshake
            validated: role.is_client(),
            bytes_received: 0,
            bytes_sent: 0,
            challenge: None,
            pending_response: None,
            rtt: RttEstimator::default(),
            congestion: CongestionController::new(mtu),
            pacer: Pacer::new(mtu),
        }
    }

    #[inline]
    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Marks the path validated (token match, PATH_RESPONSE, or
    /// handshake completion)
    pub fn on_validated(&mut self) {
        self.validated = true;
        self.challenge = None;
    }

    #[inline]
    pub fn on_bytes_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }

    #[inline]
    pub fn on_bytes_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    /// Bytes that may still be sent under the anti-amplification limit
    #[inline]
    pub fn amplification_allowance(&self) -> u64 {
        if self.validated {
            u64::MAX
        } else {
            (self.bytes_received * AMPLIFICATION_FACTOR).saturating_sub(self.bytes_sent)
        }
    }

    #[inline]
    pub fn is_amplification_limited(&self) -> bool {
        self.amplification_allowance() == 0
    }

    /// Begins validation; the send engine will emit the challenge
    pub fn begin_challenge(&mut self, data: [u8; 8], abandon_at: Timestamp) {
        self.challenge = Some((data, abandon_at));
    }

    #[inline]
    pub fn challenge_data(&self) -> Option<[u8; 8]> {
        self.challenge.map(|(data, _)| data)
    }

    /// Processes a PATH_RESPONSE; returns true when it validates this
    /// path
    pub fn on_path_response(&mut self, data: &[u8; 8]) -> bool {
        match self.challenge {
            Some((expected, _)) if expected == *data => {
                self.on_validated();
                true
            }
            _ => false,
        }
    }

    /// Gives up on an expired challenge; returns true if one was
    /// abandoned
    pub fn abandon_expired_challenge(&mut self, now: Timestamp) -> bool {
        match self.challenge {
            Some((_, deadline)) if deadline <= now => {
                self.challenge = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(role: endpoint::Type) -> Path {
        Path::new(
            "127.0.0.1:4433".parse().unwrap(),
            "127.0.0.1:9000".parse().unwrap(),
            1280,
            role,
        )
    }

    #[test]
    fn server_amplification_window() {
        let mut path = path(endpoint::Type::Server);
        assert!(!path.is_validated());
        assert!(path.is_amplification_limited());

        path.on_bytes_received(1200);
        assert_eq!(path.amplification_allowance(), 3600);

        path.on_bytes_sent(3600);
        assert!(path.is_amplification_limited());

        path.on_validated();
        assert_eq!(path.amplification_allowance(), u64::MAX);
    }

    #[test]
    fn client_paths_start_validated() {
        let path = path(endpoint::Type::Client);
        assert!(path.is_validated());
        assert!(!path.is_amplification_limited());
    }

    #[test]
    fn challenge_response() {
        let mut path = path(endpoint::Type::Server);
        let deadline = Timestamp::from_micros(1_000);
        path.begin_challenge([7; 8], deadline);

        assert!(!path.on_path_response(&[8; 8]));
        assert!(!path.is_validated());

        assert!(path.on_path_response(&[7; 8]));
        assert!(path.is_validated());
        assert_eq!(path.challenge_data(), None);
    }

    #[test]
    fn challenge_expiry() {
        let mut path = path(endpoint::Type::Server);
        path.begin_challenge([7; 8], Timestamp::from_micros(1_000));
        assert!(!path.abandon_expired_challenge(Timestamp::from_micros(999)));
        assert!(path.abandon_expired_challenge(Timestamp::from_micros(1_000)));
        assert_eq!(path.challenge_data(), None);
    }
}
