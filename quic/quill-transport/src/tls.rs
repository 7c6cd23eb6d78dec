// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The handshake boundary.
//!
//! The transport is handshake-agnostic: it feeds CRYPTO stream bytes
//! into a [`Session`] and receives flights to send, derived traffic
//! secrets per level, and the peer's transport parameters. A real
//! TLS 1.3 stack plugs in behind this trait; the [`testing`] session
//! performs a deterministic four-flight exchange with the same shape
//! so the full packet pipeline can be exercised hermetically.

use quill_core::{
    crypto::{CipherSuite, CryptoError},
    packet::number::PacketNumberSpace,
    transport::parameters::TransportParameters,
};
use zeroize::Zeroizing;

/// Encryption levels a handshake can emit data or keys at.
///
/// 0-RTT keys are delivered alongside `OneRtt`; the transport tracks
/// them in the application space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Initial,
    Handshake,
    OneRtt,
}

impl Level {
    pub const COUNT: usize = 3;

    #[inline]
    pub fn as_index(self) -> usize {
        match self {
            Self::Initial => 0,
            Self::Handshake => 1,
            Self::OneRtt => 2,
        }
    }

    #[inline]
    pub fn space(self) -> PacketNumberSpace {
        match self {
            Self::Initial => PacketNumberSpace::Initial,
            Self::Handshake => PacketNumberSpace::Handshake,
            Self::OneRtt => PacketNumberSpace::ApplicationData,
        }
    }

    #[inline]
    pub fn all() -> [Self; Self::COUNT] {
        [Self::Initial, Self::Handshake, Self::OneRtt]
    }
}

/// Traffic secrets for one level, both directions
pub struct NewKeys {
    pub level: Level,
    pub suite: CipherSuite,
    pub tx_secret: Zeroizing<Vec<u8>>,
    pub rx_secret: Zeroizing<Vec<u8>>,
}

impl core::fmt::Debug for NewKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("NewKeys")
            .field("level", &self.level)
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

/// Everything a processing step produced
#[derive(Debug)]
pub struct Output {
    /// Handshake bytes to transmit, per level, in order
    pub crypto: Vec<(Level, Vec<u8>)>,
    pub keys: Vec<NewKeys>,
    /// The peer's transport parameters, once authenticated
    pub peer_params: Option<TransportParameters>,
    /// The handshake finished from this endpoint's perspective
    pub handshake_complete: bool,
}

/// A handshake engine driven by the transport
pub trait Session: Send {
    /// Kicks off the handshake; a client emits its first flight
    fn start(&mut self) -> Result<Output, CryptoError>;

    /// Consumes reassembled CRYPTO bytes received at `level`
    fn process(&mut self, level: Level, data: &[u8]) -> Result<Output, CryptoError>;
}

/// Builds sessions for inbound connections
pub trait Provider: Send + Sync + 'static {
    fn new_session(
        &self,
        endpoint: quill_core::endpoint::Type,
        local_params: TransportParameters,
    ) -> Box<dyn Session>;
}

pub mod testing {
    //! A deterministic handshake with TLS 1.3's flight structure.
    //!
    //! ```text
    //! client                                server
    //!   CH(random, params) @Initial  ──▶
    //!                                 ◀──  SH(random) @Initial
    //!                                 ◀──  SF(params) @Handshake   [hs+app keys]
    //!   [hs+app keys]
    //!   CF() @Handshake              ──▶                           [complete]
    //!   [complete]
    //! ```
    //!
    //! Secrets are expanded from the concatenated hello randoms, so
    //! both sides agree without any actual key exchange. Useful only
    //! for tests; there is no authentication whatsoever.

    use super::*;
    use quill_core::crypto::label::hkdf_expand_label;
    use quill_core::endpoint;
    use s2n_codec::{DecoderBuffer, EncoderBuffer, EncoderValue, Encoder};

    const CLIENT_HELLO: u8 = 1;
    const SERVER_HELLO: u8 = 2;
    const SERVER_FINISHED: u8 = 3;
    const CLIENT_FINISHED: u8 = 4;

    const RANDOM_LEN: usize = 32;
    const SUITE: CipherSuite = CipherSuite::Aes128GcmSha256;

    /// Message layout: type(1) || len(u16) || body
    fn message(kind: u8, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + body.len());
        out.push(kind);
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn encode_params(params: &TransportParameters) -> Vec<u8> {
        let mut bytes = vec![0u8; 1024];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        params.encode(&mut encoder);
        let len = encoder.len();
        bytes.truncate(len);
        bytes
    }

    fn decode_params(bytes: &[u8]) -> Result<TransportParameters, CryptoError> {
        TransportParameters::decode(DecoderBuffer::new(bytes))
            .map_err(|_| CryptoError::UNSUPPORTED_EXTENSION.with_reason("malformed parameters"))
    }

    fn expand(master: &[u8], label: &[u8]) -> Zeroizing<Vec<u8>> {
        let mut secret = Zeroizing::new(vec![0u8; RANDOM_LEN]);
        hkdf_expand_label(SUITE, master, label, &mut secret)
            .expect("secret expansion cannot fail");
        secret
    }

    struct SecretSchedule {
        client_hs: Zeroizing<Vec<u8>>,
        server_hs: Zeroizing<Vec<u8>>,
        client_app: Zeroizing<Vec<u8>>,
        server_app: Zeroizing<Vec<u8>>,
    }

    impl SecretSchedule {
        fn new(client_random: &[u8], server_random: &[u8]) -> Self {
            let mut master = Zeroizing::new(Vec::with_capacity(RANDOM_LEN * 2));
            master.extend_from_slice(client_random);
            master.extend_from_slice(server_random);
            Self {
                client_hs: expand(&master, b"quill c hs"),
                server_hs: expand(&master, b"quill s hs"),
                client_app: expand(&master, b"quill c ap"),
                server_app: expand(&master, b"quill s ap"),
            }
        }

        fn keys(&self, level: Level, endpoint: endpoint::Type) -> NewKeys {
            let (tx, rx) = match (level, endpoint) {
                (Level::Handshake, endpoint::Type::Client) => (&self.client_hs, &self.server_hs),
                (Level::Handshake, endpoint::Type::Server) => (&self.server_hs, &self.client_hs),
                (_, endpoint::Type::Client) => (&self.client_app, &self.server_app),
                (_, endpoint::Type::Server) => (&self.server_app, &self.client_app),
            };
            NewKeys {
                level,
                suite: SUITE,
                tx_secret: tx.clone(),
                rx_secret: rx.clone(),
            }
        }
    }

    enum State {
        /// Client before start, server before the ClientHello
        Idle,
        /// Client sent CH and awaits SH + SF
        ClientAwaitingServer,
        /// Server sent its flights and awaits CF
        ServerAwaitingFinished,
        Complete,
    }

    pub struct TestSession {
        endpoint: endpoint::Type,
        state: State,
        random: [u8; RANDOM_LEN],
        local_params: TransportParameters,
        schedule: Option<SecretSchedule>,
        /// Partial message bytes per level
        buffers: [Vec<u8>; Level::COUNT],
    }

    impl TestSession {
        pub fn new(
            endpoint: endpoint::Type,
            seed: u64,
            local_params: TransportParameters,
        ) -> Self {
            // deterministic "random" derived from the seed
            let mut random = [0u8; RANDOM_LEN];
            for (i, byte) in random.iter_mut().enumerate() {
                *byte = (seed
                    .wrapping_mul(0x9e37_79b9_7f4a_7c15)
                    .wrapping_add(i as u64)
                    >> 16) as u8;
            }
            Self {
                endpoint,
                state: State::Idle,
                random,
                local_params,
                schedule: None,
                buffers: Default::default(),
            }
        }

        /// Splits complete `type || len || body` messages off the
        /// reassembled level buffer
        fn take_messages(&mut self, level: Level) -> Vec<(u8, Vec<u8>)> {
            let buffer = &mut self.buffers[level.as_index()];
            let mut messages = Vec::new();
            loop {
                if buffer.len() < 3 {
                    break;
                }
                let body_len = u16::from_be_bytes([buffer[1], buffer[2]]) as usize;
                if buffer.len() < 3 + body_len {
                    break;
                }
                let kind = buffer[0];
                let body = buffer[3..3 + body_len].to_vec();
                buffer.drain(..3 + body_len);
                messages.push((kind, body));
            }
            messages
        }

        fn handle_message(
            &mut self,
            level: Level,
            kind: u8,
            body: Vec<u8>,
            output: &mut Output,
        ) -> Result<(), CryptoError> {
            match (self.endpoint, kind, level) {
                (endpoint::Type::Server, CLIENT_HELLO, Level::Initial) => {
                    if body.len() < RANDOM_LEN {
                        return Err(CryptoError::DECODE_ERROR);
                    }
                    let (client_random, params) = body.split_at(RANDOM_LEN);
                    output.peer_params = Some(decode_params(params)?);

                    let schedule = SecretSchedule::new(client_random, &self.random);

                    // SH at Initial, then the finished flight under
                    // handshake keys
                    output
                        .crypto
                        .push((Level::Initial, message(SERVER_HELLO, &self.random)));
                    output.keys.push(schedule.keys(Level::Handshake, self.endpoint));
                    output.crypto.push((
                        Level::Handshake,
                        message(SERVER_FINISHED, &encode_params(&self.local_params)),
                    ));
                    output.keys.push(schedule.keys(Level::OneRtt, self.endpoint));

                    self.schedule = Some(schedule);
                    self.state = State::ServerAwaitingFinished;
                    Ok(())
                }
                (endpoint::Type::Client, SERVER_HELLO, Level::Initial) => {
                    if body.len() != RANDOM_LEN {
                        return Err(CryptoError::DECODE_ERROR);
                    }
                    let schedule = SecretSchedule::new(&self.random, &body);
                    output.keys.push(schedule.keys(Level::Handshake, self.endpoint));
                    self.schedule = Some(schedule);
                    Ok(())
                }
                (endpoint::Type::Client, SERVER_FINISHED, Level::Handshake) => {
                    output.peer_params = Some(decode_params(&body)?);

                    let schedule = self
                        .schedule
                        .as_ref()
                        .ok_or(CryptoError::UNEXPECTED_MESSAGE)?;
                    output.keys.push(schedule.keys(Level::OneRtt, self.endpoint));
                    output
                        .crypto
                        .push((Level::Handshake, message(CLIENT_FINISHED, &[])));
                    output.handshake_complete = true;

                    self.state = State::Complete;
                    Ok(())
                }
                (endpoint::Type::Server, CLIENT_FINISHED, Level::Handshake) => {
                    if !matches!(self.state, State::ServerAwaitingFinished) {
                        return Err(CryptoError::UNEXPECTED_MESSAGE);
                    }
                    output.handshake_complete = true;
                    self.state = State::Complete;
                    Ok(())
                }
                _ => Err(CryptoError::UNEXPECTED_MESSAGE),
            }
        }
    }

    impl Session for TestSession {
        fn start(&mut self) -> Result<Output, CryptoError> {
            let mut output = Output::default();
            if self.endpoint.is_client() {
                let mut body = Vec::new();
                body.extend_from_slice(&self.random);
                body.extend_from_slice(&encode_params(&self.local_params));
                output
                    .crypto
                    .push((Level::Initial, message(CLIENT_HELLO, &body)));
                self.state = State::ClientAwaitingServer;
            }
            Ok(output)
        }

        fn process(&mut self, level: Level, data: &[u8]) -> Result<Output, CryptoError> {
            self.buffers[level.as_index()].extend_from_slice(data);

            let mut output = Output::default();
            for (kind, body) in self.take_messages(level) {
                self.handle_message(level, kind, body, &mut output)?;
            }
            Ok(output)
        }
    }

    /// Builds [`TestSession`]s with a fixed seed
    pub struct TestProvider {
        pub seed: u64,
    }

    impl Provider for TestProvider {
        fn new_session(
            &self,
            endpoint: endpoint::Type,
            local_params: TransportParameters,
        ) -> Box<dyn Session> {
            Box::new(TestSession::new(endpoint, self.seed, local_params))
        }
    }

    #[cfg(test)]
    mod unit_tests {
        use super::*;

        #[test]
        fn four_flight_exchange() {
            let client_params = TransportParameters {
                initial_source_connection_id: Some(Default::default()),
                ..Default::default()
            };
            let server_params = client_params.clone();

            let mut client = TestSession::new(endpoint::Type::Client, 1, client_params);
            let mut server = TestSession::new(endpoint::Type::Server, 2, server_params);

            let flight0 = client.start().unwrap();
            assert_eq!(flight0.crypto.len(), 1);
            assert!(!flight0.handshake_complete);

            // deliver CH byte-by-byte to exercise reassembly
            let (level, ch) = &flight0.crypto[0];
            let mut flight1 = Output::default();
            for byte in ch {
                flight1 = server.process(*level, &[*byte]).unwrap();
            }
            assert_eq!(flight1.crypto.len(), 2);
            assert_eq!(flight1.keys.len(), 2);
            assert!(flight1.peer_params.is_some());
            assert!(!flight1.handshake_complete);

            let mut client_keys = Vec::new();
            let mut flight2 = Output::default();
            for (level, data) in &flight1.crypto {
                let mut out = client.process(*level, data).unwrap();
                let handshake_complete = out.handshake_complete;
                client_keys.extend(core::mem::take(&mut out.keys));
                if handshake_complete {
                    flight2 = out;
                }
            }
            assert!(flight2.handshake_complete);
            assert_eq!(client_keys.len(), 2);

            // both sides derived mirrored secrets
            let server_keys = flight1.keys;
            for (client_key, server_key) in client_keys.iter().zip(&server_keys) {
                assert_eq!(client_key.level, server_key.level);
                assert_eq!(client_key.tx_secret.as_slice(), server_key.rx_secret.as_slice());
                assert_eq!(client_key.rx_secret.as_slice(), server_key.tx_secret.as_slice());
            }

            let (level, cf) = &flight2.crypto[0];
            let done = server.process(*level, cf).unwrap();
            assert!(done.handshake_complete);
        }

        #[test]
        fn rejects_unexpected_messages() {
            let mut server = TestSession::new(
                endpoint::Type::Server,
                3,
                TransportParameters::default(),
            );
            let garbage = message(CLIENT_FINISHED, &[]);
            assert!(server.process(Level::Handshake, &garbage).is_err());
        }
    }
}

impl Default for Output {
    fn default() -> Self {
        Self {
            crypto: Vec::new(),
            keys: Vec::new(),
            peer_params: None,
            handshake_complete: false,
        }
    }
}
