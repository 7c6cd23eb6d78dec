// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A binding owns one UDP 4-tuple: it routes inbound datagrams to
//! connections by destination CID, answers unroutable Initials
//! (version negotiation, stateless retry, connection acceptance), and
//! emits rate-budgeted stateless resets for everything else.

use crate::{
    connection::Connection,
    datapath::{Datagram, Tx},
    library::Shared,
    lookup::{Lookup, Route},
    retry,
    worker::Operation,
};
use quill_core::{
    connection::ConnectionId,
    endpoint,
    event as core_event,
    packet::{self, long, ProtectedPacket},
    stateless_reset,
    time::Clock,
};
use ring::hmac;
use s2n_codec::{DecoderBufferMut, EncoderBuffer, Encoder};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
};

/// Smallest inbound datagram worth a stateless reset: anything shorter
/// cannot have been a valid short-header packet
const MIN_RESETTABLE_LEN: usize = 21;

struct ResetLimiter {
    window_start_ms: u64,
    sent_in_window: u32,
}

struct RetryBudgets {
    budgets: hashbrown::HashMap<SocketAddr, u8>,
}

/// Accept-side configuration; present on listening bindings
pub(crate) struct Acceptor {
    pub(crate) enabled: bool,
}

pub struct Binding {
    pub local: SocketAddr,
    /// Set for connected (client) bindings
    pub remote: Option<SocketAddr>,
    pub(crate) exclusive: bool,

    pub(crate) lookup: Arc<Lookup>,
    pub(crate) tx: Arc<dyn Tx>,
    pub(crate) shared: Weak<Shared>,

    reset_secret: [u8; 32],
    short_dcid_len: usize,
    acceptor: Option<Acceptor>,
    /// The single connection of a connected binding, for unreachable
    /// notifications
    primary: Mutex<Option<Route>>,
    reset_limiter: Mutex<ResetLimiter>,
    retry_budgets: Mutex<RetryBudgets>,
}

impl Binding {
    pub(crate) fn new(
        local: SocketAddr,
        remote: Option<SocketAddr>,
        exclusive: bool,
        is_listener: bool,
        tx: Arc<dyn Tx>,
        shared: &Arc<Shared>,
        reset_secret: [u8; 32],
    ) -> Arc<Self> {
        let lookup = Arc::new(Lookup::new(0xff, shared.lookup_hash_keys()));
        if is_listener {
            lookup.maximize_partitioning(shared.workers.len());
        }
        Arc::new(Self {
            local,
            remote,
            exclusive,
            lookup,
            tx,
            shared: Arc::downgrade(shared),
            reset_secret,
            short_dcid_len: shared.settings.local_cid_len,
            acceptor: is_listener.then_some(Acceptor { enabled: true }),
            primary: Mutex::new(None),
            reset_limiter: Mutex::new(ResetLimiter {
                window_start_ms: 0,
                sent_in_window: 0,
            }),
            retry_budgets: Mutex::new(RetryBudgets {
                budgets: hashbrown::HashMap::new(),
            }),
        })
    }

    /// True when `get_or_create` may hand this binding to another
    /// caller
    pub(crate) fn is_shareable(&self, local: SocketAddr, remote: Option<SocketAddr>) -> bool {
        !self.exclusive && self.local == local && self.remote == remote
    }

    /// Datapath entry point: routes each datagram to its connection
    pub fn receive(&self, datagrams: Vec<Datagram>) {
        for datagram in datagrams {
            self.receive_one(datagram);
        }
    }

    fn receive_one(&self, datagram: Datagram) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        let Some(dcid) = packet::route_dcid(&datagram.payload, self.short_dcid_len) else {
            return;
        };

        if let Some(route) = self.lookup.lookup(&dcid) {
            shared.workers[route.worker].post(route.handle, Operation::Route(datagram));
            return;
        }

        self.handle_unroutable(&shared, datagram);
    }

    /// Notifies the connection behind `remote` that its path errored
    pub fn unreachable(&self, remote: SocketAddr) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        // only connected bindings know which connection the address
        // belongs to without a packet in hand
        if self.remote != Some(remote) {
            return;
        }
        if let Some(route) = self.primary_route() {
            shared.workers[route.worker].post(
                route.handle,
                Operation::Shutdown {
                    error: quill_core::transport::Error::new(
                        quill_core::transport::Error::NO_ERROR,
                    )
                    .with_reason("peer address unreachable"),
                    is_application: false,
                    reason: Vec::new(),
                    silent: true,
                },
            );
        }
    }

    /// Connections currently routed through this binding; listeners
    /// use this to discover accepted connections
    pub fn connections(&self) -> Vec<Route> {
        self.lookup.routes()
    }

    pub(crate) fn set_primary_route(&self, route: Route) {
        *self.primary.lock().unwrap() = Some(route);
    }

    fn primary_route(&self) -> Option<Route> {
        *self.primary.lock().unwrap()
    }

    /// Derives the stateless reset token for a locally issued CID
    pub fn stateless_reset_token(&self, cid: &ConnectionId) -> stateless_reset::Token {
        let key = hmac::Key::new(hmac::HMAC_SHA256, &self.reset_secret);
        let tag = hmac::sign(&key, cid.as_bytes());
        let mut token = [0u8; stateless_reset::TOKEN_LEN];
        token.copy_from_slice(&tag.as_ref()[..stateless_reset::TOKEN_LEN]);
        stateless_reset::Token::new(token)
    }

    fn handle_unroutable(&self, shared: &Arc<Shared>, datagram: Datagram) {
        let mut payload = datagram.payload.clone();
        let buffer = DecoderBufferMut::new(&mut payload);

        let packet = match ProtectedPacket::decode(buffer, self.short_dcid_len) {
            Ok((packet, _)) => packet,
            Err(_) => {
                self.maybe_stateless_reset(shared, &datagram);
                return;
            }
        };

        let ProtectedPacket::Encrypted(packet) = packet else {
            // stray VN/Retry with no matching connection
            return;
        };

        match packet.packet_type {
            packet::PacketType::Initial
                if matches!(self.acceptor, Some(Acceptor { enabled: true })) =>
            {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.2
                //# A server MUST discard an Initial packet that is carried
                //# in a UDP datagram with a payload that is smaller than
                //# the smallest allowed maximum datagram size of 1200
                //# bytes.
                if datagram.payload.len() < 1200 {
                    return;
                }
                if !packet::is_version_supported(packet.version) {
                    self.send_version_negotiation(shared, &datagram, &packet);
                    return;
                }
                //= https://www.rfc-editor.org/rfc/rfc9000#section-7.2
                //# When an Initial packet is sent by a client ... it MUST
                //# choose a random value of at least 8 bytes
                if packet.dcid.len() < 8 {
                    return;
                }
                self.accept(shared, datagram, &packet);
            }
            packet::PacketType::Initial | packet::PacketType::ZeroRtt | packet::PacketType::Handshake => {
                // no connection and no acceptor: nothing to say
            }
            _ => self.maybe_stateless_reset(shared, &datagram),
        }
    }

    fn send_version_negotiation(
        &self,
        shared: &Arc<Shared>,
        datagram: &Datagram,
        packet: &quill_core::packet::Encrypted<'_>,
    ) {
        let Some(scid) = packet.scid else {
            return;
        };
        let mut payload = vec![0u8; 64];
        let mut encoder = EncoderBuffer::new(&mut payload);
        long::encode_version_negotiation(&mut encoder, &scid, &packet.dcid, shared.unpredictable_bits());
        let len = encoder.len();
        payload.truncate(len);

        shared.emit_endpoint(core_event::Event::VersionNegotiationSent(
            core_event::VersionNegotiationSent {
                rejected_version: packet.version,
            },
        ));
        self.tx.send(vec![Datagram {
            local: datagram.local,
            remote: datagram.remote,
            ecn: Default::default(),
            payload,
        }]);
    }

    /// Creates (or retries) a connection for a client Initial
    fn accept(
        &self,
        shared: &Arc<Shared>,
        datagram: Datagram,
        packet: &quill_core::packet::Encrypted<'_>,
    ) {
        let now = shared.clock.now();
        let Some(peer_scid) = packet.scid else {
            return;
        };
        let odcid = packet.dcid;
        let token = packet.token();

        // stateless retry before any state is committed
        let (original_dcid, retry_scid) = if shared.settings.retry_enabled {
            if token.is_empty() {
                self.send_retry(shared, &datagram, &odcid, &peer_scid, now);
                return;
            }
            let Some(key) = shared.retry_key() else {
                return;
            };
            match retry::validate(
                &key,
                token,
                now,
                &datagram.remote,
                shared.settings.retry_token_lifetime,
            ) {
                Some(original) => (original, Some(odcid)),
                None => {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-8.1.3
                    //# a server that wishes to communicate a fatal error ...
                    //# can immediately close the connection with an
                    //# INVALID_TOKEN error; otherwise drop and let the
                    //# client retry
                    self.send_retry(shared, &datagram, &odcid, &peer_scid, now);
                    return;
                }
            }
        } else {
            (odcid, None)
        };

        let worker_index = shared.pick_worker();
        let local_cid = shared.generate_cid(worker_index);
        let handle = shared.alloc_handle();
        let route = Route {
            worker: worker_index,
            handle,
        };

        // both the client-chosen DCID and our fresh CID must route
        // here until the client adopts the new one
        if self.lookup.insert(odcid, route).is_err() {
            // lost a race with a duplicate Initial; the winner serves it
            return;
        }
        let _ = self.lookup.insert(local_cid, route);

        let mut params = crate::connection::local_parameters(&shared.settings, local_cid);
        params.original_destination_connection_id = Some(original_dcid);
        params.retry_source_connection_id = retry_scid;
        let session = shared.tls.new_session(endpoint::Type::Server, params);

        let connection = Connection::server(
            handle,
            shared.settings.clone(),
            shared.subscriber.clone(),
            shared.rng(),
            session,
            local_cid,
            peer_scid,
            original_dcid,
            retry_scid,
            datagram.local,
            datagram.remote,
            now,
        );

        match connection {
            Ok(mut connection) => {
                // a spare source CID for rotation, advertised once the
                // handshake completes
                let spare = shared.generate_cid(worker_index);
                connection
                    .cids
                    .issue_local(spare, self.stateless_reset_token(&spare));
                let _ = self.lookup.insert(spare, route);

                shared.workers[worker_index].register(
                    handle,
                    Box::new(connection),
                    self.tx.clone(),
                    self.lookup.clone(),
                );
                shared.workers[worker_index].post(handle, Operation::Route(datagram));
            }
            Err(_) => {
                self.lookup.remove(&odcid);
                self.lookup.remove(&local_cid);
            }
        }
    }

    fn send_retry(
        &self,
        shared: &Arc<Shared>,
        datagram: &Datagram,
        odcid: &ConnectionId,
        peer_scid: &ConnectionId,
        now: quill_core::time::Timestamp,
    ) {
        // budget retries per 4-tuple so a spoofed source cannot keep
        // us chattering
        {
            let mut budgets = self.retry_budgets.lock().unwrap();
            if budgets.budgets.len() > 4096 {
                budgets.budgets.clear();
            }
            let used = budgets.budgets.entry(datagram.remote).or_insert(0);
            if *used >= shared.settings.retry_budget {
                return;
            }
            *used += 1;
        }

        let Some(key) = shared.retry_key() else {
            return;
        };
        let token = retry::mint(&key, now, &datagram.remote, odcid);
        let new_scid = shared.generate_cid(shared.pick_worker());

        let mut payload = vec![0u8; 256];
        let mut encoder = EncoderBuffer::new(&mut payload);
        long::encode_retry(
            &mut encoder,
            packet::VERSION_V1,
            peer_scid,
            &new_scid,
            odcid,
            &token,
        );
        let len = encoder.len();
        payload.truncate(len);

        shared.emit_endpoint(core_event::Event::RetrySent(core_event::RetrySent {
            token_len: token.len(),
        }));
        self.tx.send(vec![Datagram {
            local: datagram.local,
            remote: datagram.remote,
            ecn: Default::default(),
            payload,
        }]);
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
    //# An endpoint that receives packets that it cannot process sends a
    //# packet in the following layout
    fn maybe_stateless_reset(&self, shared: &Arc<Shared>, datagram: &Datagram) {
        // the reset must be both plausibly a short-header packet and
        // strictly smaller than what was received
        if datagram.payload.len() <= MIN_RESETTABLE_LEN {
            return;
        }
        // short-header shape only
        if datagram.payload[0] & packet::FORM_BIT != 0 {
            return;
        }

        // rate budget
        {
            let now_ms = shared.clock.now().as_millis();
            let mut limiter = self.reset_limiter.lock().unwrap();
            if now_ms.saturating_sub(limiter.window_start_ms) >= 1_000 {
                limiter.window_start_ms = now_ms;
                limiter.sent_in_window = 0;
            }
            if limiter.sent_in_window >= shared.settings.stateless_reset_rate_limit {
                return;
            }
            limiter.sent_in_window += 1;
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3.3
        //# An endpoint MUST NOT send a Stateless Reset that is three times
        //# or more larger than the packet it receives
        let reset_len = (datagram.payload.len() - 1).min(100);

        let mut payload = vec![0u8; reset_len];
        shared.fill_random(&mut payload);
        payload[0] = 0b0100_0000 | (payload[0] & 0b0011_1111);

        let dcid = ConnectionId::try_from_slice(
            &datagram.payload[1..1 + self.short_dcid_len.min(datagram.payload.len() - 1)],
        )
        .unwrap_or(ConnectionId::EMPTY);
        let token = self.stateless_reset_token(&dcid);
        let token_start = reset_len - stateless_reset::TOKEN_LEN;
        payload[token_start..].copy_from_slice(token.as_ref());

        shared.emit_endpoint(core_event::Event::StatelessResetSent(
            core_event::StatelessResetSent { bytes: reset_len },
        ));
        self.tx.send(vec![Datagram {
            local: datagram.local,
            remote: datagram.remote,
            ecn: Default::default(),
            payload,
        }]);
    }
}
