// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection protocol state machine.
//!
//! All of a connection's state is mutated from a single worker thread;
//! no locking happens here. The receive engine (`recv`) and send
//! engine (`send`) extend this type with the packet pipeline.

pub mod cid;
pub mod event;

pub use event::Event;

use crate::{
    config::Settings,
    path::{Path, MAX_PATHS},
    recovery::DRAIN_PTO_MULTIPLIER,
    send::SendState,
    space::{PacketSpace, SentFrame, SentPacketInfo},
    stream::{set::OpenStatus, ApiError, StreamSet},
    tls::{self, Level},
    worker::ConnectionHandle,
};
use quill_core::{
    connection::ConnectionId,
    crypto::{initial, KeySet, OneRttKeySet},
    endpoint,
    event as core_event,
    stream::{StreamId, StreamType},
    time::Timestamp,
    transport::{parameters::TransportParameters, Error},
    varint::VarInt,
};
use ring::rand::{SecureRandom, SystemRandom};
use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};

/// Connection lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Created but not started
    Allocated,
    /// `start` ran; the first flight may be in flight
    HandshakeStarted,
    /// A valid packet arrived from the peer
    HandshakeInProgress,
    /// The TLS handshake completed locally
    HandshakeConfirmed,
    /// Both sides confirmed; steady state
    Connected,
    ClosingLocally,
    ClosingRemotely,
    Closed,
}

impl State {
    #[inline]
    pub fn is_closing(self) -> bool {
        matches!(self, Self::ClosingLocally | Self::ClosingRemotely)
    }

    #[inline]
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

/// The per-connection timers multiplexed through the timer wheel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    AckDelay,
    LossDetection,
    Pacing,
    Idle,
    KeepAlive,
    Shutdown,
}

impl TimerKind {
    pub const COUNT: usize = 6;

    #[inline]
    fn as_index(self) -> usize {
        match self {
            Self::AckDelay => 0,
            Self::LossDetection => 1,
            Self::Pacing => 2,
            Self::Idle => 3,
            Self::KeepAlive => 4,
            Self::Shutdown => 5,
        }
    }

    #[inline]
    pub fn all() -> [Self; Self::COUNT] {
        [
            Self::AckDelay,
            Self::LossDetection,
            Self::Pacing,
            Self::Idle,
            Self::KeepAlive,
            Self::Shutdown,
        ]
    }
}

#[derive(Clone, Debug)]
pub struct CloseState {
    pub error_code: VarInt,
    pub frame_type: Option<VarInt>,
    pub reason: Vec<u8>,
    pub is_application: bool,
    /// Closed by the peer; we only drain
    pub is_remote: bool,
    /// No CONNECTION_CLOSE is transmitted
    pub silent: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Counters {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub suspected_lost_packets: u64,
    pub spurious_lost_packets: u64,
    pub decryption_failures: u64,
    pub duplicate_packets: u64,
}

/// Connection-level flow control in both directions
#[derive(Debug)]
pub struct FlowController {
    /// Peer's MAX_DATA: total stream bytes we may send
    pub tx_max: u64,
    /// Total stream bytes we sent
    pub tx_sent: u64,
    /// DATA_BLOCKED should be emitted at this limit
    pub tx_blocked_at: Option<u64>,

    /// Our announced MAX_DATA
    pub rx_max: u64,
    /// Highest-offset sum received across streams
    pub rx_received: u64,
    /// Bytes the application consumed
    pub rx_delivered: u64,
    window: u64,
    pub pending_max_data: bool,
}

impl FlowController {
    fn new(window: u64) -> Self {
        Self {
            tx_max: 0,
            tx_sent: 0,
            tx_blocked_at: None,
            rx_max: window,
            rx_received: 0,
            rx_delivered: 0,
            window,
            pending_max_data: false,
        }
    }

    /// Bytes still sendable under the peer's connection limit
    #[inline]
    pub fn tx_available(&self) -> u64 {
        self.tx_max.saturating_sub(self.tx_sent)
    }

    pub fn on_peer_max_data(&mut self, maximum: u64) {
        if maximum > self.tx_max {
            self.tx_max = maximum;
            self.tx_blocked_at = None;
        }
    }

    /// Accounts received stream growth against our announced limit
    pub fn on_rx_growth(&mut self, growth: u64) -> Result<(), Error> {
        self.rx_received += growth;
        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A receiver MUST close the connection with an error of type
        //# FLOW_CONTROL_ERROR if the sender violates the advertised
        //# connection or stream data limits
        if self.rx_received > self.rx_max {
            return Err(Error::new(Error::FLOW_CONTROL_ERROR)
                .with_reason("connection flow control exceeded"));
        }
        Ok(())
    }

    /// Raise MAX_DATA once half the window is delivered
    pub fn on_delivered(&mut self, bytes: u64) {
        self.rx_delivered += bytes;
        if self.rx_delivered + self.window >= self.rx_max + self.window / 2 {
            self.pending_max_data = true;
        }
    }

    pub fn next_max_data(&self) -> u64 {
        self.rx_delivered + self.window
    }

    pub fn on_max_data_sent(&mut self, limit: u64) {
        self.rx_max = self.rx_max.max(limit);
        self.pending_max_data = false;
    }
}

pub struct Connection {
    pub(crate) handle: ConnectionHandle,
    pub(crate) role: endpoint::Type,
    pub(crate) state: State,
    pub(crate) settings: Arc<Settings>,
    pub(crate) subscriber: Arc<dyn core_event::Subscriber>,
    pub(crate) rng: SystemRandom,

    pub(crate) tls: Box<dyn tls::Session>,
    pub(crate) spaces: [PacketSpace; Level::COUNT],
    pub(crate) initial_keys: Option<KeySet>,
    pub(crate) handshake_keys: Option<KeySet>,
    pub(crate) one_rtt_keys: Option<OneRttKeySet>,

    pub(crate) cids: cid::CidController,
    pub(crate) paths: Vec<Path>,
    pub(crate) active_path: usize,
    pub(crate) streams: StreamSet,
    pub(crate) send: SendState,
    pub(crate) flow: FlowController,

    pub(crate) timers: [Option<Timestamp>; TimerKind::COUNT],
    pub(crate) close: Option<CloseState>,
    pub(crate) local_params: TransportParameters,
    pub(crate) peer_params: Option<TransportParameters>,

    pub(crate) pto_count: u32,
    pub(crate) counters: Counters,
    pub(crate) app_events: VecDeque<Event>,

    /// Datagrams held until their keys exist (bounded)
    pub(crate) pending_undecryptable: Vec<Vec<u8>>,

    pub(crate) original_dcid: ConnectionId,
    /// Token to include in client Initials after a Retry / NEW_TOKEN
    pub(crate) retry_token: Vec<u8>,
    /// The SCID a Retry packet carried; echoed back for validation
    pub(crate) retry_scid: Option<ConnectionId>,

    pub(crate) handshake_complete: bool,
    pub(crate) handshake_done_acked: bool,
    pub(crate) last_activity: Timestamp,
    pub(crate) idle_timeout: Duration,

    /// The server's chosen SCID has been adopted as our DCID
    pub(crate) peer_cid_bound: bool,
    /// Source CIDs retired by the peer, drained by the worker so the
    /// lookup entries disappear
    pub(crate) retired_local_cids: Vec<ConnectionId>,
}

pub(crate) const MAX_PENDING_UNDECRYPTABLE: usize = 4;

impl Connection {
    #[allow(clippy::too_many_arguments)]
    fn new(
        handle: ConnectionHandle,
        role: endpoint::Type,
        settings: Arc<Settings>,
        subscriber: Arc<dyn core_event::Subscriber>,
        rng: SystemRandom,
        tls: Box<dyn tls::Session>,
        local_cid: ConnectionId,
        peer_cid: ConnectionId,
        original_dcid: ConnectionId,
        initial_keys_dcid: ConnectionId,
        local_params: TransportParameters,
        local: SocketAddr,
        remote: SocketAddr,
        now: Timestamp,
    ) -> Result<Self, Error> {
        let initial_keys = initial::initial_keys(
            &initial::INITIAL_SALT_V1,
            initial_keys_dcid.as_bytes(),
            role,
        )?;

        let streams = StreamSet::new(
            role,
            settings.initial_max_streams_bidi.as_u64(),
            settings.initial_max_streams_uni.as_u64(),
            settings.initial_max_stream_data_bidi.as_u64(),
            settings.initial_max_stream_data_uni.as_u64(),
        );

        let mut paths = Vec::with_capacity(MAX_PATHS);
        paths.push(Path::new(local, remote, settings.base_mtu, role));

        let flow = FlowController::new(settings.initial_max_data.as_u64());
        let idle_timeout = settings.max_idle_timeout;

        let mut connection = Self {
            handle,
            role,
            state: State::Allocated,
            settings: settings.clone(),
            subscriber,
            rng,
            tls,
            spaces: [
                PacketSpace::new(Level::Initial),
                PacketSpace::new(Level::Handshake),
                PacketSpace::new(Level::OneRtt),
            ],
            initial_keys: Some(initial_keys),
            handshake_keys: None,
            one_rtt_keys: None,
            cids: cid::CidController::new(
                local_cid,
                peer_cid,
                settings.active_connection_id_limit.as_u64(),
            ),
            paths,
            active_path: 0,
            streams,
            send: SendState::default(),
            flow,
            timers: [None; TimerKind::COUNT],
            close: None,
            local_params,
            peer_params: None,
            pto_count: 0,
            counters: Counters::default(),
            app_events: VecDeque::new(),
            pending_undecryptable: Vec::new(),
            original_dcid,
            retry_token: Vec::new(),
            retry_scid: None,
            handshake_complete: false,
            handshake_done_acked: false,
            last_activity: now,
            idle_timeout,
            peer_cid_bound: role.is_server(),
            retired_local_cids: Vec::new(),
        };
        connection.emit(
            now,
            core_event::Event::ConnectionStarted(core_event::ConnectionStarted {
                is_server: role.is_server(),
            }),
        );
        Ok(connection)
    }

    /// Creates and starts a client connection; the first flight is
    /// queued and will leave on the next flush
    #[allow(clippy::too_many_arguments)]
    pub fn client(
        handle: ConnectionHandle,
        settings: Arc<Settings>,
        subscriber: Arc<dyn core_event::Subscriber>,
        rng: SystemRandom,
        tls: Box<dyn tls::Session>,
        local_cid: ConnectionId,
        peer_cid: ConnectionId,
        local: SocketAddr,
        remote: SocketAddr,
        now: Timestamp,
    ) -> Result<Self, Error> {
        let params = local_parameters(&settings, local_cid);

        let mut connection = Self::new(
            handle,
            endpoint::Type::Client,
            settings,
            subscriber,
            rng,
            tls,
            local_cid,
            peer_cid,
            // the client derives initial keys from its chosen DCID
            peer_cid,
            peer_cid,
            params,
            local,
            remote,
            now,
        )?;

        connection.state = State::HandshakeStarted;
        let output = connection.tls.start().map_err(Error::from)?;
        connection.on_tls_output(output, now)?;
        connection.arm_idle_timer(now);
        connection.send.request_flush();
        Ok(connection)
    }

    /// Creates a server connection in response to a client Initial
    #[allow(clippy::too_many_arguments)]
    pub fn server(
        handle: ConnectionHandle,
        settings: Arc<Settings>,
        subscriber: Arc<dyn core_event::Subscriber>,
        rng: SystemRandom,
        tls: Box<dyn tls::Session>,
        local_cid: ConnectionId,
        peer_cid: ConnectionId,
        original_dcid: ConnectionId,
        retry_scid: Option<ConnectionId>,
        local: SocketAddr,
        remote: SocketAddr,
        now: Timestamp,
    ) -> Result<Self, Error> {
        let mut params = local_parameters(&settings, local_cid);
        params.original_destination_connection_id = Some(original_dcid);
        params.retry_source_connection_id = retry_scid;

        let mut connection = Self::new(
            handle,
            endpoint::Type::Server,
            settings,
            subscriber,
            rng,
            tls,
            local_cid,
            peer_cid,
            original_dcid,
            // after a retry the client derives initial keys from the
            // CID the Retry packet carried
            retry_scid.unwrap_or(original_dcid),
            params,
            local,
            remote,
            now,
        )?;
        connection.retry_scid = retry_scid;
        connection.state = State::HandshakeStarted;
        let output = connection.tls.start().map_err(Error::from)?;
        connection.on_tls_output(output, now)?;
        connection.arm_idle_timer(now);
        Ok(connection)
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn role(&self) -> endpoint::Type {
        self.role
    }

    #[inline]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    #[inline]
    pub(crate) fn active_path(&self) -> &Path {
        &self.paths[self.active_path]
    }

    #[inline]
    pub(crate) fn active_path_mut(&mut self) -> &mut Path {
        &mut self.paths[self.active_path]
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-8.2.1
    //# The endpoint MUST use unpredictable data in every PATH_CHALLENGE
    //# frame so that it can associate the peer's response with the
    //# corresponding PATH_CHALLENGE.
    pub(crate) fn random_challenge_data(&self) -> [u8; 8] {
        let mut data = [0u8; 8];
        let _ = self.rng.fill(&mut data);
        data
    }

    pub(crate) fn emit(&self, now: Timestamp, event: core_event::Event) {
        let meta = core_event::Meta {
            connection: self.handle.as_raw(),
            timestamp: now,
        };
        self.subscriber.on_event(&meta, &event);
    }

    // === TLS plumbing ===

    /// Applies a TLS output: queues CRYPTO bytes, installs keys,
    /// absorbs peer transport parameters, advances the state machine.
    pub(crate) fn on_tls_output(&mut self, output: tls::Output, now: Timestamp) -> Result<(), Error> {
        for (level, data) in &output.crypto {
            self.spaces[level.as_index()].crypto_tx.push(data);
            self.send.request_flush();
        }

        for keys in output.keys {
            match keys.level {
                Level::Initial => {}
                Level::Handshake => {
                    self.handshake_keys = Some(KeySet::from_secrets(
                        keys.suite,
                        &keys.tx_secret,
                        &keys.rx_secret,
                    )?);
                }
                Level::OneRtt => {
                    self.one_rtt_keys = Some(OneRttKeySet::from_secrets(
                        keys.suite,
                        &keys.tx_secret,
                        &keys.rx_secret,
                    )?);
                }
            }
        }

        if let Some(params) = output.peer_params {
            self.on_peer_parameters(params, now)?;
        }

        if output.handshake_complete && !self.handshake_complete {
            self.on_handshake_complete(now)?;
        }
        Ok(())
    }

    fn on_peer_parameters(&mut self, params: TransportParameters, now: Timestamp) -> Result<(), Error> {
        params.validate_required(self.role.is_client())?;

        if self.role.is_client() {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-7.3
            //# An endpoint MUST treat the following as a connection error
            //# of type TRANSPORT_PARAMETER_ERROR or PROTOCOL_VIOLATION:
            //# *  absence of the retry_source_connection_id transport
            //#    parameter when no Retry packet was received
            match (&self.retry_scid, &params.retry_source_connection_id) {
                (Some(sent), Some(received)) if sent == received => {}
                (None, None) => {}
                _ => {
                    return Err(Error::new(Error::TRANSPORT_PARAMETER_ERROR)
                        .with_reason("retry_source_connection_id mismatch"));
                }
            }
        }

        self.flow.on_peer_max_data(params.initial_max_data.as_u64());
        self.cids
            .on_peer_parameters(params.active_connection_id_limit.as_u64());

        let released = self.streams.on_peer_parameters(
            params.initial_max_streams_bidi.as_u64(),
            params.initial_max_streams_uni.as_u64(),
            params.initial_max_stream_data_bidi_remote.as_u64(),
            params.initial_max_stream_data_uni.as_u64(),
        );
        for id in released {
            self.streams.enqueue_for_send(id);
            self.app_events.push_back(Event::StreamAccepted { id });
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
        //# Each endpoint advertises a max_idle_timeout, but the
        //# effective value at an endpoint is computed as the minimum of
        //# the two advertised values
        if !params.max_idle_timeout.is_zero() {
            self.idle_timeout = if self.idle_timeout.is_zero() {
                params.max_idle_timeout
            } else {
                self.idle_timeout.min(params.max_idle_timeout)
            };
            self.arm_idle_timer(now);
        }

        self.peer_params = Some(params);
        Ok(())
    }

    fn on_handshake_complete(&mut self, now: Timestamp) -> Result<(), Error> {
        self.handshake_complete = true;
        self.state = State::HandshakeConfirmed;
        self.emit(
            now,
            core_event::Event::HandshakeStatusUpdated(core_event::HandshakeStatusUpdated {
                status: core_event::HandshakeStatus::Complete,
            }),
        );
        self.app_events.push_back(Event::Connected);

        // issue additional source CIDs now that the peer's limit is
        // known; actual generation happens in the worker, which owns
        // the random source and the lookup registration
        self.send.request_flush();

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.1
        //# a client MUST discard Initial keys when it first sends a
        //# Handshake packet
        if self.role.is_client() && self.initial_keys.is_some() {
            self.discard_space(Level::Initial, now);
        }

        if self.role.is_server() {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1.2
            //# the TLS handshake is considered confirmed at the server
            //# when the handshake completes
            self.on_handshake_confirmed(now);
            self.send.flags.set(crate::send::flags::HANDSHAKE_DONE);
        }
        Ok(())
    }

    pub(crate) fn on_handshake_confirmed(&mut self, now: Timestamp) {
        if self.state == State::HandshakeConfirmed {
            self.state = State::Connected;
        }
        self.emit(
            now,
            core_event::Event::HandshakeStatusUpdated(core_event::HandshakeStatusUpdated {
                status: core_event::HandshakeStatus::Confirmed,
            }),
        );
        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.2
        //# An endpoint MUST discard its Handshake keys when the TLS
        //# handshake is confirmed
        self.discard_space(Level::Handshake, now);
        self.active_path_mut().on_validated();
    }

    /// Discards a space's keys and forgets its in-flight packets
    pub(crate) fn discard_space(&mut self, level: Level, _now: Timestamp) {
        match level {
            Level::Initial => self.initial_keys = None,
            Level::Handshake => self.handshake_keys = None,
            Level::OneRtt => debug_assert!(false, "1-RTT keys are never discarded"),
        }
        let space = &mut self.spaces[level.as_index()];
        space.discarded = true;
        space.loss_time = None;
        let discarded = space.sent.drain();
        let path = &mut self.paths[self.active_path];
        for info in discarded {
            if info.in_flight {
                path.congestion.on_packet_discarded(info.bytes as usize);
            }
        }
    }

    // === timers ===

    pub(crate) fn set_timer(&mut self, kind: TimerKind, at: Timestamp) {
        self.timers[kind.as_index()] = Some(at);
    }

    pub(crate) fn cancel_timer(&mut self, kind: TimerKind) {
        self.timers[kind.as_index()] = None;
    }

    /// The earliest pending expiration, for the worker's timer wheel
    pub fn next_expiration(&self) -> Option<Timestamp> {
        self.timers.iter().flatten().min().copied()
    }

    pub(crate) fn arm_idle_timer(&mut self, now: Timestamp) {
        self.last_activity = now;
        let timeout = if self.handshake_complete {
            self.idle_timeout
        } else {
            self.settings.handshake_idle_timeout
        };
        if timeout.is_zero() {
            self.cancel_timer(TimerKind::Idle);
        } else {
            self.set_timer(TimerKind::Idle, now + timeout);
        }
        if !self.settings.keep_alive_interval.is_zero() && self.handshake_complete {
            self.set_timer(TimerKind::KeepAlive, now + self.settings.keep_alive_interval);
        }
    }

    /// Runs every timer whose deadline passed
    pub fn on_timer_expired(&mut self, now: Timestamp) {
        for kind in TimerKind::all() {
            let due = matches!(self.timers[kind.as_index()], Some(at) if at <= now);
            if !due {
                continue;
            }
            self.cancel_timer(kind);
            match kind {
                TimerKind::AckDelay => {
                    self.send.flags.set(crate::send::flags::ACK);
                    self.send.request_flush();
                }
                TimerKind::LossDetection => self.on_loss_timer(now),
                TimerKind::Pacing => {
                    self.send.clear_pacing_block();
                    self.send.request_flush();
                }
                TimerKind::Idle => self.on_idle_timeout(now),
                TimerKind::KeepAlive => {
                    self.send.flags.set(crate::send::flags::PING);
                    self.send.request_flush();
                    self.set_timer(
                        TimerKind::KeepAlive,
                        now + self.settings.keep_alive_interval,
                    );
                }
                TimerKind::Shutdown => self.on_drain_complete(now),
            }
        }
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
    //# When an ack-eliciting packet is transmitted, the sender schedules
    //# a timer for the PTO period
    pub(crate) fn rearm_loss_timer(&mut self, now: Timestamp) {
        if self.state.is_closing() || self.state.is_closed() {
            self.cancel_timer(TimerKind::LossDetection);
            return;
        }

        // earliest time-threshold loss wins over the PTO
        let loss_time = self
            .spaces
            .iter()
            .filter_map(|space| space.loss_time)
            .min();
        if let Some(at) = loss_time {
            self.set_timer(TimerKind::LossDetection, at);
            return;
        }

        let has_eliciting = self
            .spaces
            .iter()
            .any(|space| !space.discarded && space.sent.has_ack_eliciting_in_flight());
        if !has_eliciting {
            self.cancel_timer(TimerKind::LossDetection);
            return;
        }

        let max_ack_delay = if self.handshake_complete {
            self.peer_params
                .as_ref()
                .map(|p| p.max_ack_delay)
                .unwrap_or(Duration::from_millis(25))
        } else {
            Duration::ZERO
        };
        let pto = self.active_path().rtt.pto(max_ack_delay, self.pto_count);

        let oldest = self
            .spaces
            .iter()
            .filter(|space| !space.discarded)
            .filter_map(|space| space.sent.oldest_ack_eliciting_sent())
            .min()
            .unwrap_or(now);
        self.set_timer(TimerKind::LossDetection, oldest + pto);
    }

    fn on_loss_timer(&mut self, now: Timestamp) {
        // time-threshold losses first
        let mut any_lost = false;
        for index in 0..Level::COUNT {
            let Some(at) = self.spaces[index].loss_time else {
                continue;
            };
            if at > now {
                continue;
            }
            self.spaces[index].loss_time = None;
            let largest_acked = self.spaces[index].largest_acked.unwrap_or(0);
            let (latest, smoothed) = {
                let rtt = &self.active_path().rtt;
                (rtt.latest(), rtt.smoothed())
            };
            let (lost, next_loss) =
                self.spaces[index]
                    .sent
                    .detect_lost(now, latest, smoothed, largest_acked);
            self.spaces[index].loss_time = next_loss;
            if !lost.is_empty() {
                any_lost = true;
                self.on_packets_lost(index, lost, now);
            }
        }

        if !any_lost {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.4
            //# When a PTO timer expires, a sender MUST send at least one
            //# ack-eliciting packet in the packet number space as a probe.
            self.pto_count += 1;
            self.send.flags.set(crate::send::flags::PING);
            self.send.request_flush();
        }

        self.rearm_loss_timer(now);
    }

    fn on_idle_timeout(&mut self, now: Timestamp) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
        //# If a max_idle_timeout is specified by either endpoint ... the
        //# connection is silently closed and its state is discarded when
        //# it remains idle
        self.emit(
            now,
            core_event::Event::ConnectionClosed(core_event::ConnectionClosed {
                error_code: 0,
                initiated_by_peer: false,
                silent: true,
            }),
        );
        self.close = Some(CloseState {
            error_code: Error::NO_ERROR,
            frame_type: None,
            reason: Vec::new(),
            is_application: false,
            is_remote: false,
            silent: true,
        });
        self.enter_closed(now);
    }

    // === close handshake ===

    /// Initiates a local close; `silent` skips the CONNECTION_CLOSE
    pub fn close(&mut self, error: Error, is_application: bool, reason: &[u8], silent: bool, now: Timestamp) {
        if self.state.is_closing() || self.state.is_closed() {
            return;
        }

        self.close = Some(CloseState {
            error_code: error.code,
            frame_type: error.frame_type,
            reason: reason.to_vec(),
            is_application,
            is_remote: false,
            silent,
        });

        self.emit(
            now,
            core_event::Event::ConnectionClosed(core_event::ConnectionClosed {
                error_code: error.code.as_u64(),
                initiated_by_peer: false,
                silent,
            }),
        );

        if silent {
            self.enter_closed(now);
            return;
        }

        self.state = State::ClosingLocally;
        self.app_events
            .push_back(Event::ShutdownInitiatedByTransport { error });
        if is_application {
            self.send.flags.set(crate::send::flags::APPLICATION_CLOSE);
        } else {
            self.send.flags.set(crate::send::flags::CONNECTION_CLOSE);
        }
        self.send.request_flush();
        self.begin_drain(now);
    }

    /// Handles a transport error discovered while processing input
    pub(crate) fn close_with_error(&mut self, error: Error, now: Timestamp) {
        self.close(error, false, error.reason.as_bytes(), false, now);
    }

    pub(crate) fn on_peer_close(
        &mut self,
        error_code: VarInt,
        is_application: bool,
        reason: &[u8],
        now: Timestamp,
    ) {
        if self.state.is_closed() || self.state.is_closing() {
            return;
        }

        self.close = Some(CloseState {
            error_code,
            frame_type: None,
            reason: reason.to_vec(),
            is_application,
            is_remote: true,
            silent: false,
        });
        self.state = State::ClosingRemotely;

        self.emit(
            now,
            core_event::Event::ConnectionClosed(core_event::ConnectionClosed {
                error_code: error_code.as_u64(),
                initiated_by_peer: true,
                silent: false,
            }),
        );
        self.app_events.push_back(Event::ShutdownInitiatedByPeer {
            error_code,
            is_application,
            reason: reason.to_vec(),
        });

        self.begin_drain(now);
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2
    //# The closing and draining connection states exist to ensure that
    //# connections close cleanly and that delayed or reordered packets
    //# are properly discarded.  These states SHOULD persist for at
    //# least three times the current PTO interval
    fn begin_drain(&mut self, now: Timestamp) {
        let max_ack_delay = self
            .peer_params
            .as_ref()
            .map(|p| p.max_ack_delay)
            .unwrap_or(Duration::from_millis(25));
        let pto = self.active_path().rtt.pto(max_ack_delay, 0);
        self.set_timer(TimerKind::Shutdown, now + pto * DRAIN_PTO_MULTIPLIER);

        for kind in [
            TimerKind::AckDelay,
            TimerKind::LossDetection,
            TimerKind::Pacing,
            TimerKind::Idle,
            TimerKind::KeepAlive,
        ] {
            self.cancel_timer(kind);
        }
    }

    fn on_drain_complete(&mut self, now: Timestamp) {
        self.enter_closed(now);
    }

    pub(crate) fn enter_closed(&mut self, _now: Timestamp) {
        if self.state.is_closed() {
            return;
        }
        self.state = State::Closed;
        self.timers = [None; TimerKind::COUNT];
        self.app_events.push_back(Event::ShutdownComplete);
    }

    /// The peer acknowledged our CONNECTION_CLOSE; draining can end
    /// early
    pub(crate) fn on_close_acked(&mut self, now: Timestamp) {
        if self.state == State::ClosingLocally {
            self.enter_closed(now);
        }
    }

    // === ack / loss routing ===

    /// Routes the frames of an acknowledged packet
    pub(crate) fn on_packet_acked(&mut self, _space_index: usize, info: SentPacketInfo, now: Timestamp) {
        if info.in_flight {
            self.paths[self.active_path]
                .congestion
                .on_packet_acked(info.bytes as usize, info.time_sent);
        }

        for frame in info.frames {
            match frame {
                SentFrame::Stream { id, offset, len, is_fin } => {
                    if let Some(stream) = self.streams.get_mut(id) {
                        stream.on_stream_frame_acked(offset, len, is_fin);
                        if stream.is_terminal() && self.streams.on_stream_terminal(id) {
                            self.update_max_streams_flags();
                        }
                    }
                }
                SentFrame::ResetStream { id } => {
                    if let Some(stream) = self.streams.get_mut(id) {
                        stream.on_reset_frame_acked();
                        if stream.is_terminal() && self.streams.on_stream_terminal(id) {
                            self.update_max_streams_flags();
                        }
                    }
                }
                SentFrame::ConnectionClose => self.on_close_acked(now),
                SentFrame::HandshakeDone => self.handshake_done_acked = true,
                _ => {}
            }
        }
    }

    /// Requeues the frames of lost packets and counts the loss
    pub(crate) fn on_packets_lost(&mut self, space_index: usize, lost: Vec<SentPacketInfo>, now: Timestamp) {
        let mut lost_bytes = 0usize;
        let mut newest_sent = None;

        for info in lost {
            self.counters.suspected_lost_packets += 1;
            self.emit(
                now,
                core_event::Event::PacketLost(core_event::PacketLost {
                    space: self.spaces[space_index].level.space(),
                    packet_number: info.packet_number,
                    bytes: info.bytes as usize,
                    by_packet_threshold: true,
                }),
            );
            if info.in_flight {
                lost_bytes += info.bytes as usize;
            }
            newest_sent = Some(match newest_sent {
                Some(existing) if existing >= info.time_sent => existing,
                _ => info.time_sent,
            });

            for frame in info.frames {
                match frame {
                    SentFrame::Stream { id, offset, len, is_fin } => {
                        if let Some(stream) = self.streams.get_mut(id) {
                            stream.on_stream_frame_lost(offset, len, is_fin);
                        }
                        self.streams.enqueue_for_send(id);
                    }
                    SentFrame::Crypto { offset, len } => {
                        self.spaces[space_index].crypto_tx.on_chunk_lost(offset, len);
                    }
                    SentFrame::ResetStream { id } => {
                        if let Some(stream) = self.streams.get_mut(id) {
                            stream.on_reset_frame_lost();
                        }
                        self.streams.enqueue_for_send(id);
                    }
                    SentFrame::StopSending { id } => {
                        if let Some(stream) = self.streams.get_mut(id) {
                            stream.on_stop_sending_frame_lost();
                        }
                        self.streams.enqueue_for_send(id);
                    }
                    SentFrame::MaxData => {
                        if self.flow.pending_max_data || self.flow.rx_max < self.flow.next_max_data() {
                            self.flow.pending_max_data = true;
                            self.send.flags.set(crate::send::flags::MAX_DATA);
                        }
                    }
                    SentFrame::MaxStreamData { id } => {
                        if let Some(stream) = self.streams.get_mut(id) {
                            stream.pending_max_stream_data = true;
                        }
                        self.streams.enqueue_for_send(id);
                    }
                    SentFrame::MaxStreams { stream_type } => {
                        let index = match stream_type {
                            StreamType::Bidirectional => crate::send::flags::MAX_STREAMS_BIDI,
                            StreamType::Unidirectional => crate::send::flags::MAX_STREAMS_UNI,
                        };
                        self.send.flags.set(index);
                    }
                    SentFrame::DataBlocked => {
                        if self.flow.tx_blocked_at.is_some() {
                            self.send.flags.set(crate::send::flags::DATA_BLOCKED);
                        }
                    }
                    SentFrame::NewConnectionId { sequence } => {
                        self.cids.on_new_cid_frame_lost(sequence);
                        self.send.flags.set(crate::send::flags::NEW_CONNECTION_ID);
                    }
                    SentFrame::RetireConnectionId { sequence } => {
                        self.cids.on_retire_frame_lost(sequence);
                        self.send.flags.set(crate::send::flags::RETIRE_CONNECTION_ID);
                    }
                    SentFrame::PathChallenge => {
                        self.send.flags.set(crate::send::flags::PATH_CHALLENGE);
                    }
                    SentFrame::PathResponse => {}
                    SentFrame::HandshakeDone => {
                        if !self.handshake_done_acked {
                            self.send.flags.set(crate::send::flags::HANDSHAKE_DONE);
                        }
                    }
                    SentFrame::Ack { .. }
                    | SentFrame::Ping
                    | SentFrame::ConnectionClose
                    | SentFrame::StreamDataBlocked { .. }
                    | SentFrame::StreamsBlocked { .. } => {}
                }
            }
        }

        if lost_bytes > 0 {
            if let Some(newest) = newest_sent {
                self.paths[self.active_path]
                    .congestion
                    .on_packets_lost(lost_bytes, newest, false, now);
            }
        }
        self.send.request_flush();
    }

    pub(crate) fn update_max_streams_flags(&mut self) {
        if self.streams.pending_max_streams[0] {
            self.send.flags.set(crate::send::flags::MAX_STREAMS_BIDI);
        }
        if self.streams.pending_max_streams[1] {
            self.send.flags.set(crate::send::flags::MAX_STREAMS_UNI);
        }
        self.send.request_flush();
    }

    // === application operations ===

    pub fn open_stream(
        &mut self,
        stream_type: StreamType,
        fail_on_blocked: bool,
    ) -> Result<(StreamId, OpenStatus), ApiError> {
        if self.state.is_closing() || self.state.is_closed() {
            return Err(ApiError::InvalidState);
        }
        let (id, status) = self.streams.open_local(stream_type, fail_on_blocked)?;
        if status == OpenStatus::Queued {
            let index = match stream_type {
                StreamType::Bidirectional => crate::send::flags::STREAMS_BLOCKED_BIDI,
                StreamType::Unidirectional => crate::send::flags::STREAMS_BLOCKED_UNI,
            };
            if self.peer_params.is_some() {
                self.send.flags.set(index);
                self.send.request_flush();
            }
        }
        Ok((id, status))
    }

    pub fn stream_write(&mut self, id: StreamId, data: &[u8], fin: bool) -> Result<(), ApiError> {
        if self.state.is_closing() || self.state.is_closed() {
            return Err(ApiError::InvalidState);
        }
        let stream = self.streams.get_mut(id).ok_or(ApiError::InvalidState)?;
        stream.write(data, fin)?;
        self.streams.enqueue_for_send(id);
        self.send.request_flush();
        Ok(())
    }

    pub fn stream_read(&mut self, id: StreamId, out: &mut [u8]) -> Result<(usize, bool), ApiError> {
        let stream = self.streams.get_mut(id).ok_or(ApiError::InvalidState)?;
        let result = stream.read(out);
        if let Ok((bytes, _)) = result {
            if bytes > 0 {
                self.flow.on_delivered(bytes as u64);
                if self.flow.pending_max_data {
                    self.send.flags.set(crate::send::flags::MAX_DATA);
                }
                if self.streams.get_mut(id).is_some_and(|s| s.pending_max_stream_data) {
                    self.streams.enqueue_for_send(id);
                }
                self.send.request_flush();
            }
        }
        if self
            .streams
            .get_mut(id)
            .map(|s| s.is_terminal())
            .unwrap_or(false)
            && self.streams.on_stream_terminal(id)
        {
            self.update_max_streams_flags();
        }
        result
    }

    pub fn stream_reset(&mut self, id: StreamId, code: VarInt) -> Result<(), ApiError> {
        let stream = self.streams.get_mut(id).ok_or(ApiError::InvalidState)?;
        stream.reset(code)?;
        self.streams.enqueue_for_send(id);
        self.send.request_flush();
        Ok(())
    }

    pub fn stream_stop_sending(&mut self, id: StreamId, code: VarInt) -> Result<(), ApiError> {
        let stream = self.streams.get_mut(id).ok_or(ApiError::InvalidState)?;
        stream.stop_sending(code)?;
        self.streams.enqueue_for_send(id);
        self.send.request_flush();
        Ok(())
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.app_events.pop_front()
    }
}

/// The transport parameters an endpoint advertises, derived from its
/// settings. Callers prime the TLS session with the same value so the
/// wire and the state machine agree.
pub fn local_parameters(settings: &Settings, local_cid: ConnectionId) -> TransportParameters {
    let mut params = TransportParameters::default();
    params.initial_source_connection_id = Some(local_cid);
    params.max_idle_timeout = settings.max_idle_timeout;
    params.initial_max_data = settings.initial_max_data;
    params.initial_max_stream_data_bidi_local = settings.initial_max_stream_data_bidi;
    params.initial_max_stream_data_bidi_remote = settings.initial_max_stream_data_bidi;
    params.initial_max_stream_data_uni = settings.initial_max_stream_data_uni;
    params.initial_max_streams_bidi = settings.initial_max_streams_bidi;
    params.initial_max_streams_uni = settings.initial_max_streams_uni;
    params.max_ack_delay = settings.max_ack_delay;
    params.active_connection_id_limit = settings.active_connection_id_limit;
    params
}

