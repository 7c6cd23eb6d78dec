// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic end-to-end tests driving two connections directly,
//! with a hand-cranked clock and an in-memory wire.

use core::time::Duration;
use quill_core::{
    connection::ConnectionId,
    event::NoopSubscriber,
    stream::StreamType,
    time::Timestamp,
    transport::parameters::TransportParameters,
    varint::VarInt,
};
use quill_transport::{
    config::Settings,
    connection::{Connection, Event, State},
    tls::testing::TestSession,
    worker::ConnectionHandle,
};
use ring::rand::SystemRandom;
use std::{net::SocketAddr, sync::Arc};

const CLIENT_ADDR: &str = "10.0.0.1:1111";
const SERVER_ADDR: &str = "10.0.0.2:4433";

struct Pair {
    client: Connection,
    server: Connection,
    now: Timestamp,
}

fn cid(bytes: &[u8]) -> ConnectionId {
    ConnectionId::try_from_slice(bytes).unwrap()
}

impl Pair {
    fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let subscriber = Arc::new(NoopSubscriber);
        let now = Timestamp::from_micros(1_000_000);

        let client_addr: SocketAddr = CLIENT_ADDR.parse().unwrap();
        let server_addr: SocketAddr = SERVER_ADDR.parse().unwrap();

        let client_scid = cid(&[1; 8]);
        let client_dcid = cid(&[9, 9, 9, 9, 9, 9, 9, 9]);
        let server_scid = cid(&[2; 8]);

        let client = Connection::client(
            ConnectionHandle::from_raw(1),
            settings.clone(),
            subscriber.clone(),
            SystemRandom::new(),
            Box::new(TestSession::new(
                quill_core::endpoint::Type::Client,
                7,
                client_params(&settings, client_scid),
            )),
            client_scid,
            client_dcid,
            client_addr,
            server_addr,
            now,
        )
        .unwrap();

        let mut server_params = client_params(&settings, server_scid);
        server_params.original_destination_connection_id = Some(client_dcid);
        let server = Connection::server(
            ConnectionHandle::from_raw(2),
            settings.clone(),
            subscriber,
            SystemRandom::new(),
            Box::new(TestSession::new(
                quill_core::endpoint::Type::Server,
                8,
                server_params,
            )),
            server_scid,
            client_scid,
            client_dcid,
            None,
            server_addr,
            client_addr,
            now,
        )
        .unwrap();

        Self { client, server, now }
    }

    fn advance(&mut self, duration: Duration) {
        self.now = self.now + duration;
        self.fire_timers();
    }

    fn fire_timers(&mut self) {
        for connection in [&mut self.client, &mut self.server] {
            if matches!(connection.next_expiration(), Some(at) if at <= self.now) {
                connection.on_timer_expired(self.now);
            }
        }
    }

    /// Shuttles datagrams both ways until the wire is quiet.
    ///
    /// Returns the number of datagrams moved; `drop_filter` may eat
    /// datagrams to simulate loss.
    fn pump_with(&mut self, drop_filter: &mut dyn FnMut(&[u8]) -> bool) -> usize {
        let mut moved = 0;
        for _ in 0..64 {
            let mut quiet = true;

            for datagram in self.client.process_flush_send(self.now) {
                quiet = false;
                moved += 1;
                if drop_filter(&datagram.payload) {
                    continue;
                }
                let mut payload = datagram.payload;
                self.server
                    .on_datagram(&mut payload, datagram.local, self.now);
            }
            for datagram in self.server.process_flush_send(self.now) {
                quiet = false;
                moved += 1;
                if drop_filter(&datagram.payload) {
                    continue;
                }
                let mut payload = datagram.payload;
                self.client
                    .on_datagram(&mut payload, datagram.local, self.now);
            }

            self.now = self.now + Duration::from_millis(1);
            self.fire_timers();

            if quiet {
                break;
            }
        }
        moved
    }

    fn pump(&mut self) -> usize {
        self.pump_with(&mut |_| false)
    }

    fn complete_handshake(&mut self) {
        self.pump();
        // let delayed ACK timers and HANDSHAKE_DONE settle
        self.advance(Duration::from_millis(30));
        self.pump();

        assert_eq!(self.client.state(), State::Connected);
        assert_eq!(self.server.state(), State::Connected);
    }

    fn events(connection: &mut Connection) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = connection.poll_event() {
            events.push(event);
        }
        events
    }
}

fn client_params(settings: &Settings, scid: ConnectionId) -> TransportParameters {
    let mut params = TransportParameters::default();
    params.initial_source_connection_id = Some(scid);
    params.initial_max_data = settings.initial_max_data;
    params.initial_max_stream_data_bidi_local = settings.initial_max_stream_data_bidi;
    params.initial_max_stream_data_bidi_remote = settings.initial_max_stream_data_bidi;
    params.initial_max_stream_data_uni = settings.initial_max_stream_data_uni;
    params.initial_max_streams_bidi = settings.initial_max_streams_bidi;
    params.initial_max_streams_uni = settings.initial_max_streams_uni;
    params.active_connection_id_limit = settings.active_connection_id_limit;
    params.max_idle_timeout = settings.max_idle_timeout;
    params
}

/// Handshake, one echo stream, then shutdown on idle timeout
#[test]
fn handshake_and_one_stream() {
    let mut pair = Pair::new(Settings::default());
    pair.complete_handshake();

    let client_events = Pair::events(&mut pair.client);
    assert!(client_events.contains(&Event::Connected));
    let server_events = Pair::events(&mut pair.server);
    assert!(server_events.contains(&Event::Connected));

    // client opens bidi stream 0 and sends "hello" with FIN
    let (id, _) = pair.client.open_stream(StreamType::Bidirectional, false).unwrap();
    assert_eq!(u64::from(id), 0);
    pair.client.stream_write(id, b"hello", true).unwrap();
    pair.pump();

    let server_events = Pair::events(&mut pair.server);
    assert!(server_events.iter().any(|event| matches!(
        event,
        Event::StreamStarted { id: sid, stream_type: StreamType::Bidirectional } if *sid == id
    )));
    assert!(server_events
        .iter()
        .any(|event| matches!(event, Event::StreamReadable { id: sid } if *sid == id)));

    let mut out = [0u8; 16];
    let (len, fin) = pair.server.stream_read(id, &mut out).unwrap();
    assert_eq!(&out[..len], &[0x68, 0x65, 0x6c, 0x6c, 0x6f]);
    assert!(fin);

    // server echoes "HI" with FIN
    pair.server.stream_write(id, b"HI", true).unwrap();
    pair.pump();

    let mut out = [0u8; 16];
    let (len, fin) = pair.client.stream_read(id, &mut out).unwrap();
    assert_eq!(&out[..len], b"HI");
    assert!(fin);

    // both halves terminal on both sides; the ack exchange finishes it
    pair.advance(Duration::from_millis(50));
    pair.pump();

    // idle timeout closes silently
    pair.advance(Duration::from_secs(31));
    assert_eq!(pair.client.state(), State::Closed);
    assert_eq!(pair.server.state(), State::Closed);
    assert!(Pair::events(&mut pair.client).contains(&Event::ShutdownComplete));
    assert!(Pair::events(&mut pair.server).contains(&Event::ShutdownComplete));
}

/// Datagram loss is repaired by the loss-detection timers
#[test]
fn loss_recovery_retransmits() {
    let mut pair = Pair::new(Settings::default());
    pair.complete_handshake();
    Pair::events(&mut pair.client);
    Pair::events(&mut pair.server);

    let (id, _) = pair.client.open_stream(StreamType::Bidirectional, false).unwrap();
    pair.client.stream_write(id, b"lost once", false).unwrap();

    // eat every datagram for a few rounds
    let mut dropped = 0;
    pair.pump_with(&mut |_| {
        dropped += 1;
        true
    });
    assert!(dropped > 0);

    // PTO fires and retransmission gets through
    for _ in 0..20 {
        pair.advance(Duration::from_millis(200));
        pair.pump();
        if pair
            .server
            .poll_event()
            .map(|event| matches!(event, Event::StreamReadable { .. } | Event::StreamStarted { .. }))
            .unwrap_or(false)
        {
            break;
        }
    }

    let mut out = [0u8; 32];
    let (len, _) = pair.server.stream_read(id, &mut out).unwrap();
    assert_eq!(&out[..len], b"lost once");
}

/// Connection-level close propagates to the peer
#[test]
fn application_close_reaches_peer() {
    let mut pair = Pair::new(Settings::default());
    pair.complete_handshake();
    Pair::events(&mut pair.client);
    Pair::events(&mut pair.server);

    pair.client.close(
        quill_core::transport::Error::new(VarInt::from_u8(7)),
        true,
        b"done here",
        false,
        pair.now,
    );
    pair.pump();

    assert_eq!(pair.server.state(), State::ClosingRemotely);
    let events = Pair::events(&mut pair.server);
    assert!(events.iter().any(|event| matches!(
        event,
        Event::ShutdownInitiatedByPeer { error_code, is_application: true, .. }
            if *error_code == VarInt::from_u8(7)
    )));

    // the drain period ends both sides
    pair.advance(Duration::from_secs(10));
    assert_eq!(pair.client.state(), State::Closed);
    assert_eq!(pair.server.state(), State::Closed);
}

/// Streams blocked on the peer's MAX_STREAMS limit release in order
#[test]
fn stream_limit_blocks_and_releases() {
    let settings = Settings::builder()
        .with_initial_max_streams_bidi(VarInt::from_u8(1))
        .build()
        .unwrap();
    let mut pair = Pair::new(settings);
    pair.complete_handshake();
    Pair::events(&mut pair.client);

    use quill_transport::stream::set::OpenStatus;
    let (first, status) = pair.client.open_stream(StreamType::Bidirectional, false).unwrap();
    assert_eq!(status, OpenStatus::Opened);
    let (second, status) = pair.client.open_stream(StreamType::Bidirectional, false).unwrap();
    assert_eq!(status, OpenStatus::Queued);

    // writes on the queued stream wait for the peer
    pair.client.stream_write(second, b"queued", false).unwrap();
    pair.client.stream_write(first, b"x", true).unwrap();
    pair.pump();

    // the server reads the first stream to completion; closing it
    // replenishes the budget and MAX_STREAMS releases the second
    let mut out = [0u8; 8];
    let (_, fin) = pair.server.stream_read(first, &mut out).unwrap();
    assert!(fin);
    pair.server.stream_write(first, b"", true).unwrap();
    pair.pump();
    let mut out = [0u8; 8];
    let _ = pair.client.stream_read(first, &mut out).unwrap();
    pair.advance(Duration::from_millis(30));
    pair.pump();

    let events = Pair::events(&mut pair.client);
    assert!(
        events
            .iter()
            .any(|event| matches!(event, Event::StreamAccepted { id } if *id == second)),
        "expected the queued stream to be accepted: {events:?}"
    );

    pair.pump();
    let server_events = Pair::events(&mut pair.server);
    assert!(server_events
        .iter()
        .any(|event| matches!(event, Event::StreamReadable { id } if *id == second)));
}
