// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Endpoint tests through the full fabric: library, workers, bindings
//! and the in-memory datapath.

use quill_core::{
    event::{testing::Recorder, Event as CoreEvent},
    stream::StreamType,
    varint::VarInt,
};
use quill_transport::{
    binding::Binding,
    config::Settings,
    connection::Event,
    datapath::testing::{pair, Queue, QueueTx},
    library::{ConnectionApi, Library},
    tls::testing::TestProvider,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

const CLIENT_ADDR: &str = "10.0.0.1:1111";
const SERVER_ADDR: &str = "10.0.0.2:4433";

struct Wire {
    client_out: Arc<Queue>,
    server_out: Arc<Queue>,
    client_binding: Arc<Binding>,
    server_binding: Arc<Binding>,
}

impl Wire {
    /// Moves queued datagrams into the receiving bindings
    fn pump(&self) {
        let to_server = self.client_out.drain();
        if !to_server.is_empty() {
            self.server_binding.receive(to_server);
        }
        let to_client = self.server_out.drain();
        if !to_client.is_empty() {
            self.client_binding.receive(to_client);
        }
    }
}

fn setup(settings: Settings, recorder: Arc<Recorder>) -> (Library, Wire, ConnectionApi) {
    let library = Library::builder()
        .with_settings(settings)
        .with_subscriber(recorder)
        .with_tls(Arc::new(TestProvider { seed: 42 }))
        .with_worker_count(2)
        .build();

    let (client_out, server_out) = pair();
    let server_binding = library.listen(
        SERVER_ADDR.parse().unwrap(),
        Arc::new(QueueTx {
            queue: server_out.clone(),
        }),
    );
    let (client_binding, api) = library
        .connect(
            CLIENT_ADDR.parse().unwrap(),
            SERVER_ADDR.parse().unwrap(),
            Arc::new(QueueTx {
                queue: client_out.clone(),
            }),
        )
        .unwrap();

    (
        library,
        Wire {
            client_out,
            server_out,
            client_binding,
            server_binding,
        },
        api,
    )
}

/// Pumps the wire until `predicate` holds or the deadline passes
fn wait_for(wire: &Wire, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        wire.pump();
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn drain_events(api: &ConnectionApi) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = api.poll_event() {
        events.push(event);
    }
    events
}

#[test]
fn echo_through_the_fabric() {
    let recorder = Arc::new(Recorder::default());
    let (library, wire, client) = setup(Settings::default(), recorder);

    let mut client_events = Vec::new();
    assert!(
        wait_for(&wire, || {
            client_events.extend(drain_events(&client));
            client_events.contains(&Event::Connected)
        }),
        "handshake did not complete: {client_events:?}"
    );

    // the listener discovered exactly one connection
    let routes = wire.server_binding.connections();
    assert_eq!(routes.len(), 1);
    let server = library.api_for(routes[0]);

    let (id, _) = client.open_stream(StreamType::Bidirectional, false).unwrap();
    client.write(id, b"ping", true).unwrap();

    let mut server_events = Vec::new();
    assert!(
        wait_for(&wire, || {
            server_events.extend(drain_events(&server));
            server_events
                .iter()
                .any(|event| matches!(event, Event::StreamReadable { id: sid } if *sid == id))
        }),
        "stream data did not arrive: {server_events:?}"
    );
    assert!(server_events
        .iter()
        .any(|event| matches!(event, Event::StreamStarted { id: sid, .. } if *sid == id)));

    let (data, fin) = server.read(id, 64).unwrap();
    assert_eq!(data, b"ping");
    assert!(fin);

    server.write(id, b"pong", true).unwrap();
    let mut echoed = None;
    assert!(wait_for(&wire, || {
        let _ = drain_events(&client);
        match client.read(id, 64) {
            Ok((data, true)) if !data.is_empty() => {
                echoed = Some(data);
                true
            }
            _ => false,
        }
    }));
    assert_eq!(echoed.unwrap(), b"pong");

    client.close(VarInt::from_u8(0), b"bye");
    assert!(wait_for(&wire, || {
        matches!(
            server.state(),
            Some(quill_transport::connection::State::ClosingRemotely)
                | Some(quill_transport::connection::State::Closed)
        )
    }));

    library.shutdown();
}

#[test]
fn stateless_retry_round_trip() {
    let settings = Settings::builder().with_retry_enabled(true).build().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (library, wire, client) = setup(settings, recorder.clone());

    let mut client_events = Vec::new();
    assert!(
        wait_for(&wire, || {
            client_events.extend(drain_events(&client));
            client_events.contains(&Event::Connected)
        }),
        "handshake with retry did not complete"
    );

    // the token-less first Initial was answered with a Retry
    let events = recorder.events.lock().unwrap();
    assert!(
        events
            .iter()
            .any(|(_, event)| matches!(event, CoreEvent::RetrySent(_))),
        "no retry was emitted"
    );
    drop(events);

    // and the connection still works
    let (id, _) = client.open_stream(StreamType::Bidirectional, false).unwrap();
    client.write(id, b"after retry", true).unwrap();

    let routes = wire.server_binding.connections();
    assert_eq!(routes.len(), 1);
    let server = library.api_for(routes[0]);
    assert!(wait_for(&wire, || {
        let _ = drain_events(&server);
        matches!(server.read(id, 64), Ok((data, true)) if data == b"after retry")
    }));

    library.shutdown();
}

#[test]
fn unroutable_short_packets_get_stateless_resets() {
    let recorder = Arc::new(Recorder::default());
    let (library, wire, _client) = setup(Settings::default(), recorder.clone());

    // a short-header-shaped datagram with an unknown CID
    let mut junk = vec![0x43u8; 64];
    junk[1..9].copy_from_slice(&[0xde; 8]);
    wire.server_binding.receive(vec![quill_transport::datapath::Datagram {
        local: SERVER_ADDR.parse().unwrap(),
        remote: "10.9.9.9:7777".parse().unwrap(),
        ecn: Default::default(),
        payload: junk,
    }]);

    let events = recorder.events.lock().unwrap();
    assert!(events
        .iter()
        .any(|(_, event)| matches!(event, CoreEvent::StatelessResetSent(_))));
    drop(events);

    library.shutdown();
}
