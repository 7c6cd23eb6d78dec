// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Structured transport events.
//!
//! The transport never formats log strings; it emits typed events
//! through a [`Subscriber`]. Integrations decide how to record them.

use crate::{
    packet::number::PacketNumberSpace,
    time::Timestamp,
    varint::VarInt,
};

/// Context common to every event
#[derive(Clone, Copy, Debug)]
pub struct Meta {
    /// Opaque identifier of the emitting connection, 0 for
    /// endpoint-level events
    pub connection: u64,
    pub timestamp: Timestamp,
}

#[derive(Clone, Debug)]
pub enum Event {
    ConnectionStarted(ConnectionStarted),
    HandshakeStatusUpdated(HandshakeStatusUpdated),
    PacketSent(PacketSent),
    PacketReceived(PacketReceived),
    PacketDropped(PacketDropped),
    PacketLost(PacketLost),
    KeyUpdated(KeyUpdated),
    StreamOpened(StreamOpened),
    StreamClosed(StreamClosed),
    ConnectionClosed(ConnectionClosed),
    StatelessResetSent(StatelessResetSent),
    RetrySent(RetrySent),
    VersionNegotiationSent(VersionNegotiationSent),
}

#[derive(Clone, Copy, Debug)]
pub struct ConnectionStarted {
    pub is_server: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    Started,
    Complete,
    Confirmed,
}

#[derive(Clone, Copy, Debug)]
pub struct HandshakeStatusUpdated {
    pub status: HandshakeStatus,
}

#[derive(Clone, Copy, Debug)]
pub struct PacketSent {
    pub space: PacketNumberSpace,
    pub packet_number: u64,
    pub bytes: usize,
    pub is_ack_eliciting: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct PacketReceived {
    pub space: PacketNumberSpace,
    pub packet_number: u64,
    pub bytes: usize,
}

/// Why an inbound packet was not processed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    DecryptionFailed,
    Duplicate,
    NoMatchingKey,
    MalformedHeader,
    UnroutableConnectionId,
    UnsupportedVersion,
    AmplificationLimited,
    InvalidRetry,
}

#[derive(Clone, Copy, Debug)]
pub struct PacketDropped {
    pub reason: DropReason,
    pub bytes: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct PacketLost {
    pub space: PacketNumberSpace,
    pub packet_number: u64,
    pub bytes: usize,
    /// Lost by reordering threshold rather than time
    pub by_packet_threshold: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct KeyUpdated {
    pub generation: u64,
    pub initiated_locally: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct StreamOpened {
    pub stream_id: VarInt,
    pub peer_initiated: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct StreamClosed {
    pub stream_id: VarInt,
}

#[derive(Clone, Copy, Debug)]
pub struct ConnectionClosed {
    pub error_code: u64,
    pub initiated_by_peer: bool,
    /// No CONNECTION_CLOSE was exchanged (idle timeout, silent close)
    pub silent: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct StatelessResetSent {
    pub bytes: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct RetrySent {
    pub token_len: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct VersionNegotiationSent {
    pub rejected_version: u32,
}

/// Receives every event the transport emits.
///
/// Implementations must be cheap and non-blocking; they run on the
/// worker threads.
pub trait Subscriber: 'static + Send + Sync {
    fn on_event(&self, meta: &Meta, event: &Event);
}

/// Discards every event
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSubscriber;

impl Subscriber for NoopSubscriber {
    #[inline]
    fn on_event(&self, _meta: &Meta, _event: &Event) {}
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records events for later assertions
    #[derive(Debug, Default)]
    pub struct Recorder {
        pub events: Mutex<Vec<(Meta, Event)>>,
    }

    impl Subscriber for Recorder {
        fn on_event(&self, meta: &Meta, event: &Event) {
            self.events.lock().unwrap().push((*meta, event.clone()));
        }
    }
}
