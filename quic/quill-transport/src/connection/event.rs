// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Events a connection surfaces to its application

use quill_core::{
    stream::{StreamId, StreamType},
    transport,
    varint::VarInt,
};
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The handshake completed; application data may flow
    Connected,

    /// The peer opened a stream
    StreamStarted {
        id: StreamId,
        stream_type: StreamType,
    },

    /// A stream we queued past the peer's limit was admitted
    StreamAccepted { id: StreamId },

    /// The peer raised our stream budgets
    StreamsAvailable { bidi: u64, uni: u64 },

    /// Ordered bytes are ready for reading
    StreamReadable { id: StreamId },

    /// The peer reset a stream
    StreamReset { id: StreamId, error_code: VarInt },

    /// The peer asked us to stop sending on a stream
    StreamStopSending { id: StreamId, error_code: VarInt },

    /// The peer's address changed (path migration)
    PeerAddressChanged { remote: SocketAddr },

    /// The peer sent CONNECTION_CLOSE
    ShutdownInitiatedByPeer {
        error_code: VarInt,
        is_application: bool,
        reason: Vec<u8>,
    },

    /// The transport is closing the connection locally
    ShutdownInitiatedByTransport { error: transport::Error },

    /// The drain finished; the handle may be released
    ShutdownComplete,
}
