// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! `tracing`-backed event subscriber.
//!
//! The transport emits typed events; this adapter renders them as
//! structured `tracing` records so existing collectors pick them up
//! without the core ever formatting strings.

use quill_core::event::{Event, Meta, Subscriber};

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSubscriber;

impl Subscriber for TracingSubscriber {
    fn on_event(&self, meta: &Meta, event: &Event) {
        let connection = meta.connection;
        match event {
            Event::ConnectionStarted(e) => {
                tracing::debug!(connection, is_server = e.is_server, "connection started");
            }
            Event::HandshakeStatusUpdated(e) => {
                tracing::debug!(connection, status = ?e.status, "handshake status");
            }
            Event::PacketSent(e) => {
                tracing::trace!(
                    connection,
                    space = ?e.space,
                    pn = e.packet_number,
                    bytes = e.bytes,
                    ack_eliciting = e.is_ack_eliciting,
                    "packet sent"
                );
            }
            Event::PacketReceived(e) => {
                tracing::trace!(
                    connection,
                    space = ?e.space,
                    pn = e.packet_number,
                    bytes = e.bytes,
                    "packet received"
                );
            }
            Event::PacketDropped(e) => {
                tracing::debug!(connection, reason = ?e.reason, bytes = e.bytes, "packet dropped");
            }
            Event::PacketLost(e) => {
                tracing::debug!(
                    connection,
                    space = ?e.space,
                    pn = e.packet_number,
                    bytes = e.bytes,
                    "packet lost"
                );
            }
            Event::KeyUpdated(e) => {
                tracing::debug!(
                    connection,
                    generation = e.generation,
                    local = e.initiated_locally,
                    "key updated"
                );
            }
            Event::StreamOpened(e) => {
                tracing::debug!(connection, stream = %e.stream_id, peer = e.peer_initiated, "stream opened");
            }
            Event::StreamClosed(e) => {
                tracing::debug!(connection, stream = %e.stream_id, "stream closed");
            }
            Event::ConnectionClosed(e) => {
                tracing::debug!(
                    connection,
                    error_code = e.error_code,
                    by_peer = e.initiated_by_peer,
                    silent = e.silent,
                    "connection closed"
                );
            }
            Event::StatelessResetSent(e) => {
                tracing::debug!(connection, bytes = e.bytes, "stateless reset sent");
            }
            Event::RetrySent(e) => {
                tracing::debug!(connection, token_len = e.token_len, "retry sent");
            }
            Event::VersionNegotiationSent(e) => {
                tracing::debug!(
                    connection,
                    rejected = e.rejected_version,
                    "version negotiation sent"
                );
            }
        }
    }
}
