// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection stream collection.
//!
//! Streams live in a hash table keyed by ID. Locally opened streams
//! that the peer's MAX_STREAMS limit does not yet admit wait in a
//! sorted side list and are released lowest-ID-first when the limit
//! rises. A four-entry table tracks per-type counts: how many are
//! open, how many were ever opened, how many the peer lets us open,
//! and how many we let the peer open.

use crate::stream::{ApiError, Stream};
use hashbrown::HashMap;
use quill_core::{
    endpoint,
    stream::{StreamId, StreamType},
    transport::Error,
    varint::VarInt,
};
use std::collections::{BTreeMap, VecDeque};

/// Index of a stream type in the counts table: the two low ID bits
#[inline]
fn type_index(id: StreamId) -> usize {
    (id.as_varint().as_u64() & 0b11) as usize
}

#[inline]
fn type_index_for(initiator: endpoint::Type, stream_type: StreamType) -> usize {
    type_index(StreamId::initial(initiator, stream_type))
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TypeCounts {
    /// Streams of this type currently open
    pub current: u64,
    /// Streams of this type ever opened
    pub total: u64,
    /// How many the peer permits us to open (locally initiated types)
    pub max_from_peer: u64,
    /// How many we permit the peer to open (peer initiated types)
    pub max_announced: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenStatus {
    Opened,
    /// Blocked on the peer's limit; queued until MAX_STREAMS arrives
    Queued,
}

/// Outcome of resolving an inbound frame's stream ID
#[derive(Debug)]
pub enum PeerStream<'a> {
    Stream(&'a mut Stream, Vec<StreamId>),
    /// The stream existed and is already closed; the frame is stale
    Closed,
}

pub struct StreamSet {
    role: endpoint::Type,
    streams: HashMap<u64, Stream>,
    /// Locally opened streams blocked on the peer's limit, by ID
    waiting: BTreeMap<u64, Stream>,
    closed: Vec<StreamId>,
    types: [TypeCounts; 4],

    /// Streams with transmission work, drained by the send engine
    pub send_queue: VecDeque<StreamId>,

    /// MAX_STREAMS (bidi, uni) should be announced
    pub pending_max_streams: [bool; 2],
    /// STREAMS_BLOCKED (bidi, uni) should be emitted at this limit
    pub pending_streams_blocked: [Option<u64>; 2],

    /// Window for new inbound stream data
    recv_window_bidi: u64,
    recv_window_uni: u64,
    /// Peer's initial allowances for new outbound data
    peer_initial_max_stream_data_bidi: u64,
    peer_initial_max_stream_data_uni: u64,
}

impl StreamSet {
    pub fn new(
        role: endpoint::Type,
        max_streams_bidi_announced: u64,
        max_streams_uni_announced: u64,
        recv_window_bidi: u64,
        recv_window_uni: u64,
    ) -> Self {
        let mut types = [TypeCounts::default(); 4];
        let peer = role.peer_type();
        types[type_index_for(peer, StreamType::Bidirectional)].max_announced =
            max_streams_bidi_announced;
        types[type_index_for(peer, StreamType::Unidirectional)].max_announced =
            max_streams_uni_announced;

        Self {
            role,
            streams: HashMap::new(),
            waiting: BTreeMap::new(),
            closed: Vec::new(),
            types,
            send_queue: VecDeque::new(),
            pending_max_streams: [false; 2],
            pending_streams_blocked: [None; 2],
            recv_window_bidi,
            recv_window_uni,
            peer_initial_max_stream_data_bidi: 0,
            peer_initial_max_stream_data_uni: 0,
        }
    }

    /// Applies the peer's transport parameters once known
    pub fn on_peer_parameters(
        &mut self,
        max_streams_bidi: u64,
        max_streams_uni: u64,
        initial_max_stream_data_bidi: u64,
        initial_max_stream_data_uni: u64,
    ) -> Vec<StreamId> {
        self.peer_initial_max_stream_data_bidi = initial_max_stream_data_bidi;
        self.peer_initial_max_stream_data_uni = initial_max_stream_data_uni;

        let mut released = self.on_peer_max_streams(StreamType::Bidirectional, max_streams_bidi);
        released.extend(self.on_peer_max_streams(StreamType::Unidirectional, max_streams_uni));
        released
    }

    #[inline]
    pub fn counts(&self, initiator: endpoint::Type, stream_type: StreamType) -> &TypeCounts {
        &self.types[type_index_for(initiator, stream_type)]
    }

    #[inline]
    fn recv_window(&self, stream_type: StreamType) -> u64 {
        match stream_type {
            StreamType::Bidirectional => self.recv_window_bidi,
            StreamType::Unidirectional => self.recv_window_uni,
        }
    }

    #[inline]
    fn peer_initial_allowance(&self, stream_type: StreamType) -> u64 {
        match stream_type {
            StreamType::Bidirectional => self.peer_initial_max_stream_data_bidi,
            StreamType::Unidirectional => self.peer_initial_max_stream_data_uni,
        }
    }

    #[inline]
    fn dir_index(stream_type: StreamType) -> usize {
        match stream_type {
            StreamType::Bidirectional => 0,
            StreamType::Unidirectional => 1,
        }
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams
            .get_mut(&id.as_varint().as_u64())
            .or_else(|| self.waiting.get_mut(&id.as_varint().as_u64()))
    }

    #[inline]
    pub fn is_closed(&self, id: StreamId) -> bool {
        self.closed.contains(&id)
    }

    /// Opens a locally initiated stream.
    ///
    /// When the peer's limit blocks it and `fail_on_blocked` is unset,
    /// the stream is queued and usable for writes; it transmits once
    /// the peer raises MAX_STREAMS.
    pub fn open_local(
        &mut self,
        stream_type: StreamType,
        fail_on_blocked: bool,
    ) -> Result<(StreamId, OpenStatus), ApiError> {
        let index = type_index_for(self.role, stream_type);
        let counts = &mut self.types[index];

        let id = StreamId::nth(self.role, stream_type, counts.total)
            .ok_or(ApiError::InvalidState)?;

        let blocked = counts.total >= counts.max_from_peer;
        if blocked && fail_on_blocked {
            return Err(ApiError::StreamLimitReached);
        }

        counts.total += 1;
        counts.current += 1;

        let stream = Stream::new(
            id,
            self.role,
            self.peer_initial_allowance(stream_type),
            self.recv_window(stream_type),
        );

        if blocked {
            self.waiting.insert(id.as_varint().as_u64(), stream);
            self.pending_streams_blocked[Self::dir_index(stream_type)] =
                Some(self.types[index].max_from_peer);
            Ok((id, OpenStatus::Queued))
        } else {
            self.streams.insert(id.as_varint().as_u64(), stream);
            Ok((id, OpenStatus::Opened))
        }
    }

    /// Raises the peer's limit on our stream opens; waiting streams
    /// move into the main table lowest-ID first and are reported so
    /// the application sees them accepted.
    pub fn on_peer_max_streams(&mut self, stream_type: StreamType, maximum: u64) -> Vec<StreamId> {
        let index = type_index_for(self.role, stream_type);
        if maximum <= self.types[index].max_from_peer {
            return Vec::new();
        }
        self.types[index].max_from_peer = maximum;
        self.pending_streams_blocked[Self::dir_index(stream_type)] = None;

        let mut released = Vec::new();
        let ids: Vec<u64> = self.waiting.keys().copied().collect();
        for raw in ids {
            let id = StreamId::from_varint(VarInt::new(raw).expect("ids are valid varints"));
            if id.stream_type() != stream_type {
                continue;
            }
            if id.ordinal() >= maximum {
                break;
            }
            let stream = self.waiting.remove(&raw).expect("id taken from the map");
            self.streams.insert(raw, stream);
            released.push(id);
        }
        released
    }

    /// Resolves a peer-referenced stream ID, auto-creating every lower
    /// stream of the same type per the implicit-creation rule.
    pub fn get_or_create_peer(&mut self, id: StreamId) -> Result<PeerStream<'_>, Error> {
        let raw = id.as_varint().as_u64();

        if id.initiator() == self.role {
            // the peer referenced one of our streams
            let index = type_index(id);
            if id.ordinal() >= self.types[index].total {
                // the peer invented a stream only we could have opened
                return Err(Error::new(Error::PROTOCOL_VIOLATION)
                    .with_reason("frame references an unopened local stream"));
            }
            if self.streams.contains_key(&raw) || self.waiting.contains_key(&raw) {
                return Ok(PeerStream::Stream(
                    self.get_mut(id).expect("presence just checked"),
                    Vec::new(),
                ));
            }
            return Ok(PeerStream::Closed);
        }

        let index = type_index(id);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
        //# An endpoint that receives a frame with a stream ID exceeding
        //# the limit it has sent MUST treat this as a connection error of
        //# type STREAM_LIMIT_ERROR
        if id.ordinal() >= self.types[index].max_announced {
            return Err(Error::new(Error::STREAM_LIMIT_ERROR));
        }

        if self.streams.contains_key(&raw) {
            return Ok(PeerStream::Stream(
                self.streams.get_mut(&raw).expect("presence just checked"),
                Vec::new(),
            ));
        }
        if self.is_closed(id) {
            return Ok(PeerStream::Closed);
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-3.2
        //# Before a stream is created, all streams of the same type with
        //# lower-numbered stream IDs MUST be created.
        let mut created = Vec::new();
        let first_new = self.types[index].total;
        for ordinal in first_new..=id.ordinal() {
            let new_id = StreamId::nth(id.initiator(), id.stream_type(), ordinal)
                .ok_or_else(|| Error::new(Error::INTERNAL_ERROR))?;
            let stream = Stream::new(
                new_id,
                self.role,
                self.peer_initial_allowance(new_id.stream_type()),
                self.recv_window(new_id.stream_type()),
            );
            self.streams.insert(new_id.as_varint().as_u64(), stream);
            self.types[index].total += 1;
            self.types[index].current += 1;
            created.push(new_id);
        }

        Ok(PeerStream::Stream(
            self.streams.get_mut(&raw).expect("just created"),
            created,
        ))
    }

    /// Queues a stream for the send engine if it has work and is not
    /// already queued
    pub fn enqueue_for_send(&mut self, id: StreamId) {
        if let Some(stream) = self.get_mut(id) {
            if stream.has_send_work() && !stream.in_send_queue {
                stream.in_send_queue = true;
                self.send_queue.push_back(id);
            }
        }
    }

    /// Pops the next sendable stream ID; skips since-gone entries
    pub fn next_send_stream(&mut self) -> Option<StreamId> {
        while let Some(id) = self.send_queue.pop_front() {
            // waiting streams transmit nothing until released
            if self.waiting.contains_key(&id.as_varint().as_u64()) {
                if let Some(stream) = self.waiting.get_mut(&id.as_varint().as_u64()) {
                    stream.in_send_queue = false;
                }
                continue;
            }
            if let Some(stream) = self.streams.get_mut(&id.as_varint().as_u64()) {
                stream.in_send_queue = false;
                return Some(id);
            }
        }
        None
    }

    /// Retires a stream whose halves both reached a terminal state.
    ///
    /// Returns true when the stream was peer-initiated and its slot
    /// replenishes the announced budget.
    pub fn on_stream_terminal(&mut self, id: StreamId) -> bool {
        let raw = id.as_varint().as_u64();
        let Some(stream) = self.streams.get(&raw) else {
            return false;
        };
        if !stream.is_terminal() {
            return false;
        }

        self.streams.remove(&raw);
        self.closed.push(id);
        let index = type_index(id);
        self.types[index].current = self.types[index].current.saturating_sub(1);

        if id.initiator() != self.role {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
            //# endpoints SHOULD increase limits as streams are closed
            self.types[index].max_announced += 1;
            self.pending_max_streams[Self::dir_index(id.stream_type())] = true;
            return true;
        }
        false
    }

    /// The limit to announce in a MAX_STREAMS frame
    pub fn max_streams_to_announce(&self, stream_type: StreamType) -> u64 {
        let peer = self.role.peer_type();
        self.counts(peer, stream_type).max_announced
    }

    /// Every open stream ID, for close/teardown sweeps
    pub fn ids(&self) -> Vec<StreamId> {
        self.streams
            .keys()
            .chain(self.waiting.keys())
            .map(|raw| StreamId::from_varint(VarInt::new(*raw).expect("ids are valid varints")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_set() -> StreamSet {
        // the server lets the peer open 2 bidi / 1 uni streams
        StreamSet::new(endpoint::Type::Server, 2, 1, 1 << 16, 1 << 16)
    }

    fn client_set() -> StreamSet {
        StreamSet::new(endpoint::Type::Client, 2, 1, 1 << 16, 1 << 16)
    }

    fn id(raw: u64) -> StreamId {
        StreamId::from_varint(VarInt::new(raw).unwrap())
    }

    #[test]
    fn local_open_respects_peer_limit() {
        let mut set = client_set();
        set.on_peer_parameters(2, 0, 1000, 1000);

        let (first, status) = set.open_local(StreamType::Bidirectional, false).unwrap();
        assert_eq!(first, id(0));
        assert_eq!(status, OpenStatus::Opened);

        let (second, status) = set.open_local(StreamType::Bidirectional, false).unwrap();
        assert_eq!(second, id(4));
        assert_eq!(status, OpenStatus::Opened);

        // limit reached: fail-fast flavor
        assert_eq!(
            set.open_local(StreamType::Bidirectional, true).unwrap_err(),
            ApiError::StreamLimitReached
        );

        // queued flavor
        let (third, status) = set.open_local(StreamType::Bidirectional, false).unwrap();
        assert_eq!(third, id(8));
        assert_eq!(status, OpenStatus::Queued);
        assert_eq!(set.pending_streams_blocked[0], Some(2));

        // the peer raises the limit; the waiting stream is released
        let released = set.on_peer_max_streams(StreamType::Bidirectional, 3);
        assert_eq!(released, vec![id(8)]);
        assert_eq!(set.pending_streams_blocked[0], None);
    }

    #[test]
    fn peer_streams_auto_create_lower_ids() {
        let mut set = server_set();

        // client bidi stream 4 (ordinal 1) arrives first
        let PeerStream::Stream(stream, created) = set.get_or_create_peer(id(4)).unwrap() else {
            panic!("expected a stream");
        };
        assert_eq!(stream.id, id(4));
        assert_eq!(created, vec![id(0), id(4)]);

        let counts = set.counts(endpoint::Type::Client, StreamType::Bidirectional);
        assert_eq!(counts.current, 2);
        assert_eq!(counts.total, 2);
    }

    #[test]
    fn stream_limit_violation() {
        // scenario: limit 2 admits stream IDs 0 and 4; ID 8 errors
        let mut set = server_set();
        assert!(set.get_or_create_peer(id(0)).is_ok());
        assert!(set.get_or_create_peer(id(4)).is_ok());

        let error = set.get_or_create_peer(id(8)).unwrap_err();
        assert_eq!(error.code, Error::STREAM_LIMIT_ERROR);
    }

    #[test]
    fn unopened_local_stream_reference() {
        let mut set = server_set();
        // the client claims our server-bidi stream 1 exists
        let error = set.get_or_create_peer(id(1)).unwrap_err();
        assert_eq!(error.code, Error::PROTOCOL_VIOLATION);
    }

    #[test]
    fn terminal_streams_replenish_budget() {
        let mut set = server_set();
        let PeerStream::Stream(stream, _) = set.get_or_create_peer(id(2)).unwrap() else {
            panic!("expected a stream");
        };
        // client uni stream: drive the receive half to terminal
        stream.on_stream_frame(0, b"x", true).unwrap();
        let mut out = [0u8; 4];
        stream.read(&mut out).unwrap();
        assert!(stream.is_terminal());

        assert!(set.on_stream_terminal(id(2)));
        assert!(set.pending_max_streams[1]);
        assert_eq!(set.max_streams_to_announce(StreamType::Unidirectional), 2);
        assert!(set.is_closed(id(2)));

        // stale frames for the closed stream resolve to Closed
        assert!(matches!(
            set.get_or_create_peer(id(2)).unwrap(),
            PeerStream::Closed
        ));
    }

    #[test]
    fn send_queue_dedup() {
        let mut set = client_set();
        set.on_peer_parameters(4, 4, 1000, 1000);
        let (id0, _) = set.open_local(StreamType::Bidirectional, false).unwrap();

        set.get_mut(id0).unwrap().write(b"data", false).unwrap();
        set.enqueue_for_send(id0);
        set.enqueue_for_send(id0);
        assert_eq!(set.send_queue.len(), 1);

        assert_eq!(set.next_send_stream(), Some(id0));
        assert_eq!(set.next_send_stream(), None);
    }
}
