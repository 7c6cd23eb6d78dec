// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The send engine: pending-work flags, the flush state machine, and
//! the packet builder.
//!
//! A flush builds at most `max_send_batch_size` datagrams, coalescing
//! one packet per keyed encryption level into each. Control frames
//! outrank stream data; a PMTU probe runs last. Congestion control
//! gates everything except pure ACKs, PATH_RESPONSE and
//! CONNECTION_CLOSE; pacing spreads the rest.

use crate::{
    connection::{Connection, State, TimerKind},
    datapath::Datagram,
    space::{SentFrame, SentPacketInfo},
    tls::Level,
};
use quill_core::{
    crypto::{self, key::TAG_LEN},
    event as core_event,
    frame,
    inet::ExplicitCongestionNotification,
    packet::{
        long::LongHeaderBuilder,
        number::PacketNumber,
        short::ShortHeaderBuilder,
        PacketType, VERSION_V1,
    },
    stream::StreamType,
    time::Timestamp,
    varint::VarInt,
};
use s2n_codec::{Encoder, EncoderBuffer, EncoderValue};
use smallvec::SmallVec;

pub mod flags {
    pub const ACK: u32 = 1 << 0;
    pub const CONNECTION_CLOSE: u32 = 1 << 1;
    pub const APPLICATION_CLOSE: u32 = 1 << 2;
    pub const MAX_DATA: u32 = 1 << 3;
    pub const DATA_BLOCKED: u32 = 1 << 4;
    pub const MAX_STREAMS_BIDI: u32 = 1 << 5;
    pub const MAX_STREAMS_UNI: u32 = 1 << 6;
    pub const NEW_CONNECTION_ID: u32 = 1 << 7;
    pub const RETIRE_CONNECTION_ID: u32 = 1 << 8;
    pub const PATH_CHALLENGE: u32 = 1 << 9;
    pub const PATH_RESPONSE: u32 = 1 << 10;
    pub const PING: u32 = 1 << 11;
    pub const PMTUD: u32 = 1 << 12;
    pub const HANDSHAKE_DONE: u32 = 1 << 13;
    pub const STREAMS_BLOCKED_BIDI: u32 = 1 << 14;
    pub const STREAMS_BLOCKED_UNI: u32 = 1 << 15;

    /// Work that may leave even when congestion control is blocked
    pub const CC_BYPASS: u32 = ACK | CONNECTION_CLOSE | APPLICATION_CLOSE | PATH_RESPONSE;
}

/// One bit per frame kind pending at connection scope
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendFlags(u32);

impl SendFlags {
    #[inline]
    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    #[inline]
    pub fn clear(&mut self, flag: u32) {
        self.0 &= !flag;
    }

    #[inline]
    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True when nothing outside the congestion-control bypass set is
    /// pending
    #[inline]
    pub fn only_bypassable(&self) -> bool {
        self.0 & !flags::CC_BYPASS == 0
    }
}

/// Why the flush stopped early
pub mod blocked {
    pub const SCHEDULING: u8 = 1 << 0;
    pub const AMP_PROTECTION: u8 = 1 << 1;
    pub const CONGESTION: u8 = 1 << 2;
    pub const PACING: u8 = 1 << 3;
}

#[derive(Default)]
pub struct SendState {
    pub flags: SendFlags,
    pub flush_pending: bool,
    pub blocked_reasons: u8,
}

impl SendState {
    #[inline]
    pub fn request_flush(&mut self) {
        self.flush_pending = true;
    }

    #[inline]
    pub fn take_flush_request(&mut self) -> bool {
        core::mem::take(&mut self.flush_pending)
    }

    #[inline]
    pub fn mark_blocked(&mut self, reason: u8) {
        self.blocked_reasons |= reason;
    }

    #[inline]
    pub fn clear_blocked(&mut self, reason: u8) {
        self.blocked_reasons &= !reason;
    }

    #[inline]
    pub fn clear_pacing_block(&mut self) {
        self.clear_blocked(blocked::PACING);
    }
}

/// Floor under the amplification allowance below which building a
/// datagram is pointless
const MIN_USEFUL_DATAGRAM: u64 = 64;

//= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
//# A client MUST expand the payload of all UDP datagrams carrying
//# Initial packets to at least the smallest allowed maximum datagram
//# size of 1200 bytes
const INITIAL_DATAGRAM_MIN: usize = 1200;

struct BuiltPacket {
    end: usize,
}

impl Connection {
    /// Runs one send flush, returning the datagrams to hand to the
    /// datapath
    pub fn process_flush_send(&mut self, now: Timestamp) -> Vec<Datagram> {
        self.send.clear_blocked(blocked::SCHEDULING);
        self.send.flush_pending = false;

        if self.state == State::Closed || self.state == State::ClosingRemotely {
            // draining: nothing is transmitted
            return Vec::new();
        }

        let mtu = self.active_path().mtu as usize;
        let mut datagrams: Vec<Datagram> = Vec::new();

        loop {
            if datagrams.len() >= self.settings.max_send_batch_size {
                if !self.pending_levels().is_empty() {
                    // resume in a later flush rather than starve peers
                    self.send.mark_blocked(blocked::SCHEDULING);
                    self.send.request_flush();
                }
                break;
            }

            let levels = self.pending_levels();
            if levels.is_empty() {
                break;
            }

            //= https://www.rfc-editor.org/rfc/rfc9000#section-8
            //# an endpoint MUST limit the amount of data it sends to the
            //# unvalidated address
            let allowance = self.active_path().amplification_allowance();
            if allowance < MIN_USEFUL_DATAGRAM {
                self.send.mark_blocked(blocked::AMP_PROTECTION);
                break;
            }

            let bypass_only = self.only_bypassable_work();
            if !bypass_only {
                if self.active_path().congestion.is_blocked() {
                    self.send.mark_blocked(blocked::CONGESTION);
                    break;
                }
                if self.settings.pacing_enabled && self.active_path().rtt.has_sample() {
                    let (cwnd, srtt) = {
                        let path = self.active_path();
                        (path.congestion.congestion_window(), path.rtt.smoothed())
                    };
                    let delay = self.paths[self.active_path]
                        .pacer
                        .on_datagram(now, mtu, cwnd, srtt);
                    if let Some(delay) = delay {
                        self.set_timer(TimerKind::Pacing, now + delay);
                        self.send.mark_blocked(blocked::PACING);
                        break;
                    }
                }
            }

            let capacity = mtu.min(allowance as usize);
            match self.build_datagram(&levels, capacity, now) {
                Some(datagram) => {
                    self.active_path_mut().on_bytes_sent(datagram.payload.len());
                    datagrams.push(datagram);
                }
                None => break,
            }
        }

        // per-level trackers decide future ACKs; the one-shot flag is
        // consumed by this flush
        self.send.flags.clear(flags::ACK);
        self.rearm_loss_timer(now);
        datagrams
    }

    /// The encryption levels with both keys and pending work, in send
    /// order
    fn pending_levels(&self) -> Vec<Level> {
        let mut levels = Vec::with_capacity(Level::COUNT);
        for level in Level::all() {
            if self.level_has_work(level) {
                levels.push(level);
            }
        }
        levels
    }

    fn level_keyed(&self, level: Level) -> bool {
        match level {
            Level::Initial => self.initial_keys.is_some(),
            Level::Handshake => self.handshake_keys.is_some(),
            Level::OneRtt => self.one_rtt_keys.is_some(),
        }
    }

    fn level_has_work(&self, level: Level) -> bool {
        if !self.level_keyed(level) {
            return false;
        }
        let space = &self.spaces[level.as_index()];
        if space.discarded {
            return false;
        }

        let close_pending = self.close.is_some()
            && self
                .send
                .flags
                .contains(flags::CONNECTION_CLOSE | flags::APPLICATION_CLOSE);

        // while closing, the only transmittable frame is the close
        if self.state == State::ClosingLocally {
            return close_pending && (level != Level::OneRtt || self.handshake_complete);
        }

        let acks_due = space.ack_tracker.ack_immediately()
            || (self.send.flags.contains(flags::ACK) && space.ack_tracker.has_packets_to_ack());

        match level {
            Level::Initial | Level::Handshake => {
                space.crypto_tx.has_pending() || acks_due || close_pending
            }
            Level::OneRtt => {
                if !self.handshake_complete {
                    return false;
                }
                space.crypto_tx.has_pending()
                    || acks_due
                    || close_pending
                    || !self.streams.send_queue.is_empty()
                    || !(self.send.flags.is_empty())
            }
        }
    }

    fn only_bypassable_work(&self) -> bool {
        if !self.send.flags.only_bypassable() {
            return false;
        }
        if !self.streams.send_queue.is_empty() {
            return false;
        }
        self.spaces
            .iter()
            .all(|space| space.discarded || !space.crypto_tx.has_pending())
    }

    /// Builds one datagram coalescing a packet per pending level
    fn build_datagram(&mut self, levels: &[Level], capacity: usize, now: Timestamp) -> Option<Datagram> {
        let mut payload = vec![0u8; capacity];
        let mut end = 0usize;
        let contains_initial = levels.contains(&Level::Initial);

        for (position, level) in levels.iter().enumerate() {
            let is_last = position == levels.len() - 1;
            match self.build_packet(*level, &mut payload, end, contains_initial && is_last, now) {
                Some(built) => {
                    end = built.end;
                }
                None => continue,
            }
        }

        if end == 0 {
            return None;
        }
        payload.truncate(end);

        let path = self.active_path();
        Some(Datagram {
            local: path.local,
            remote: path.remote,
            ecn: ExplicitCongestionNotification::NotEct,
            payload,
        })
    }

    /// Builds, protects and records a single packet at `level`
    fn build_packet(
        &mut self,
        level: Level,
        buffer: &mut [u8],
        start: usize,
        pad_for_initial: bool,
        now: Timestamp,
    ) -> Option<BuiltPacket> {
        let space_index = level.as_index();
        let pn_u64 = self.spaces[space_index].next_packet_number;
        let pn = PacketNumber::new(pn_u64)?;
        let largest_acked = self.spaces[space_index]
            .largest_acked
            .and_then(PacketNumber::new);
        let truncated = pn.truncate(largest_acked);

        let dcid = *self.cids.active_peer_cid();
        let scid = self.local_cid_for_headers();

        let mut encoder = EncoderBuffer::new(buffer);
        encoder.set_position(start);

        // room for a worst-case header (token included), one frame and
        // the tag before anything is attempted
        let token_len = if level == Level::Initial {
            self.retry_token.len()
        } else {
            0
        };
        if encoder.remaining_capacity() < 64 + token_len + TAG_LEN {
            return None;
        }

        let (pn_offset, pn_len, long_mark) = match level {
            Level::OneRtt => {
                let keys = self.one_rtt_keys.as_ref().expect("keyed level");
                let builder = ShortHeaderBuilder {
                    dcid: &dcid,
                    spin_bit: false,
                    key_phase: keys.key_phase(),
                };
                let mark = builder.encode(&mut encoder, truncated);
                (mark.pn_offset, mark.pn_len, None)
            }
            _ => {
                let packet_type = if level == Level::Initial {
                    PacketType::Initial
                } else {
                    PacketType::Handshake
                };
                let token = if level == Level::Initial {
                    self.retry_token.clone()
                } else {
                    Vec::new()
                };
                let builder = LongHeaderBuilder {
                    packet_type,
                    version: VERSION_V1,
                    dcid: &dcid,
                    scid: &scid,
                    token: &token,
                };
                let mark = builder.encode(&mut encoder, truncated);
                (mark.pn_offset, mark.pn_len, Some(mark))
            }
        };

        let (records, ack_eliciting) = self.write_frames(level, &mut encoder, now);
        if records.is_empty() {
            // nothing fit or nothing was actually pending; rewind
            return None;
        }

        //= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.2
        //# in sampling packet ciphertext for header protection, the
        //# Packet Number field is assumed to be 4 bytes long
        // guarantee enough ciphertext for the sample
        let min_payload = pn_offset + 4 + crypto::HP_SAMPLE_LEN - TAG_LEN;
        if encoder.len() < min_payload {
            let missing = min_payload - encoder.len();
            encoder.write_repeated(missing, 0);
        }

        if pad_for_initial && encoder.len() < INITIAL_DATAGRAM_MIN - TAG_LEN {
            let missing = (INITIAL_DATAGRAM_MIN - TAG_LEN - encoder.len())
                .min(encoder.remaining_capacity().saturating_sub(TAG_LEN));
            encoder.write_repeated(missing, 0);
        }

        if let Some(mark) = long_mark {
            mark.finish(&mut encoder, TAG_LEN);
        }
        encoder.write_repeated(TAG_LEN, 0);
        let end = encoder.len();

        // protect in place
        let packet = &mut buffer[start..end];
        let rel_pn_offset = pn_offset - start;
        let header_end = rel_pn_offset + pn_len;
        {
            let (header, packet_payload) = packet.split_at_mut(header_end);
            match level {
                Level::Initial => {
                    let keys = self.initial_keys.as_ref().expect("keyed level");
                    keys.sealer.seal_in_place(pn, header, packet_payload).ok()?;
                }
                Level::Handshake => {
                    let keys = self.handshake_keys.as_ref().expect("keyed level");
                    keys.sealer.seal_in_place(pn, header, packet_payload).ok()?;
                }
                Level::OneRtt => {
                    let keys = self.one_rtt_keys.as_ref().expect("keyed level");
                    keys.sealer().seal_in_place(pn, header, packet_payload).ok()?;
                }
            }
        }
        {
            let hp = match level {
                Level::Initial => &self.initial_keys.as_ref().expect("keyed level").sealer_hp,
                Level::Handshake => &self.handshake_keys.as_ref().expect("keyed level").sealer_hp,
                Level::OneRtt => self.one_rtt_keys.as_ref().expect("keyed level").sealer_hp(),
            };
            crypto::apply_header_protection(packet, rel_pn_offset, truncated.len(), hp).ok()?;
        }

        // commit
        self.spaces[space_index].next_packet_number += 1;
        let bytes = (end - start) as u16;
        self.counters.packets_sent += 1;
        self.emit(
            now,
            core_event::Event::PacketSent(core_event::PacketSent {
                space: level.space(),
                packet_number: pn_u64,
                bytes: bytes as usize,
                is_ack_eliciting: ack_eliciting,
            }),
        );

        // close packets are tracked (so an ACK ends draining early)
        // without counting as in flight
        let carries_close = records
            .iter()
            .any(|frame| matches!(frame, SentFrame::ConnectionClose));
        if ack_eliciting || carries_close {
            self.spaces[space_index].sent.insert(SentPacketInfo {
                packet_number: pn_u64,
                bytes,
                time_sent: now,
                ack_eliciting,
                in_flight: ack_eliciting,
                is_mtu_probe: false,
                frames: records,
            });
        }
        if ack_eliciting {
            self.paths[self.active_path]
                .congestion
                .on_packet_sent(bytes as usize);
            self.arm_idle_timer(now);
        }

        Some(BuiltPacket { end })
    }

    /// The source CID to put in long headers
    fn local_cid_for_headers(&self) -> quill_core::connection::ConnectionId {
        self.cids.local_cids()[0].cid
    }

    /// Writes frames into the packet by priority; returns the records
    /// and the ack-eliciting bit
    fn write_frames(
        &mut self,
        level: Level,
        encoder: &mut EncoderBuffer,
        now: Timestamp,
    ) -> (SmallVec<[SentFrame; 4]>, bool) {
        let mut records: SmallVec<[SentFrame; 4]> = SmallVec::new();
        let mut ack_eliciting = false;

        macro_rules! room {
            () => {
                encoder.remaining_capacity().saturating_sub(TAG_LEN)
            };
        }
        macro_rules! try_encode {
            ($frame:expr, $record:expr) => {{
                let frame = $frame;
                if frame.encoding_size() <= room!() {
                    encoder.encode(&frame);
                    records.push($record);
                    true
                } else {
                    false
                }
            }};
        }

        let space_index = level.as_index();

        // 1. ACK
        let acks_due = {
            let tracker = &self.spaces[space_index].ack_tracker;
            tracker.ack_immediately()
                || (self.send.flags.contains(flags::ACK) && tracker.has_packets_to_ack())
        };
        if acks_due {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.5
            //# The ACK Delay field is ... encoded using the
            //# ack_delay_exponent
            let exponent = self.local_params.ack_delay_exponent;
            let delay = self.spaces[space_index].ack_tracker.ack_delay(now);
            let delay = VarInt::new((delay.as_micros() as u64) >> exponent).unwrap_or(VarInt::MAX);
            let largest = self.spaces[space_index]
                .ack_tracker
                .largest_received()
                .map(|(pn, _)| pn)
                .unwrap_or(0);
            let encoded = {
                let tracker = &self.spaces[space_index].ack_tracker;
                let ack = frame::Ack {
                    ack_delay: delay,
                    ack_ranges: frame::ack::RangeSetAckRanges(tracker.ranges()),
                    ecn_counts: None,
                };
                if ack.encoding_size() <= room!() {
                    encoder.encode(&ack);
                    true
                } else {
                    false
                }
            };
            if encoded {
                records.push(SentFrame::Ack { largest });
                self.spaces[space_index].ack_tracker.on_ack_sent();
                self.cancel_timer(TimerKind::AckDelay);
            }
        }

        // 2. CRYPTO
        loop {
            let Some((offset, chunk)) = ({
                let crypto_tx = &self.spaces[space_index].crypto_tx;
                let room = room!();
                crypto_tx.next_chunk(room).and_then(|(offset, chunk)| {
                    let frame = frame::Crypto {
                        offset: VarInt::new(offset).ok()?,
                        data: chunk,
                    };
                    let take = frame.max_data_for_capacity(room)?;
                    if take == 0 {
                        return None;
                    }
                    Some((offset, chunk[..take].to_vec()))
                })
            }) else {
                break;
            };

            let frame = frame::Crypto {
                offset: VarInt::new(offset).expect("offsets fit a varint"),
                data: &chunk,
            };
            encoder.encode(&frame);
            records.push(SentFrame::Crypto {
                offset,
                len: chunk.len() as u64,
            });
            self.spaces[space_index]
                .crypto_tx
                .on_chunk_sent(offset, chunk.len());
            ack_eliciting = true;
        }

        // 3. CONNECTION_CLOSE is terminal for the packet
        if self
            .send
            .flags
            .contains(flags::CONNECTION_CLOSE | flags::APPLICATION_CLOSE)
        {
            if let Some(close) = self.close.clone() {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2.3
                //# A CONNECTION_CLOSE of type 0x1d MUST be replaced by a
                //# CONNECTION_CLOSE of type 0x1c when sending the frame in
                //# Initial or Handshake packets.
                let frame = if close.is_application && level != Level::OneRtt {
                    frame::ConnectionClose {
                        error_code: quill_core::transport::Error::APPLICATION_ERROR,
                        frame_type: Some(VarInt::ZERO),
                        reason: None,
                    }
                } else {
                    frame::ConnectionClose {
                        error_code: close.error_code,
                        frame_type: if close.is_application {
                            None
                        } else {
                            Some(close.frame_type.unwrap_or(VarInt::ZERO))
                        },
                        reason: if close.reason.is_empty() {
                            None
                        } else {
                            Some(&close.reason)
                        },
                    }
                };
                if frame.encoding_size() <= room!() {
                    encoder.encode(&frame);
                    records.push(SentFrame::ConnectionClose);
                    if self.is_last_close_level(level) {
                        self.send.flags.clear(flags::CONNECTION_CLOSE);
                        self.send.flags.clear(flags::APPLICATION_CLOSE);
                    }
                }
                return (records, false);
            }
        }

        if level != Level::OneRtt {
            return (records, ack_eliciting);
        }

        // 4. path maintenance
        if self.send.flags.contains(flags::PATH_CHALLENGE) {
            if let Some(data) = self.active_path().challenge_data() {
                if try_encode!(frame::PathChallenge { data }, SentFrame::PathChallenge) {
                    self.send.flags.clear(flags::PATH_CHALLENGE);
                    ack_eliciting = true;
                }
            } else {
                self.send.flags.clear(flags::PATH_CHALLENGE);
            }
        }
        if self.send.flags.contains(flags::PATH_RESPONSE) {
            if let Some(data) = self.active_path_mut().pending_response.take() {
                if try_encode!(frame::PathResponse { data }, SentFrame::PathResponse) {
                    self.send.flags.clear(flags::PATH_RESPONSE);
                    ack_eliciting = true;
                } else {
                    self.active_path_mut().pending_response = Some(data);
                }
            } else {
                self.send.flags.clear(flags::PATH_RESPONSE);
            }
        }

        // 5. connection-scope control frames
        if self.send.flags.contains(flags::DATA_BLOCKED) {
            if let Some(limit) = self.flow.tx_blocked_at {
                let frame = frame::DataBlocked {
                    data_limit: VarInt::new(limit).unwrap_or(VarInt::MAX),
                };
                if try_encode!(frame, SentFrame::DataBlocked) {
                    self.send.flags.clear(flags::DATA_BLOCKED);
                    ack_eliciting = true;
                }
            } else {
                self.send.flags.clear(flags::DATA_BLOCKED);
            }
        }

        if self.send.flags.contains(flags::MAX_DATA) && self.flow.pending_max_data {
            let limit = self.flow.next_max_data();
            let frame = frame::MaxData {
                maximum_data: VarInt::new(limit).unwrap_or(VarInt::MAX),
            };
            if try_encode!(frame, SentFrame::MaxData) {
                self.flow.on_max_data_sent(limit);
                self.send.flags.clear(flags::MAX_DATA);
                ack_eliciting = true;
            }
        } else if self.send.flags.contains(flags::MAX_DATA) {
            self.send.flags.clear(flags::MAX_DATA);
        }

        for (flag, stream_type) in [
            (flags::MAX_STREAMS_BIDI, StreamType::Bidirectional),
            (flags::MAX_STREAMS_UNI, StreamType::Unidirectional),
        ] {
            if !self.send.flags.contains(flag) {
                continue;
            }
            let maximum = self.streams.max_streams_to_announce(stream_type);
            let frame = frame::MaxStreams {
                stream_type,
                maximum_streams: VarInt::new(maximum).unwrap_or(VarInt::MAX),
            };
            if try_encode!(frame, SentFrame::MaxStreams { stream_type }) {
                self.streams.pending_max_streams
                    [if stream_type.is_bidirectional() { 0 } else { 1 }] = false;
                self.send.flags.clear(flag);
                ack_eliciting = true;
            }
        }

        // 6. connection ID maintenance
        if self.send.flags.contains(flags::NEW_CONNECTION_ID) || self
            .cids
            .locals_needing_transmit()
            .next()
            .is_some()
        {
            let pending: Vec<(u64, quill_core::connection::ConnectionId, quill_core::stateless_reset::Token)> = self
                .cids
                .locals_needing_transmit()
                .map(|local| (local.sequence, local.cid, local.reset_token))
                .collect();
            let mut all_sent = true;
            for (sequence, cid, token) in pending {
                let frame = frame::NewConnectionId {
                    sequence_number: VarInt::new(sequence).unwrap_or(VarInt::MAX),
                    retire_prior_to: VarInt::ZERO,
                    connection_id: cid,
                    stateless_reset_token: token,
                };
                if try_encode!(frame, SentFrame::NewConnectionId { sequence }) {
                    self.cids.on_new_cid_frame_sent(sequence);
                    ack_eliciting = true;
                } else {
                    all_sent = false;
                    break;
                }
            }
            if all_sent {
                self.send.flags.clear(flags::NEW_CONNECTION_ID);
            }
        }

        if self.send.flags.contains(flags::RETIRE_CONNECTION_ID) || self
            .cids
            .retirements_needing_transmit()
            .next()
            .is_some()
        {
            let pending: Vec<u64> = self.cids.retirements_needing_transmit().collect();
            let mut all_sent = true;
            for sequence in pending {
                let frame = frame::RetireConnectionId {
                    sequence_number: VarInt::new(sequence).unwrap_or(VarInt::MAX),
                };
                if try_encode!(frame, SentFrame::RetireConnectionId { sequence }) {
                    self.cids.on_retire_frame_sent(sequence);
                    ack_eliciting = true;
                } else {
                    all_sent = false;
                    break;
                }
            }
            if all_sent {
                self.send.flags.clear(flags::RETIRE_CONNECTION_ID);
            }
        }

        for (flag, stream_type) in [
            (flags::STREAMS_BLOCKED_BIDI, StreamType::Bidirectional),
            (flags::STREAMS_BLOCKED_UNI, StreamType::Unidirectional),
        ] {
            if !self.send.flags.contains(flag) {
                continue;
            }
            let index = if stream_type.is_bidirectional() { 0 } else { 1 };
            if let Some(limit) = self.streams.pending_streams_blocked[index] {
                let frame = frame::StreamsBlocked {
                    stream_type,
                    stream_limit: VarInt::new(limit).unwrap_or(VarInt::MAX),
                };
                if try_encode!(frame, SentFrame::StreamsBlocked { stream_type }) {
                    self.streams.pending_streams_blocked[index] = None;
                    self.send.flags.clear(flag);
                    ack_eliciting = true;
                }
            } else {
                self.send.flags.clear(flag);
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.20
        //# The server MUST NOT send a HANDSHAKE_DONE frame before
        //# completing the handshake.
        if self.send.flags.contains(flags::HANDSHAKE_DONE) && self.role.is_server() {
            if try_encode!(frame::HandshakeDone, SentFrame::HandshakeDone) {
                self.send.flags.clear(flags::HANDSHAKE_DONE);
                ack_eliciting = true;
            }
        }

        // 7. stream control frames and data
        ack_eliciting |= self.write_stream_frames(encoder, &mut records);

        // 8. PING last: a probe only when nothing else elicited
        if self.send.flags.contains(flags::PING) {
            if !ack_eliciting {
                if try_encode!(frame::Ping, SentFrame::Ping) {
                    self.send.flags.clear(flags::PING);
                    ack_eliciting = true;
                }
            } else {
                self.send.flags.clear(flags::PING);
            }
        }

        (records, ack_eliciting)
    }

    /// True when no sendable level after `current` still owes a
    /// CONNECTION_CLOSE copy
    fn is_last_close_level(&self, current: Level) -> bool {
        Level::all().into_iter().filter(|level| *level > current).all(|level| {
            !self.level_keyed(level) || (level == Level::OneRtt && !self.handshake_complete)
        })
    }

    fn write_stream_frames(
        &mut self,
        encoder: &mut EncoderBuffer,
        records: &mut SmallVec<[SentFrame; 4]>,
    ) -> bool {
        let mut ack_eliciting = false;

        macro_rules! room {
            () => {
                encoder.remaining_capacity().saturating_sub(TAG_LEN)
            };
        }

        let mut deferred: Vec<quill_core::stream::StreamId> = Vec::new();

        while room!() > 4 {
            let Some(id) = self.streams.next_send_stream() else {
                break;
            };

            let conn_flow_available = self.flow.tx_available();
            let Some(stream) = self.streams.get_mut(id) else {
                continue;
            };

            // control frames first
            if let Some(code) = stream.pending_reset {
                let frame = frame::ResetStream {
                    stream_id: id.as_varint(),
                    application_error_code: code,
                    final_size: VarInt::new(stream.send.total_enqueued()).unwrap_or(VarInt::MAX),
                };
                if frame.encoding_size() <= room!() {
                    encoder.encode(&frame);
                    records.push(SentFrame::ResetStream { id });
                    stream.pending_reset = None;
                    ack_eliciting = true;
                } else {
                    deferred.push(id);
                    break;
                }
            }
            if let Some(code) = stream.pending_stop_sending {
                let frame = frame::StopSending {
                    stream_id: id.as_varint(),
                    application_error_code: code,
                };
                if frame.encoding_size() <= room!() {
                    encoder.encode(&frame);
                    records.push(SentFrame::StopSending { id });
                    stream.pending_stop_sending = None;
                    ack_eliciting = true;
                } else {
                    deferred.push(id);
                    break;
                }
            }
            if stream.pending_max_stream_data {
                let limit = stream.next_max_stream_data();
                let frame = frame::MaxStreamData {
                    stream_id: id.as_varint(),
                    maximum_stream_data: VarInt::new(limit).unwrap_or(VarInt::MAX),
                };
                if frame.encoding_size() <= room!() {
                    encoder.encode(&frame);
                    records.push(SentFrame::MaxStreamData { id });
                    stream.on_max_stream_data_sent(limit);
                    ack_eliciting = true;
                } else {
                    deferred.push(id);
                    break;
                }
            }
            if let Some(limit) = stream.pending_stream_data_blocked {
                let frame = frame::StreamDataBlocked {
                    stream_id: id.as_varint(),
                    stream_data_limit: VarInt::new(limit).unwrap_or(VarInt::MAX),
                };
                if frame.encoding_size() <= room!() {
                    encoder.encode(&frame);
                    records.push(SentFrame::StreamDataBlocked { id });
                    stream.pending_stream_data_blocked = None;
                    ack_eliciting = true;
                }
            }

            // stream data under both flow controls
            let resetting = stream.send_state.is_resetting();
            if !resetting {
                loop {
                    let room = room!();
                    if room <= 4 {
                        break;
                    }
                    let Some((offset, chunk, is_fin)) =
                        stream.send.next_chunk(stream.max_send_offset, room)
                    else {
                        break;
                    };

                    // connection flow control charges only new offsets
                    let end = offset + chunk.len() as u64;
                    let new_bytes = end.saturating_sub(stream.tx_flow_charged);
                    let (chunk_len, is_fin) = if new_bytes > conn_flow_available {
                        let allowed = chunk.len() as u64 - (new_bytes - conn_flow_available);
                        if allowed == 0 && !chunk.is_empty() {
                            self.flow.tx_blocked_at = Some(self.flow.tx_max);
                            self.send.flags.set(flags::DATA_BLOCKED);
                            break;
                        }
                        (allowed as usize, false)
                    } else {
                        (chunk.len(), is_fin)
                    };

                    let mut frame = frame::Stream {
                        stream_id: id.as_varint(),
                        offset: VarInt::new(offset).unwrap_or(VarInt::MAX),
                        is_last_frame: false,
                        is_fin,
                        data: &chunk[..chunk_len],
                    };
                    let Some(take) = frame.max_data_for_capacity(room) else {
                        break;
                    };
                    if take == 0 && chunk_len > 0 {
                        break;
                    }
                    let is_fin = is_fin && take == chunk_len;
                    frame.is_fin = is_fin;
                    let data = chunk[..take].to_vec();
                    let frame = frame::Stream {
                        data: &data,
                        is_fin,
                        ..frame
                    };
                    encoder.encode(&frame);
                    records.push(SentFrame::Stream {
                        id,
                        offset,
                        len: take as u64,
                        is_fin,
                    });

                    stream.on_stream_chunk_sent(offset, take, is_fin);
                    let end = offset + take as u64;
                    if end > stream.tx_flow_charged {
                        let charged = end - stream.tx_flow_charged;
                        stream.tx_flow_charged = end;
                        self.flow.tx_sent += charged;
                    }
                    ack_eliciting = true;

                    if is_fin {
                        break;
                    }
                }
            }

            // anything left returns to the queue for the next packet
            if self
                .streams
                .get_mut(id)
                .map(|s| s.has_send_work())
                .unwrap_or(false)
            {
                deferred.push(id);
                break;
            }
        }

        for id in deferred {
            self.streams.enqueue_for_send(id);
        }

        ack_eliciting
    }
}
