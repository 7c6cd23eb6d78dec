// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The receive engine: datagram walk, packet unprotection, frame
//! dispatch, and ACK scheduling.

use crate::{
    connection::{Connection, Event, State, TimerKind, MAX_PENDING_UNDECRYPTABLE},
    path::Path,
    send::flags,
    space::SentPacketInfo,
    stream::set::PeerStream,
    tls::Level,
};
use quill_core::{
    event as core_event,
    frame::{self, Frame},
    packet::{number::PacketNumber, Encrypted, PacketType, ProtectedPacket},
    time::Timestamp,
    transport::Error,
    varint::VarInt,
};
use s2n_codec::{DecoderBuffer, DecoderBufferMut};
use std::net::SocketAddr;

/// Ceiling on buffered CRYPTO stream bytes per level
const MAX_CRYPTO_BUFFER: u64 = 256 * 1024;

impl Connection {
    /// Feeds one received UDP datagram through the connection
    pub fn on_datagram(&mut self, payload: &mut [u8], remote: SocketAddr, now: Timestamp) {
        if self.state.is_closed() {
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2.1
        //# An endpoint in the closing state SHOULD eventually respond
        //# with another packet containing a CONNECTION_CLOSE frame
        if self.state.is_closing() {
            if self.state == State::ClosingLocally {
                if let Some(close) = &self.close {
                    if close.is_application {
                        self.send.flags.set(flags::APPLICATION_CLOSE);
                    } else {
                        self.send.flags.set(flags::CONNECTION_CLOSE);
                    }
                    self.send.request_flush();
                }
            }
            return;
        }

        if remote != self.active_path().remote {
            self.on_peer_address_change(remote, now);
        }
        self.active_path_mut().on_bytes_received(payload.len());

        let mut buffer = DecoderBufferMut::new(payload);
        while !buffer.is_empty() {
            let dcid_len = self.cids.local_cids()[0].cid.len();
            let (packet, remaining) = match ProtectedPacket::decode(buffer, dcid_len) {
                Ok(split) => split,
                Err(_) => {
                    self.emit(
                        now,
                        core_event::Event::PacketDropped(core_event::PacketDropped {
                            reason: core_event::DropReason::MalformedHeader,
                            bytes: 0,
                        }),
                    );
                    return;
                }
            };
            buffer = remaining;

            let result = match packet {
                ProtectedPacket::VersionNegotiation(packet) => {
                    self.on_version_negotiation(packet.versions, now);
                    Ok(())
                }
                ProtectedPacket::Retry(packet) => {
                    self.on_retry(&packet, now);
                    Ok(())
                }
                ProtectedPacket::Encrypted(packet) => self.on_encrypted_packet(packet, now),
            };

            if let Err(error) = result {
                self.close_with_error(error, now);
                return;
            }
            if self.state.is_closing() || self.state.is_closed() {
                return;
            }
        }
    }

    fn on_peer_address_change(&mut self, remote: SocketAddr, now: Timestamp) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-9.3
        //# An endpoint only changes the address to which it sends
        //# packets in response to the highest-numbered non-probing
        //# packet.
        if !self.handshake_complete || self.paths.len() >= crate::path::MAX_PATHS {
            return;
        }

        let local = self.active_path().local;
        let mtu = self.settings.base_mtu;
        let mut path = Path::new(local, remote, mtu, quill_core::endpoint::Type::Server);

        // challenge the new address before trusting it
        let data = self.random_challenge_data();
        let pto = self.active_path().rtt.pto(core::time::Duration::ZERO, 0);
        path.begin_challenge(data, now + pto * 3);
        self.paths.push(path);
        self.active_path = self.paths.len() - 1;

        self.send.flags.set(flags::PATH_CHALLENGE);
        self.send.request_flush();
        self.app_events.push_back(Event::PeerAddressChanged { remote });
    }

    fn on_version_negotiation(&mut self, versions: Vec<u32>, now: Timestamp) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-6.2
        //# A client MUST discard a Version Negotiation packet that lists
        //# the QUIC version selected by the client.
        if self.role.is_server()
            || self.state != State::HandshakeStarted
            || versions.contains(&quill_core::packet::VERSION_V1)
        {
            return;
        }
        // no common version; give up without a close exchange
        self.close(
            Error::new(Error::INTERNAL_ERROR).with_reason("no compatible quic version"),
            false,
            b"",
            true,
            now,
        );
    }

    fn on_retry(&mut self, packet: &quill_core::packet::long::Retry<'_>, now: Timestamp) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5.2
        //# A client MUST accept and process at most one Retry packet for
        //# each connection attempt.
        if self.role.is_server() || self.retry_scid.is_some() || !self.retry_token.is_empty() {
            return;
        }
        if self.spaces[Level::Initial.as_index()].largest_decrypted.is_some() {
            // a valid Initial already arrived; the retry is stale
            return;
        }
        if !packet.is_tag_valid(&self.original_dcid) {
            self.emit(
                now,
                core_event::Event::PacketDropped(core_event::PacketDropped {
                    reason: core_event::DropReason::InvalidRetry,
                    bytes: 0,
                }),
            );
            return;
        }

        self.retry_token = packet.token().to_vec();
        self.retry_scid = Some(packet.scid);
        self.cids.on_peer_cid_rebound(packet.scid);
        self.peer_cid_bound = true;

        //= https://www.rfc-editor.org/rfc/rfc9001#section-5.2
        //# The client MUST use the contents of the Destination
        //# Connection ID field of the second Initial packet it sends
        if let Ok(keys) = quill_core::crypto::initial::retry_initial_keys(
            &quill_core::crypto::initial::INITIAL_SALT_V1,
            packet.scid.as_bytes(),
            self.role,
        ) {
            self.initial_keys = Some(keys);
        }

        // the whole first flight retransmits under the new token
        let space = &mut self.spaces[Level::Initial.as_index()];
        let dropped = space.sent.drain();
        for info in dropped {
            for frame in info.frames {
                if let crate::space::SentFrame::Crypto { offset, len } = frame {
                    space.crypto_tx.on_chunk_lost(offset, len);
                }
            }
            if info.in_flight {
                self.paths[self.active_path]
                    .congestion
                    .on_packet_discarded(info.bytes as usize);
            }
        }
        self.send.request_flush();
    }

    fn on_encrypted_packet(&mut self, mut packet: Encrypted<'_>, now: Timestamp) -> Result<(), Error> {
        let level = match packet.packet_type {
            PacketType::Initial => Level::Initial,
            PacketType::Handshake => Level::Handshake,
            PacketType::OneRtt => Level::OneRtt,
            PacketType::ZeroRtt => {
                // 0-RTT receipt is not supported; drop silently
                self.drop_packet(core_event::DropReason::NoMatchingKey, packet.len(), now);
                return Ok(());
            }
            _ => return Ok(()),
        };
        let space_index = level.as_index();

        if self.spaces[space_index].discarded {
            self.drop_packet(core_event::DropReason::NoMatchingKey, packet.len(), now);
            return Ok(());
        }
        if !self.has_open_keys(level) {
            self.buffer_undecryptable(&packet, now);
            return Ok(());
        }

        let largest = self.spaces[space_index]
            .largest_decrypted
            .and_then(PacketNumber::new);

        // header protection removal and payload decryption
        let pn = {
            let hp = match level {
                Level::Initial => &self.initial_keys.as_ref().expect("keys checked").opener_hp,
                Level::Handshake => &self.handshake_keys.as_ref().expect("keys checked").opener_hp,
                Level::OneRtt => self.one_rtt_keys.as_ref().expect("keys checked").opener_hp(),
            };
            match packet.unprotect(hp, largest) {
                Ok(pn) => pn,
                Err(_) => {
                    self.counters.decryption_failures += 1;
                    self.drop_packet(core_event::DropReason::DecryptionFailed, packet.len(), now);
                    return Ok(());
                }
            }
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.3
        //# A receiver that tracks received packets can discard state for
        //# packets it has reported in ACK frames
        if self.spaces[space_index].ack_tracker.is_duplicate(pn.as_u64()) {
            self.counters.duplicate_packets += 1;
            self.drop_packet(core_event::DropReason::Duplicate, packet.len(), now);
            return Ok(());
        }

        let packet_len = packet.len();
        let packet_dcid = packet.dcid;
        let packet_scid = packet.scid;

        let decrypted = match level {
            Level::Initial => {
                let keys = self.initial_keys.as_ref().expect("keys checked");
                packet.decrypt(&keys.opener, pn).map(|c| c.to_vec())
            }
            Level::Handshake => {
                let keys = self.handshake_keys.as_ref().expect("keys checked");
                packet.decrypt(&keys.opener, pn).map(|c| c.to_vec())
            }
            Level::OneRtt => {
                let keys = self.one_rtt_keys.as_mut().expect("keys checked");
                match packet.decrypt_one_rtt(keys, pn) {
                    Ok((cleartext, outcome)) => {
                        let cleartext = cleartext.to_vec();
                        if outcome == quill_core::crypto::key::KeyPhaseOutcome::Updated {
                            let generation = self
                                .one_rtt_keys
                                .as_ref()
                                .map(|k| k.generation())
                                .unwrap_or(0);
                            self.emit(
                                now,
                                core_event::Event::KeyUpdated(core_event::KeyUpdated {
                                    generation,
                                    initiated_locally: false,
                                }),
                            );
                        }
                        Ok(cleartext)
                    }
                    Err(error) => Err(error),
                }
            }
        };

        let cleartext = match decrypted {
            Ok(cleartext) => cleartext,
            Err(_) => {
                self.counters.decryption_failures += 1;
                self.drop_packet(core_event::DropReason::DecryptionFailed, packet_len, now);
                return Ok(());
            }
        };

        // the packet is authentic: advance connection state
        self.counters.packets_received += 1;
        self.emit(
            now,
            core_event::Event::PacketReceived(core_event::PacketReceived {
                space: level.space(),
                packet_number: pn.as_u64(),
                bytes: packet_len,
            }),
        );

        if self.state == State::HandshakeStarted {
            self.state = State::HandshakeInProgress;
        }
        if self.role.is_client() && !self.peer_cid_bound {
            if let Some(scid) = packet_scid {
                self.cids.on_peer_cid_rebound(scid);
                self.peer_cid_bound = true;
            }
        }
        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.1
        //# a server MUST discard Initial keys when it first successfully
        //# processes a Handshake packet
        if self.role.is_server() && level == Level::Handshake {
            if self.initial_keys.is_some() {
                self.discard_space(Level::Initial, now);
            }
            //= https://www.rfc-editor.org/rfc/rfc9000#section-8.1
            //# Once an endpoint has successfully processed a Handshake
            //# packet from the peer, it can consider the peer address to
            //# have been validated.
            self.active_path_mut().on_validated();
        }

        let space = &mut self.spaces[space_index];
        if space.largest_decrypted.map_or(true, |l| pn.as_u64() > l) {
            space.largest_decrypted = Some(pn.as_u64());
        }

        // frame walk, in wire order
        let mut ack_eliciting = false;
        let mut decoder = DecoderBuffer::new(&cleartext);
        if decoder.is_empty() {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
            //# An endpoint MUST treat receipt of a packet containing no
            //# frames as a connection error of type PROTOCOL_VIOLATION.
            return Err(Error::new(Error::PROTOCOL_VIOLATION).with_reason("empty packet"));
        }
        while !decoder.is_empty() {
            let (frame, remaining) = Frame::decode(decoder).map_err(Error::from)?;
            decoder = remaining;
            ack_eliciting |= frame.is_ack_eliciting();
            self.handle_frame(frame, level, &packet_dcid, now)?;
            if self.state.is_closing() || self.state.is_closed() {
                return Ok(());
            }
        }

        // receive-side ACK scheduling
        let newly_tracked =
            self.spaces[space_index]
                .ack_tracker
                .on_packet_received(pn.as_u64(), ack_eliciting, now);
        debug_assert!(newly_tracked, "duplicates were filtered above");

        if ack_eliciting {
            if self.spaces[space_index].ack_tracker.ack_immediately() || level != Level::OneRtt {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.1
                //# an endpoint MUST NOT delay acknowledgments of
                //# ack-eliciting Initial and Handshake packets
                self.send.flags.set(flags::ACK);
                self.send.request_flush();
                self.cancel_timer(TimerKind::AckDelay);
            } else if self.timers[TimerKind::AckDelay as usize].is_none() {
                self.set_timer(TimerKind::AckDelay, now + self.settings.max_ack_delay);
            }
            self.arm_idle_timer(now);
        }

        Ok(())
    }

    fn has_open_keys(&self, level: Level) -> bool {
        match level {
            Level::Initial => self.initial_keys.is_some(),
            Level::Handshake => self.handshake_keys.is_some(),
            Level::OneRtt => self.one_rtt_keys.is_some() && self.handshake_complete,
        }
    }

    fn buffer_undecryptable(&mut self, packet: &Encrypted<'_>, now: Timestamp) {
        if self.pending_undecryptable.len() < MAX_PENDING_UNDECRYPTABLE {
            self.pending_undecryptable.push(packet.as_bytes().to_vec());
        } else {
            self.drop_packet(core_event::DropReason::NoMatchingKey, packet.len(), now);
        }
    }

    /// Replays datagrams that arrived before their keys
    pub fn replay_pending(&mut self, now: Timestamp) {
        if self.pending_undecryptable.is_empty() {
            return;
        }
        let remote = self.active_path().remote;
        let pending = core::mem::take(&mut self.pending_undecryptable);
        for mut payload in pending {
            self.on_datagram(&mut payload, remote, now);
        }
    }

    fn drop_packet(&self, reason: core_event::DropReason, bytes: usize, now: Timestamp) {
        self.emit(
            now,
            core_event::Event::PacketDropped(core_event::PacketDropped { reason, bytes }),
        );
    }

    // === frame dispatch ===

    fn handle_frame(
        &mut self,
        frame: Frame<'_>,
        level: Level,
        packet_dcid: &quill_core::connection::ConnectionId,
        now: Timestamp,
    ) -> Result<(), Error> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-12.5
        //# An endpoint MUST treat receipt of a frame in a packet type
        //# that is not permitted as a connection error of type
        //# PROTOCOL_VIOLATION.
        if level != Level::OneRtt {
            let allowed = matches!(
                frame,
                Frame::Padding(_)
                    | Frame::Ping(_)
                    | Frame::Ack(_)
                    | Frame::Crypto(_)
                    | Frame::ConnectionClose(_)
            );
            if !allowed {
                return Err(Error::new(Error::PROTOCOL_VIOLATION)
                    .with_frame_type(VarInt::from_u8(frame.tag()))
                    .with_reason("frame not permitted at this encryption level"));
            }
            if let Frame::ConnectionClose(close) = &frame {
                if close.is_application_error() {
                    return Err(Error::new(Error::PROTOCOL_VIOLATION)
                        .with_reason("application close before the handshake"));
                }
            }
        }

        match frame {
            Frame::Padding(_) | Frame::Ping(_) => Ok(()),
            Frame::Ack(ack) => self.on_ack_frame(level, ack, now),
            Frame::Crypto(crypto) => self.on_crypto_frame(level, crypto.offset, crypto.data, now),
            Frame::Stream(stream_frame) => {
                let id = quill_core::stream::StreamId::from_varint(stream_frame.stream_id);
                self.on_stream_data(
                    id,
                    stream_frame.offset.as_u64(),
                    stream_frame.data,
                    stream_frame.is_fin,
                    now,
                )
            }
            Frame::ResetStream(reset) => {
                let id = quill_core::stream::StreamId::from_varint(reset.stream_id);
                self.on_reset_stream_frame(id, reset.application_error_code, reset.final_size, now)
            }
            Frame::StopSending(stop) => {
                let id = quill_core::stream::StreamId::from_varint(stop.stream_id);
                self.on_stop_sending_frame(id, stop.application_error_code, now)
            }
            Frame::MaxData(frame) => {
                self.flow.on_peer_max_data(frame.maximum_data.as_u64());
                self.send.request_flush();
                Ok(())
            }
            Frame::MaxStreamData(frame) => {
                let id = quill_core::stream::StreamId::from_varint(frame.stream_id);
                match self.streams.get_or_create_peer(id) {
                    Ok(PeerStream::Stream(stream, created)) => {
                        if stream.on_max_stream_data_frame(frame.maximum_stream_data.as_u64()) {
                            self.streams.enqueue_for_send(id);
                            self.send.request_flush();
                        }
                        self.notify_created(created);
                        Ok(())
                    }
                    Ok(PeerStream::Closed) => Ok(()),
                    Err(error) => Err(error),
                }
            }
            Frame::MaxStreams(frame) => {
                let released = self
                    .streams
                    .on_peer_max_streams(frame.stream_type, frame.maximum_streams.as_u64());
                for id in released {
                    self.streams.enqueue_for_send(id);
                    self.app_events.push_back(Event::StreamAccepted { id });
                    self.send.request_flush();
                }
                let bidi = self
                    .streams
                    .counts(self.role, quill_core::stream::StreamType::Bidirectional);
                let uni = self
                    .streams
                    .counts(self.role, quill_core::stream::StreamType::Unidirectional);
                self.app_events.push_back(Event::StreamsAvailable {
                    bidi: bidi.max_from_peer.saturating_sub(bidi.total),
                    uni: uni.max_from_peer.saturating_sub(uni.total),
                });
                Ok(())
            }
            Frame::DataBlocked(_) | Frame::StreamDataBlocked(_) | Frame::StreamsBlocked(_) => {
                // informational; the regular window updates respond
                Ok(())
            }
            Frame::NewConnectionId(frame) => {
                let retired = self.cids.on_new_connection_id_frame(&frame)?;
                if !retired.is_empty() {
                    self.send.flags.set(flags::RETIRE_CONNECTION_ID);
                    self.send.request_flush();
                }
                Ok(())
            }
            Frame::RetireConnectionId(frame) => {
                if let Some(removed) = self
                    .cids
                    .on_retire_connection_id_frame(frame.sequence_number, packet_dcid)?
                {
                    self.retired_local_cids.push(removed);
                }
                Ok(())
            }
            Frame::PathChallenge(challenge) => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-8.2.2
                //# On receiving a PATH_CHALLENGE frame, an endpoint MUST
                //# respond by echoing the data contained in the
                //# PATH_CHALLENGE frame in a PATH_RESPONSE frame.
                self.active_path_mut().pending_response = Some(challenge.data);
                self.send.flags.set(flags::PATH_RESPONSE);
                self.send.request_flush();
                Ok(())
            }
            Frame::PathResponse(response) => {
                self.active_path_mut().on_path_response(&response.data);
                Ok(())
            }
            Frame::NewToken(token) => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
                //# A server MUST treat receipt of a NEW_TOKEN frame as a
                //# connection error of type PROTOCOL_VIOLATION.
                if self.role.is_server() {
                    return Err(Error::new(Error::PROTOCOL_VIOLATION)
                        .with_reason("new_token from a client"));
                }
                let _ = token;
                Ok(())
            }
            Frame::HandshakeDone(_) => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.20
                //# A server MUST treat receipt of a HANDSHAKE_DONE frame
                //# as a connection error of type PROTOCOL_VIOLATION.
                if self.role.is_server() {
                    return Err(Error::new(Error::PROTOCOL_VIOLATION)
                        .with_reason("handshake_done from a client"));
                }
                self.on_handshake_confirmed(now);
                Ok(())
            }
            Frame::ConnectionClose(close) => {
                self.on_peer_close(
                    close.error_code,
                    close.is_application_error(),
                    close.reason.unwrap_or(&[]),
                    now,
                );
                Ok(())
            }
        }
    }

    fn on_ack_frame(
        &mut self,
        level: Level,
        ack: frame::Ack<frame::ack::AckRangesDecoder<'_>>,
        now: Timestamp,
    ) -> Result<(), Error> {
        let space_index = level.as_index();
        let largest_acked = ack.largest_acknowledged();

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.1
        //# An endpoint SHOULD treat receipt of an acknowledgment for a
        //# packet it did not send as a connection error of type
        //# PROTOCOL_VIOLATION
        if largest_acked >= self.spaces[space_index].next_packet_number {
            return Err(Error::new(Error::PROTOCOL_VIOLATION)
                .with_reason("ack for an unsent packet number"));
        }

        let mut acked: Vec<SentPacketInfo> = Vec::new();
        let mut spurious = 0u64;
        for range in ack.ack_ranges() {
            let (low, high) = range.into_inner();
            let (mut infos, range_spurious) =
                self.spaces[space_index].sent.on_ack_range(low, high);
            spurious += range_spurious;
            acked.append(&mut infos);
        }
        self.counters.spurious_lost_packets += spurious;

        if acked.is_empty() && spurious == 0 {
            return Ok(());
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.1
        //# An endpoint generates an RTT sample on receiving an ACK frame
        //# that meets the following two conditions: ... the largest
        //# acknowledged packet number is newly acknowledged
        if let Some(largest_info) = acked
            .iter()
            .find(|info| info.packet_number == largest_acked)
        {
            if largest_info.ack_eliciting {
                let sample = now.saturating_duration_since(largest_info.time_sent);
                //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.5
                //# The ACK Delay field ... is decoded by multiplying the
                //# value in the field by 2 to the power of the
                //# ack_delay_exponent
                let (exponent, max_ack_delay) = self
                    .peer_params
                    .as_ref()
                    .map(|p| (p.ack_delay_exponent, p.max_ack_delay))
                    .unwrap_or((3, core::time::Duration::from_millis(25)));
                let ack_delay = core::time::Duration::from_micros(
                    ack.ack_delay.as_u64().saturating_mul(1 << exponent),
                );
                let confirmed = self.handshake_complete;
                self.paths[self.active_path]
                    .rtt
                    .update(sample, ack_delay, max_ack_delay, confirmed);
            }
        }

        let previous_largest = self.spaces[space_index].largest_acked;
        if previous_largest.map_or(true, |l| largest_acked > l) {
            self.spaces[space_index].largest_acked = Some(largest_acked);
        }
        self.pto_count = 0;

        for info in acked {
            self.on_packet_acked(space_index, info, now);
        }

        // loss detection keyed off the new largest acknowledged
        let (latest, smoothed) = {
            let rtt = &self.active_path().rtt;
            (rtt.latest(), rtt.smoothed())
        };
        let (lost, next_loss_time) = self.spaces[space_index].sent.detect_lost(
            now,
            latest,
            smoothed,
            self.spaces[space_index].largest_acked.unwrap_or(0),
        );
        self.spaces[space_index].loss_time = next_loss_time;
        if !lost.is_empty() {
            self.on_packets_lost(space_index, lost, now);
        }

        self.rearm_loss_timer(now);
        Ok(())
    }

    fn on_crypto_frame(
        &mut self,
        level: Level,
        offset: VarInt,
        data: &[u8],
        now: Timestamp,
    ) -> Result<(), Error> {
        let end = offset
            .as_u64()
            .checked_add(data.len() as u64)
            .ok_or_else(|| Error::new(Error::FRAME_ENCODING_ERROR))?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.5
        //# If an endpoint's buffer is exceeded, it can ... close the
        //# connection with a CRYPTO_BUFFER_EXCEEDED error code.
        if end > MAX_CRYPTO_BUFFER {
            return Err(Error::new(Error::CRYPTO_BUFFER_EXCEEDED));
        }

        let space = &mut self.spaces[level.as_index()];
        space.crypto_rx.write(offset.as_u64(), data);

        while let Some(chunk) = self.spaces[level.as_index()].crypto_rx.take_ready() {
            let output = self
                .tls
                .process(level, &chunk)
                .map_err(|alert| Error::from(alert))?;
            self.on_tls_output(output, now)?;
        }

        // newly delivered keys may unlock buffered packets
        self.replay_pending(now);
        Ok(())
    }

    fn on_stream_data(
        &mut self,
        id: quill_core::stream::StreamId,
        offset: u64,
        data: &[u8],
        is_fin: bool,
        _now: Timestamp,
    ) -> Result<(), Error> {
        let growth;
        let mut became_readable = false;
        let mut created_ids = Vec::new();

        match self.streams.get_or_create_peer(id)? {
            PeerStream::Closed => return Ok(()),
            PeerStream::Stream(stream, created) => {
                created_ids = created;
                let readable_before = stream.recv.readable_len() > 0;
                growth = stream.on_stream_frame(offset, data, is_fin)?;
                let readable_after =
                    stream.recv.readable_len() > 0 || stream.recv.is_fully_read();
                became_readable = readable_after && !readable_before;
            }
        }

        self.flow.on_rx_growth(growth)?;
        self.notify_created(created_ids);

        if became_readable {
            self.app_events.push_back(Event::StreamReadable { id });
        }
        Ok(())
    }

    fn on_reset_stream_frame(
        &mut self,
        id: quill_core::stream::StreamId,
        error_code: VarInt,
        final_size: VarInt,
        now: Timestamp,
    ) -> Result<(), Error> {
        let _ = now;
        let growth;
        let created_ids;
        match self.streams.get_or_create_peer(id)? {
            PeerStream::Closed => return Ok(()),
            PeerStream::Stream(stream, created) => {
                created_ids = created;
                growth = stream.on_reset_frame(error_code, final_size.as_u64())?;
            }
        }
        self.flow.on_rx_growth(growth)?;
        self.notify_created(created_ids);
        self.app_events.push_back(Event::StreamReset { id, error_code });

        if self
            .streams
            .get_mut(id)
            .map(|s| s.is_terminal())
            .unwrap_or(false)
            && self.streams.on_stream_terminal(id)
        {
            self.update_max_streams_flags();
        }
        Ok(())
    }

    fn on_stop_sending_frame(
        &mut self,
        id: quill_core::stream::StreamId,
        error_code: VarInt,
        now: Timestamp,
    ) -> Result<(), Error> {
        let created_ids;
        match self.streams.get_or_create_peer(id)? {
            PeerStream::Closed => return Ok(()),
            PeerStream::Stream(stream, created) => {
                created_ids = created;
                stream.on_stop_sending_frame(error_code)?;
            }
        }
        self.notify_created(created_ids);
        self.app_events
            .push_back(Event::StreamStopSending { id, error_code });
        self.streams.enqueue_for_send(id);
        self.send.request_flush();
        Ok(())
    }

    /// Surfaces implicitly created peer streams to the application
    fn notify_created(&mut self, created: Vec<quill_core::stream::StreamId>) {
        for id in created {
            self.app_events.push_back(Event::StreamStarted {
                id,
                stream_type: id.stream_type(),
            });
        }
    }
}
