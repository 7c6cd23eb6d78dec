// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-encryption-level packet state: the received-packet tracker that
//! feeds ACK generation, the in-flight sent-packet store that feeds
//! loss detection, and the CRYPTO stream in both directions.

use crate::{
    config::{ACK_TRACKER_BYTES, REASSEMBLY_RANGE_BYTES},
    recovery::{time_threshold, K_PACKET_THRESHOLD},
    tls::Level,
};
use quill_core::{
    range::RangeSet,
    stream::{StreamId, StreamType},
    time::Timestamp,
};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use core::time::Duration;

/// What a sent packet carried, for ack/loss attribution
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SentFrame {
    Ack { largest: u64 },
    Crypto { offset: u64, len: u64 },
    Stream { id: StreamId, offset: u64, len: u64, is_fin: bool },
    ResetStream { id: StreamId },
    StopSending { id: StreamId },
    MaxData,
    MaxStreamData { id: StreamId },
    MaxStreams { stream_type: StreamType },
    DataBlocked,
    StreamDataBlocked { id: StreamId },
    StreamsBlocked { stream_type: StreamType },
    NewConnectionId { sequence: u64 },
    RetireConnectionId { sequence: u64 },
    PathChallenge,
    PathResponse,
    Ping,
    HandshakeDone,
    ConnectionClose,
}

#[derive(Clone, Debug)]
pub struct SentPacketInfo {
    pub packet_number: u64,
    pub bytes: u16,
    pub time_sent: Timestamp,
    pub ack_eliciting: bool,
    /// Counted against the congestion window
    pub in_flight: bool,
    pub is_mtu_probe: bool,
    pub frames: SmallVec<[SentFrame; 4]>,
}

/// In-flight packets of one space, ordered by packet number
#[derive(Default)]
pub struct SentPackets {
    packets: BTreeMap<u64, SentPacketInfo>,
    /// Packet numbers already declared lost, for spurious-loss
    /// accounting
    declared_lost: RangeSet,
}

impl SentPackets {
    pub fn new() -> Self {
        Self {
            packets: BTreeMap::new(),
            declared_lost: RangeSet::with_max_alloc(ACK_TRACKER_BYTES),
        }
    }

    pub fn insert(&mut self, info: SentPacketInfo) {
        self.packets.insert(info.packet_number, info);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn has_ack_eliciting_in_flight(&self) -> bool {
        self.packets.values().any(|info| info.ack_eliciting)
    }

    #[inline]
    pub fn oldest_ack_eliciting_sent(&self) -> Option<Timestamp> {
        self.packets
            .values()
            .filter(|info| info.ack_eliciting)
            .map(|info| info.time_sent)
            .next()
    }

    /// Removes the packets covered by one ACK range. Returns the
    /// removed infos plus the count of packets that had already been
    /// declared lost (spurious loss detections).
    pub fn on_ack_range(&mut self, low: u64, high: u64) -> (Vec<SentPacketInfo>, u64) {
        // walk the map rather than the (peer-controlled) range
        let covered: Vec<u64> = self.packets.range(low..=high).map(|(pn, _)| *pn).collect();
        let mut acked = Vec::with_capacity(covered.len());
        for pn in covered {
            acked.push(self.packets.remove(&pn).expect("keys came from the map"));
        }

        let mut spurious = 0;
        for subrange in self.declared_lost.iter() {
            let overlap_low = subrange.low.max(low);
            let overlap_high = subrange.high().min(high);
            if overlap_low <= overlap_high {
                spurious += overlap_high - overlap_low + 1;
            }
        }
        let _ = self.declared_lost.remove(low, high - low + 1);

        (acked, spurious)
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.1
    //# A packet is declared lost if it meets all of the following
    //# conditions: ... The packet was sent kPacketThreshold packets
    //# before an acknowledged packet ..., or it was sent long enough in
    //# the past.
    ///
    /// Returns the lost packets and, if unacked packets remain below
    /// `largest_acked`, the time at which the next one crosses the time
    /// threshold.
    pub fn detect_lost(
        &mut self,
        now: Timestamp,
        latest_rtt: Duration,
        smoothed_rtt: Duration,
        largest_acked: u64,
    ) -> (Vec<SentPacketInfo>, Option<Timestamp>) {
        let loss_delay = time_threshold(latest_rtt.max(smoothed_rtt));
        let mut lost = Vec::new();
        let mut next_loss_time = None;

        let candidates: Vec<u64> = self
            .packets
            .range(..largest_acked)
            .map(|(pn, _)| *pn)
            .collect();

        for pn in candidates {
            let info = &self.packets[&pn];

            let by_threshold = largest_acked.saturating_sub(pn) >= K_PACKET_THRESHOLD;
            let time_limit = info.time_sent + loss_delay;
            let by_time = time_limit <= now;

            if by_threshold || by_time {
                let info = self.packets.remove(&pn).expect("candidate exists");
                self.declared_lost.add_value(pn);
                lost.push(info);
            } else {
                next_loss_time = Some(match next_loss_time {
                    Some(existing) if existing <= time_limit => existing,
                    _ => time_limit,
                });
            }
        }

        (lost, next_loss_time)
    }

    /// Drains everything, e.g. when the space's keys are discarded
    pub fn drain(&mut self) -> Vec<SentPacketInfo> {
        let packets = core::mem::take(&mut self.packets);
        packets.into_values().collect()
    }
}

/// Tracks received packet numbers and decides when ACKs are due
pub struct AckTracker {
    received: RangeSet,
    largest: Option<(u64, Timestamp)>,
    /// Ack-eliciting packets seen since the last ACK went out
    unacked_eliciting: u8,
    /// An ACK frame must be built at the next flush
    ack_immediately: bool,
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.2
//# A receiver SHOULD send an ACK frame after receiving at least two
//# ack-eliciting packets.
const ACK_ELICITING_THRESHOLD: u8 = 2;

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            received: RangeSet::with_max_alloc(ACK_TRACKER_BYTES),
            largest: None,
            unacked_eliciting: 0,
            ack_immediately: false,
        }
    }

    /// Records a decrypted packet. Returns false when the packet
    /// number is a duplicate.
    pub fn on_packet_received(&mut self, pn: u64, ack_eliciting: bool, now: Timestamp) -> bool {
        if self.received.contains(pn) {
            return false;
        }
        self.received.add_value(pn);

        match self.largest {
            Some((largest, _)) if largest >= pn => {}
            _ => self.largest = Some((pn, now)),
        }

        if ack_eliciting {
            self.unacked_eliciting = self.unacked_eliciting.saturating_add(1);
            if self.unacked_eliciting >= ACK_ELICITING_THRESHOLD {
                self.ack_immediately = true;
            }
        }
        true
    }

    /// An out-of-order or gap-revealing packet forces an immediate ACK
    pub fn force_immediate_ack(&mut self) {
        if self.unacked_eliciting > 0 {
            self.ack_immediately = true;
        }
    }

    #[inline]
    pub fn has_packets_to_ack(&self) -> bool {
        !self.received.is_empty() && self.unacked_eliciting > 0
    }

    #[inline]
    pub fn ack_immediately(&self) -> bool {
        self.ack_immediately
    }

    #[inline]
    pub fn largest_received(&self) -> Option<(u64, Timestamp)> {
        self.largest
    }

    #[inline]
    pub fn ranges(&self) -> &RangeSet {
        &self.received
    }

    #[inline]
    pub fn is_duplicate(&self, pn: u64) -> bool {
        self.received.contains(pn)
    }

    /// The delay to encode into an ACK frame being built now
    pub fn ack_delay(&self, now: Timestamp) -> Duration {
        match self.largest {
            Some((_, received_at)) => now.saturating_duration_since(received_at),
            None => Duration::ZERO,
        }
    }

    pub fn on_ack_sent(&mut self) {
        self.unacked_eliciting = 0;
        self.ack_immediately = false;
    }
}

/// Transmit side of a CRYPTO stream
#[derive(Default)]
pub struct CryptoTx {
    buffer: Vec<u8>,
    /// Offsets queued for (re)transmission
    pending: RangeSet,
}

impl CryptoTx {
    /// Appends handshake bytes produced by the TLS layer
    pub fn push(&mut self, data: &[u8]) {
        let offset = self.buffer.len() as u64;
        self.buffer.extend_from_slice(data);
        self.pending.add(offset, data.len() as u64);
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The next contiguous chunk to send, at most `max_len` bytes
    pub fn next_chunk(&self, max_len: usize) -> Option<(u64, &[u8])> {
        let subrange = self.pending.get(0)?;
        let len = (subrange.count as usize).min(max_len);
        let start = subrange.low as usize;
        Some((subrange.low, &self.buffer[start..start + len]))
    }

    pub fn on_chunk_sent(&mut self, offset: u64, len: usize) {
        let _ = self.pending.remove(offset, len as u64);
    }

    /// Requeues a lost chunk
    pub fn on_chunk_lost(&mut self, offset: u64, len: u64) {
        debug_assert!(offset + len <= self.buffer.len() as u64);
        self.pending.add(offset, len);
    }
}

/// Receive side of a CRYPTO stream: reassembles and delivers in order
#[derive(Default)]
pub struct CryptoRx {
    buffer: Vec<u8>,
    received: RangeSet,
    delivered: u64,
}

impl CryptoRx {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            received: RangeSet::with_max_alloc(REASSEMBLY_RANGE_BYTES),
            delivered: 0,
        }
    }

    /// Buffers a CRYPTO frame; returns false when the range tracker
    /// refused the write
    pub fn write(&mut self, offset: u64, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        let end = offset as usize + data.len();
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[offset as usize..end].copy_from_slice(data);
        self.received.add(offset, data.len() as u64);
        true
    }

    /// Takes the next contiguous bytes for the TLS layer
    pub fn take_ready(&mut self) -> Option<Vec<u8>> {
        let first = self.received.get(0)?;
        if first.low > self.delivered {
            return None;
        }
        let available_end = first.low + first.count;
        if available_end <= self.delivered {
            return None;
        }

        let start = self.delivered as usize;
        let end = available_end as usize;
        let chunk = self.buffer[start..end].to_vec();
        self.delivered = available_end;
        Some(chunk)
    }
}

/// Everything one encryption level tracks
pub struct PacketSpace {
    pub level: Level,
    pub next_packet_number: u64,
    pub largest_acked: Option<u64>,
    /// Largest packet number successfully decrypted, for PN expansion
    pub largest_decrypted: Option<u64>,
    pub ack_tracker: AckTracker,
    pub sent: SentPackets,
    pub crypto_tx: CryptoTx,
    pub crypto_rx: CryptoRx,
    /// Earliest pending time-threshold loss, from the last ACK
    pub loss_time: Option<Timestamp>,
    pub discarded: bool,
}

impl PacketSpace {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            next_packet_number: 0,
            largest_acked: None,
            largest_decrypted: None,
            ack_tracker: AckTracker::new(),
            sent: SentPackets::new(),
            crypto_tx: CryptoTx::default(),
            crypto_rx: CryptoRx::new(),
            loss_time: None,
            discarded: false,
        }
    }

    /// Allocates the next packet number for transmission
    pub fn take_packet_number(&mut self) -> u64 {
        let pn = self.next_packet_number;
        self.next_packet_number += 1;
        pn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn at(ms: u64) -> Timestamp {
        Timestamp::from_micros(ms * 1_000)
    }

    fn info(pn: u64, sent_ms: u64) -> SentPacketInfo {
        SentPacketInfo {
            packet_number: pn,
            bytes: 1200,
            time_sent: at(sent_ms),
            ack_eliciting: true,
            in_flight: true,
            is_mtu_probe: false,
            frames: smallvec![SentFrame::Stream {
                id: StreamId::from_varint(quill_core::varint::VarInt::from_u8(0)),
                offset: pn * 100,
                len: 100,
                is_fin: false,
            }],
        }
    }

    #[test]
    fn packet_threshold_loss() {
        // scenario: STREAM frames on packet numbers 1..=5, ACK covers
        // {3,4,5}, packets 1 and 2 are lost by the reordering threshold
        let mut sent = SentPackets::new();
        for pn in 1..=5 {
            sent.insert(info(pn, pn));
        }

        let (acked, spurious) = sent.on_ack_range(3, 5);
        assert_eq!(acked.len(), 3);
        assert_eq!(spurious, 0);

        let (lost, next_loss) = sent.detect_lost(
            at(100),
            Duration::from_millis(10),
            Duration::from_millis(10),
            5,
        );
        assert_eq!(lost.len(), 2);
        assert_eq!(lost[0].packet_number, 1);
        assert_eq!(lost[1].packet_number, 2);
        assert_eq!(next_loss, None);
        assert!(sent.is_empty());
    }

    #[test]
    fn time_threshold_loss() {
        let mut sent = SentPackets::new();
        sent.insert(info(4, 0));
        sent.insert(info(5, 100));
        let (acked, _) = sent.on_ack_range(5, 5);
        assert_eq!(acked.len(), 1);

        // packet 4 is within the reordering threshold but stale:
        // loss delay = 9/8 * 40ms = 45ms
        let rtt = Duration::from_millis(40);
        let (lost, next) = sent.detect_lost(at(30), rtt, rtt, 5);
        assert!(lost.is_empty());
        assert_eq!(next, Some(at(45)));

        let (lost, next) = sent.detect_lost(at(45), rtt, rtt, 5);
        assert_eq!(lost.len(), 1);
        assert_eq!(next, None);
    }

    #[test]
    fn spurious_loss_detected() {
        let mut sent = SentPackets::new();
        for pn in 1..=5 {
            sent.insert(info(pn, pn));
        }
        sent.on_ack_range(4, 5);
        let (lost, _) = sent.detect_lost(
            at(100),
            Duration::from_millis(10),
            Duration::from_millis(10),
            5,
        );
        assert_eq!(lost.len(), 2);

        // a late ACK arrives for a packet we already declared lost
        let (acked, spurious) = sent.on_ack_range(1, 1);
        assert!(acked.is_empty());
        assert_eq!(spurious, 1);
    }

    #[test]
    fn ack_tracker_thresholds() {
        let mut tracker = AckTracker::new();

        assert!(tracker.on_packet_received(0, true, at(0)));
        assert!(!tracker.ack_immediately());
        assert!(tracker.has_packets_to_ack());

        assert!(tracker.on_packet_received(1, true, at(1)));
        assert!(tracker.ack_immediately());

        tracker.on_ack_sent();
        assert!(!tracker.ack_immediately());
        assert!(!tracker.has_packets_to_ack());

        // duplicates are reported and not re-tracked
        assert!(!tracker.on_packet_received(1, true, at(2)));
        assert_eq!(tracker.ranges().len(), 1);

        // pure ACK packets never force an ACK on their own
        assert!(tracker.on_packet_received(7, false, at(3)));
        assert!(!tracker.ack_immediately());
        assert!(!tracker.has_packets_to_ack());
    }

    #[test]
    fn crypto_reassembly_out_of_order() {
        let mut rx = CryptoRx::new();
        assert!(rx.write(6, b"world"));
        assert_eq!(rx.take_ready(), None);

        assert!(rx.write(0, b"hello "));
        assert_eq!(rx.take_ready().unwrap(), b"hello world");
        assert_eq!(rx.take_ready(), None);
    }

    #[test]
    fn crypto_tx_retransmission() {
        let mut tx = CryptoTx::default();
        tx.push(b"client hello");
        let (offset, chunk) = tx.next_chunk(1024).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(chunk, b"client hello");

        tx.on_chunk_sent(0, chunk.len());
        assert!(!tx.has_pending());

        tx.on_chunk_lost(0, 6);
        let (offset, chunk) = tx.next_chunk(1024).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(chunk, b"client");
    }
}
