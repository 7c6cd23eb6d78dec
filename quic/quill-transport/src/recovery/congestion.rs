// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Window-based congestion control per RFC 9002: slow start,
//! congestion avoidance, one response per loss epoch, and collapse to
//! the minimum window on persistent congestion.

use quill_core::time::Timestamp;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.2
//# Endpoints SHOULD use an initial congestion window of ten times the
//# maximum datagram size (max_datagram_size), while limiting the window
//# to the larger of 14,720 bytes or twice the maximum datagram size.
const INITIAL_WINDOW_PACKETS: u64 = 10;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.2
//# The RECOMMENDED value is 2 * max_datagram_size.
const MINIMUM_WINDOW_PACKETS: u64 = 2;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.3
//# When persistent congestion is declared, the sender's congestion
//# window MUST be reduced to the minimum congestion window
const LOSS_REDUCTION_FACTOR: u64 = 2;

#[derive(Clone, Debug)]
pub struct CongestionController {
    max_datagram_size: u64,
    congestion_window: u64,
    slow_start_threshold: u64,
    bytes_in_flight: u64,
    /// Acknowledged bytes accumulated toward the next avoidance
    /// increment
    bytes_acked_in_avoidance: u64,
    /// Packets sent before this time do not trigger another reduction
    recovery_start: Option<Timestamp>,
}

impl CongestionController {
    pub fn new(max_datagram_size: u16) -> Self {
        let max_datagram_size = max_datagram_size as u64;
        let initial = (INITIAL_WINDOW_PACKETS * max_datagram_size)
            .min(14_720.max(2 * max_datagram_size));
        Self {
            max_datagram_size,
            congestion_window: initial,
            slow_start_threshold: u64::MAX,
            bytes_in_flight: 0,
            bytes_acked_in_avoidance: 0,
            recovery_start: None,
        }
    }

    #[inline]
    pub fn congestion_window(&self) -> u64 {
        self.congestion_window
    }

    #[inline]
    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// Bytes that may still be sent under the window
    #[inline]
    pub fn available(&self) -> u64 {
        self.congestion_window.saturating_sub(self.bytes_in_flight)
    }

    /// True when nothing more fits in the window
    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.available() < self.max_datagram_size
    }

    #[inline]
    pub fn is_in_slow_start(&self) -> bool {
        self.congestion_window < self.slow_start_threshold
    }

    #[inline]
    fn minimum_window(&self) -> u64 {
        MINIMUM_WINDOW_PACKETS * self.max_datagram_size
    }

    pub fn on_packet_sent(&mut self, bytes: usize) {
        self.bytes_in_flight += bytes as u64;
    }

    /// A previously in-flight packet left the network without being
    /// acknowledged or declared lost (e.g. its space was discarded)
    pub fn on_packet_discarded(&mut self, bytes: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes as u64);
    }

    pub fn on_packet_acked(&mut self, bytes: usize, time_sent: Timestamp) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes as u64);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.2
        //# While in recovery, the congestion window does not increase
        if let Some(recovery_start) = self.recovery_start {
            if time_sent <= recovery_start {
                return;
            }
        }

        if self.is_in_slow_start() {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.1
            //# the congestion window increases by the number of bytes
            //# acknowledged
            self.congestion_window += bytes as u64;
        } else {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.3
            //# a sender could increase the congestion window by
            //# max_datagram_size for each congestion window of data
            //# acknowledged
            self.bytes_acked_in_avoidance += bytes as u64;
            if self.bytes_acked_in_avoidance >= self.congestion_window {
                self.bytes_acked_in_avoidance -= self.congestion_window;
                self.congestion_window += self.max_datagram_size;
            }
        }
    }

    /// Responds to packets declared lost. `persistent` collapses the
    /// window entirely.
    pub fn on_packets_lost(
        &mut self,
        bytes: usize,
        newest_loss_sent: Timestamp,
        persistent: bool,
        now: Timestamp,
    ) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes as u64);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.2
        //# A recovery period ends and the sender enters congestion
        //# avoidance when a packet sent during the recovery period is
        //# acknowledged.
        let already_reducing = self
            .recovery_start
            .map_or(false, |start| newest_loss_sent <= start);

        if !already_reducing {
            self.recovery_start = Some(now);
            self.congestion_window =
                (self.congestion_window / LOSS_REDUCTION_FACTOR).max(self.minimum_window());
            self.slow_start_threshold = self.congestion_window;
            self.bytes_acked_in_avoidance = 0;
        }

        if persistent {
            self.congestion_window = self.minimum_window();
            self.recovery_start = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Timestamp {
        Timestamp::from_micros(ms * 1_000)
    }

    #[test]
    fn slow_start_doubles_per_window() {
        let mut cc = CongestionController::new(1200);
        let initial = cc.congestion_window();

        cc.on_packet_sent(1200);
        cc.on_packet_acked(1200, at(1));
        assert_eq!(cc.congestion_window(), initial + 1200);
        assert!(cc.is_in_slow_start());
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn loss_halves_and_exits_slow_start() {
        let mut cc = CongestionController::new(1200);
        let initial = cc.congestion_window();

        cc.on_packet_sent(1200);
        cc.on_packets_lost(1200, at(1), false, at(10));
        assert_eq!(cc.congestion_window(), initial / 2);
        assert!(!cc.is_in_slow_start());

        // a second loss from before recovery does not reduce again
        cc.on_packet_sent(1200);
        cc.on_packets_lost(1200, at(2), false, at(11));
        assert_eq!(cc.congestion_window(), initial / 2);
    }

    #[test]
    fn persistent_congestion_collapses() {
        let mut cc = CongestionController::new(1200);
        cc.on_packet_sent(1200);
        cc.on_packets_lost(1200, at(1), true, at(10));
        assert_eq!(cc.congestion_window(), 2 * 1200);
    }

    #[test]
    fn avoidance_grows_linearly() {
        let mut cc = CongestionController::new(1200);
        cc.on_packet_sent(1200);
        cc.on_packets_lost(1200, at(1), false, at(2));
        let window = cc.congestion_window();

        // one full window of acks after recovery grows by one datagram
        let mut acked = 0;
        let mut send_time = 3u64;
        while acked < window {
            cc.on_packet_sent(1200);
            cc.on_packet_acked(1200, at(send_time));
            acked += 1200;
            send_time += 1;
        }
        assert!(cc.congestion_window() >= window + 1200);
        assert!(cc.congestion_window() < window + 3 * 1200);
    }

    #[test]
    fn window_gates_sending() {
        let mut cc = CongestionController::new(1200);
        assert!(!cc.is_blocked());
        let window = cc.congestion_window();
        cc.on_packet_sent(window as usize);
        assert!(cc.is_blocked());
        assert_eq!(cc.available(), 0);
    }
}
