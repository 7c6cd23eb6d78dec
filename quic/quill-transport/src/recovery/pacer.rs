// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Token-bucket pacing fed by the congestion window over the smoothed
//! RTT.

use core::time::Duration;
use quill_core::time::Timestamp;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.7
//# rate = N * congestion_window / smoothed_rtt
//
// N > 1 lets the sender catch up after idle periods and keeps pacing
// from becoming the bottleneck at steady state.
const RATE_NUMERATOR: u64 = 5;
const RATE_DENOMINATOR: u64 = 4;

/// Burst allowance when the bucket is full
const BURST_DATAGRAMS: u64 = 10;

#[derive(Clone, Debug)]
pub struct Pacer {
    capacity: u64,
    tokens: u64,
    last_refill: Option<Timestamp>,
    max_datagram_size: u64,
}

impl Pacer {
    pub fn new(max_datagram_size: u16) -> Self {
        let capacity = BURST_DATAGRAMS * max_datagram_size as u64;
        Self {
            capacity,
            tokens: capacity,
            last_refill: None,
            max_datagram_size: max_datagram_size as u64,
        }
    }

    /// Bytes per second the bucket refills at
    #[inline]
    fn rate(congestion_window: u64, smoothed_rtt: Duration) -> u64 {
        let rtt_micros = smoothed_rtt.as_micros().max(1) as u64;
        (congestion_window * RATE_NUMERATOR * 1_000_000) / (RATE_DENOMINATOR * rtt_micros)
    }

    fn refill(&mut self, now: Timestamp, congestion_window: u64, smoothed_rtt: Duration) {
        let elapsed = match self.last_refill {
            Some(last) => now.saturating_duration_since(last),
            None => Duration::ZERO,
        };
        self.last_refill = Some(now);

        let rate = Self::rate(congestion_window, smoothed_rtt);
        let new_tokens = (rate as u128 * elapsed.as_micros()) / 1_000_000;
        self.tokens = self
            .tokens
            .saturating_add(new_tokens.min(u64::MAX as u128) as u64)
            .min(self.capacity);
    }

    /// Tries to consume tokens for one datagram of `bytes`.
    ///
    /// Returns `None` when the datagram may be sent now, or the delay
    /// until enough tokens accumulate.
    pub fn on_datagram(
        &mut self,
        now: Timestamp,
        bytes: usize,
        congestion_window: u64,
        smoothed_rtt: Duration,
    ) -> Option<Duration> {
        self.refill(now, congestion_window, smoothed_rtt);

        let bytes = bytes as u64;
        if self.tokens >= bytes {
            self.tokens -= bytes;
            return None;
        }

        let deficit = bytes - self.tokens;
        let rate = Self::rate(congestion_window, smoothed_rtt).max(1);
        let wait_micros = (deficit as u128 * 1_000_000).div_ceil(rate as u128);
        Some(Duration::from_micros(wait_micros as u64))
    }

    /// Forgets accumulated debt, e.g. after an idle period
    pub fn reset(&mut self) {
        self.tokens = self.capacity.max(self.max_datagram_size);
        self.last_refill = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MTU: usize = 1200;

    fn at(us: u64) -> Timestamp {
        Timestamp::from_micros(us)
    }

    #[test]
    fn burst_then_paced() {
        let mut pacer = Pacer::new(MTU as u16);
        let cwnd = 12_000u64;
        let rtt = Duration::from_millis(100);

        // the initial burst allowance flows without delay
        for _ in 0..BURST_DATAGRAMS {
            assert_eq!(pacer.on_datagram(at(0), MTU, cwnd, rtt), None);
        }

        // the next datagram must wait for the bucket
        let delay = pacer.on_datagram(at(0), MTU, cwnd, rtt).unwrap();
        assert!(delay > Duration::ZERO);
        // rate = 1.25 * 12000 bytes / 100ms = 150 bytes/ms; one 1200
        // byte datagram every 8ms
        assert!(delay <= Duration::from_millis(9), "{delay:?}");
    }

    #[test]
    fn tokens_refill_over_time() {
        let mut pacer = Pacer::new(MTU as u16);
        let cwnd = 12_000u64;
        let rtt = Duration::from_millis(100);

        for _ in 0..BURST_DATAGRAMS {
            pacer.on_datagram(at(0), MTU, cwnd, rtt);
        }
        assert!(pacer.on_datagram(at(0), MTU, cwnd, rtt).is_some());

        // 10ms later there is room for one more
        assert_eq!(pacer.on_datagram(at(10_000), MTU, cwnd, rtt), None);
    }

    #[test]
    fn reset_restores_burst() {
        let mut pacer = Pacer::new(MTU as u16);
        let cwnd = 12_000u64;
        let rtt = Duration::from_millis(100);
        for _ in 0..BURST_DATAGRAMS {
            pacer.on_datagram(at(0), MTU, cwnd, rtt);
        }
        pacer.reset();
        assert_eq!(pacer.on_datagram(at(0), MTU, cwnd, rtt), None);
    }
}
