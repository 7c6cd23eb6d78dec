// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::recovery::K_GRANULARITY;
use core::time::Duration;

//= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
//# smoothed_rtt = 7/8 * smoothed_rtt + 1/8 * adjusted_rtt
//# rttvar_sample = abs(smoothed_rtt - adjusted_rtt)
//# rttvar = 3/4 * rttvar + 1/4 * rttvar_sample

const INITIAL_RTT: Duration = Duration::from_millis(333);

#[derive(Clone, Debug)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Duration,
    variance: Duration,
    min: Duration,
    has_sample: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# smoothed_rtt = kInitialRtt
        //# rttvar = kInitialRtt / 2
        Self {
            latest: INITIAL_RTT,
            smoothed: INITIAL_RTT,
            variance: INITIAL_RTT / 2,
            min: INITIAL_RTT,
            has_sample: false,
        }
    }
}

impl RttEstimator {
    #[inline]
    pub fn latest(&self) -> Duration {
        self.latest
    }

    #[inline]
    pub fn smoothed(&self) -> Duration {
        self.smoothed
    }

    #[inline]
    pub fn variance(&self) -> Duration {
        self.variance
    }

    #[inline]
    pub fn min(&self) -> Duration {
        self.min
    }

    #[inline]
    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    /// Folds in a sample from an acknowledged ack-eliciting packet.
    ///
    /// `ack_delay` is the peer's decoded ACK delay and `max_ack_delay`
    /// the value it committed to in its transport parameters; the
    /// delay is subtracted when doing so does not take the sample
    /// below the minimum.
    pub fn update(
        &mut self,
        sample: Duration,
        ack_delay: Duration,
        max_ack_delay: Duration,
        handshake_confirmed: bool,
    ) {
        self.latest = sample;

        if !self.has_sample {
            self.has_sample = true;
            self.min = sample;
            self.smoothed = sample;
            self.variance = sample / 2;
            return;
        }

        self.min = self.min.min(sample);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# *  SHOULD ignore the peer's max_ack_delay until the handshake is
        //#    confirmed;
        //#
        //# *  MUST use the lesser of the acknowledgment delay and the peer's
        //#    max_ack_delay after the handshake is confirmed; and
        let mut adjusted = sample;
        let ack_delay = if handshake_confirmed {
            ack_delay.min(max_ack_delay)
        } else {
            Duration::ZERO
        };
        if sample >= self.min + ack_delay {
            adjusted = sample - ack_delay;
        }

        let variance_sample = if self.smoothed > adjusted {
            self.smoothed - adjusted
        } else {
            adjusted - self.smoothed
        };
        self.variance = (self.variance * 3 + variance_sample) / 4;
        self.smoothed = (self.smoothed * 7 + adjusted) / 8;
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
    //# PTO = smoothed_rtt + max(4*rttvar, kGranularity) + max_ack_delay
    #[inline]
    pub fn pto(&self, max_ack_delay: Duration, pto_count: u32) -> Duration {
        let base = self.smoothed + (self.variance * 4).max(K_GRANULARITY) + max_ack_delay;
        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
        //# the PTO backs off exponentially
        base * 2u32.saturating_pow(pto_count.min(16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_ACK_DELAY: Duration = Duration::from_millis(25);

    #[test]
    fn first_sample_initializes() {
        let mut rtt = RttEstimator::default();
        assert!(!rtt.has_sample());

        rtt.update(Duration::from_millis(100), Duration::ZERO, MAX_ACK_DELAY, false);
        assert_eq!(rtt.smoothed(), Duration::from_millis(100));
        assert_eq!(rtt.variance(), Duration::from_millis(50));
        assert_eq!(rtt.min(), Duration::from_millis(100));
    }

    #[test]
    fn smoothing_converges() {
        let mut rtt = RttEstimator::default();
        for _ in 0..100 {
            rtt.update(Duration::from_millis(80), Duration::ZERO, MAX_ACK_DELAY, true);
        }
        let smoothed = rtt.smoothed().as_millis();
        assert!((79..=81).contains(&smoothed));
        assert!(rtt.variance() < Duration::from_millis(2));
    }

    #[test]
    fn ack_delay_subtracted_after_confirmation() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(50), Duration::ZERO, MAX_ACK_DELAY, true);

        rtt.update(
            Duration::from_millis(100),
            Duration::from_millis(20),
            MAX_ACK_DELAY,
            true,
        );
        // adjusted sample was 80ms
        assert!(rtt.smoothed() < Duration::from_millis(80));
    }

    #[test]
    fn ack_delay_capped_at_peer_commitment() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(50), Duration::ZERO, MAX_ACK_DELAY, true);

        // a peer reporting more delay than its max_ack_delay cannot
        // deflate the estimate past the cap
        let mut capped = rtt.clone();
        capped.update(
            Duration::from_millis(100),
            Duration::from_millis(90),
            MAX_ACK_DELAY,
            true,
        );
        let mut honest = rtt.clone();
        honest.update(
            Duration::from_millis(100),
            MAX_ACK_DELAY,
            MAX_ACK_DELAY,
            true,
        );
        assert_eq!(capped.smoothed(), honest.smoothed());

        // before confirmation the reported delay is ignored entirely
        let mut unconfirmed = rtt.clone();
        unconfirmed.update(
            Duration::from_millis(100),
            Duration::from_millis(90),
            MAX_ACK_DELAY,
            false,
        );
        assert!(unconfirmed.smoothed() > capped.smoothed());
    }

    #[test]
    fn pto_backoff() {
        let rtt = RttEstimator::default();
        let base = rtt.pto(Duration::from_millis(25), 0);
        assert_eq!(rtt.pto(Duration::from_millis(25), 1), base * 2);
        assert_eq!(rtt.pto(Duration::from_millis(25), 3), base * 8);
    }
}
