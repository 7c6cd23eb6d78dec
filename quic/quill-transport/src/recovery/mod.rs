// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Loss recovery primitives: RTT estimation, congestion control and
//! pacing. Loss detection itself runs over the per-space sent-packet
//! stores; see `space`.

pub mod congestion;
pub mod pacer;
pub mod rtt;

pub use congestion::CongestionController;
pub use pacer::Pacer;
pub use rtt::RttEstimator;

use core::time::Duration;

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.1
//# The RECOMMENDED initial value for the packet reordering threshold
//# (kPacketThreshold) is 3, based on best practices for TCP loss
//# detection
pub const K_PACKET_THRESHOLD: u64 = 3;

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
//# The RECOMMENDED time threshold (kTimeThreshold), expressed as an
//# RTT multiplier, is 9/8.
#[inline]
pub fn time_threshold(rtt: Duration) -> Duration {
    let threshold = rtt + rtt / 8;
    threshold.max(K_GRANULARITY)
}

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
//# The RECOMMENDED value of the timer granularity (kGranularity) is 1
//# millisecond.
pub const K_GRANULARITY: Duration = Duration::from_millis(1);

/// Multiplier applied to the PTO for the closing drain period
pub const DRAIN_PTO_MULTIPLIER: u32 = 3;
