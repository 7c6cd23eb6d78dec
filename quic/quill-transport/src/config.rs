// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection and endpoint settings.
//!
//! Everything a connection consumes read-only at runtime: timeouts,
//! flow-control windows, stream budgets, retry policy. Built once,
//! validated, and shared.

use core::time::Duration;
use quill_core::varint::VarInt;

/// Bytes of subrange storage an ACK tracker may use
pub const ACK_TRACKER_BYTES: usize = 16 * 16;

/// Bytes of subrange storage a receive reassembler may use
pub const REASSEMBLY_RANGE_BYTES: usize = 64 * 16;

/// The QUIC-mandated floor for datagrams carrying Initial packets
pub const MIN_INITIAL_DATAGRAM_LEN: usize = 1200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingsError {
    InvalidIdleTimeout,
    InvalidWindow,
    InvalidStreamCount,
    InvalidBatchSize,
}

impl core::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let reason = match self {
            Self::InvalidIdleTimeout => "idle timeout out of range",
            Self::InvalidWindow => "flow control window out of range",
            Self::InvalidStreamCount => "stream count above 2^60",
            Self::InvalidBatchSize => "send batch size must be 1..=64",
        };
        f.write_str(reason)
    }
}

impl std::error::Error for SettingsError {}

#[derive(Clone, Debug)]
pub struct Settings {
    /// Connection is silently closed after this long without activity;
    /// zero disables
    pub max_idle_timeout: Duration,

    /// Handshakes that do not complete within this window are abandoned
    pub handshake_idle_timeout: Duration,

    /// PING cadence keeping NATs warm; zero disables
    pub keep_alive_interval: Duration,

    /// Our announced maximum ACK delay
    pub max_ack_delay: Duration,

    /// Connection-level receive window
    pub initial_max_data: VarInt,

    /// Per-stream receive windows
    pub initial_max_stream_data_bidi: VarInt,
    pub initial_max_stream_data_uni: VarInt,

    /// Peer-initiated stream budgets
    pub initial_max_streams_bidi: VarInt,
    pub initial_max_streams_uni: VarInt,

    /// Source connection IDs we issue beyond the initial one
    pub active_connection_id_limit: VarInt,

    /// Length of locally issued connection IDs
    pub local_cid_len: usize,

    /// Datagrams built per flush before the connection reschedules
    /// itself; interacts with GSO batch sizes on the datapath
    pub max_send_batch_size: usize,

    /// Path MTU assumed before validation
    pub base_mtu: u16,

    /// Answer new 4-tuples with Retry before committing state
    pub retry_enabled: bool,

    /// Retries answered for a single 4-tuple before dropping
    pub retry_budget: u8,

    /// How long a minted retry token stays valid
    pub retry_token_lifetime: Duration,

    /// Pacing of outgoing packets
    pub pacing_enabled: bool,

    /// Stateless resets sent per second per binding
    pub stateless_reset_rate_limit: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_idle_timeout: Duration::from_secs(30),
            handshake_idle_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::ZERO,
            max_ack_delay: Duration::from_millis(25),
            initial_max_data: VarInt::from_u32(1 << 20),
            initial_max_stream_data_bidi: VarInt::from_u32(64 * 1024),
            initial_max_stream_data_uni: VarInt::from_u32(64 * 1024),
            initial_max_streams_bidi: VarInt::from_u8(100),
            initial_max_streams_uni: VarInt::from_u8(3),
            active_connection_id_limit: VarInt::from_u8(4),
            local_cid_len: 8,
            max_send_batch_size: 10,
            base_mtu: 1280,
            retry_enabled: false,
            retry_budget: 3,
            retry_token_lifetime: Duration::from_secs(30),
            pacing_enabled: true,
            stateless_reset_rate_limit: 20,
        }
    }
}

impl Settings {
    pub fn builder() -> Builder {
        Builder {
            settings: Self::default(),
        }
    }

    fn validate(&self) -> Result<(), SettingsError> {
        // idle timeouts travel as millisecond varints
        for timeout in [self.max_idle_timeout, self.handshake_idle_timeout] {
            if VarInt::new(timeout.as_millis() as u64).is_err() {
                return Err(SettingsError::InvalidIdleTimeout);
            }
        }
        for count in [self.initial_max_streams_bidi, self.initial_max_streams_uni] {
            if count > 1u64 << 60 {
                return Err(SettingsError::InvalidStreamCount);
            }
        }
        if !(1..=64).contains(&self.max_send_batch_size) {
            return Err(SettingsError::InvalidBatchSize);
        }
        if self.local_cid_len == 0 || self.local_cid_len > quill_core::connection::id::MAX_LEN {
            return Err(SettingsError::InvalidWindow);
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Builder {
    settings: Settings,
}

macro_rules! setter {
    ($(#[doc = $doc:literal])* $name:ident, $field:ident, $ty:ty) => {
        $(#[doc = $doc])*
        pub fn $name(mut self, value: $ty) -> Self {
            self.settings.$field = value;
            self
        }
    };
}

impl Builder {
    setter!(with_max_idle_timeout, max_idle_timeout, Duration);
    setter!(with_handshake_idle_timeout, handshake_idle_timeout, Duration);
    setter!(with_keep_alive_interval, keep_alive_interval, Duration);
    setter!(with_max_ack_delay, max_ack_delay, Duration);
    setter!(with_initial_max_data, initial_max_data, VarInt);
    setter!(with_initial_max_stream_data_bidi, initial_max_stream_data_bidi, VarInt);
    setter!(with_initial_max_stream_data_uni, initial_max_stream_data_uni, VarInt);
    setter!(with_initial_max_streams_bidi, initial_max_streams_bidi, VarInt);
    setter!(with_initial_max_streams_uni, initial_max_streams_uni, VarInt);
    setter!(with_active_connection_id_limit, active_connection_id_limit, VarInt);
    setter!(with_local_cid_len, local_cid_len, usize);
    setter!(with_max_send_batch_size, max_send_batch_size, usize);
    setter!(with_base_mtu, base_mtu, u16);
    setter!(with_retry_enabled, retry_enabled, bool);
    setter!(with_retry_budget, retry_budget, u8);
    setter!(with_pacing_enabled, pacing_enabled, bool);

    pub fn build(self) -> Result<Settings, SettingsError> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Settings::builder().build().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            Settings::builder().with_max_send_batch_size(0).build().unwrap_err(),
            SettingsError::InvalidBatchSize
        );
        assert_eq!(
            Settings::builder().with_local_cid_len(21).build().unwrap_err(),
            SettingsError::InvalidWindow
        );
        assert!(Settings::builder()
            .with_initial_max_streams_bidi(VarInt::new((1 << 60) + 1).unwrap())
            .build()
            .is_err());
    }
}
