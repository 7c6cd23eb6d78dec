// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream state: one [`Stream`] per ID with both directions' buffers
//! and state machines, plus the [`set::StreamSet`] bookkeeping the
//! whole collection.

pub mod recv_buffer;
pub mod send_buffer;
pub mod set;

pub use recv_buffer::RecvBuffer;
pub use send_buffer::SendBuffer;
pub use set::StreamSet;

use quill_core::{
    endpoint,
    stream::{
        state::{Receiver, Sender},
        StreamId,
    },
    transport::Error,
    varint::VarInt,
};

/// Application-facing stream operation failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiError {
    /// The operation is not valid in the stream's current state
    InvalidState,
    /// The peer's stream limit blocks opening the stream
    StreamLimitReached,
    /// The peer reset the stream
    Reset(VarInt),
}

impl core::fmt::Display for ApiError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::InvalidState => write!(f, "invalid stream state"),
            Self::StreamLimitReached => write!(f, "peer stream limit reached"),
            Self::Reset(code) => write!(f, "stream reset by peer with code {code}"),
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    send_enabled: bool,
    recv_enabled: bool,

    pub send_state: Sender,
    pub recv_state: Receiver,
    pub send: SendBuffer,
    pub recv: RecvBuffer,

    /// Peer's current allowance for our sending
    pub max_send_offset: u64,
    /// Our announced allowance for the peer
    pub max_recv_offset: u64,
    recv_window: u64,

    /// MAX_STREAM_DATA should be emitted
    pub pending_max_stream_data: bool,
    /// STREAM_DATA_BLOCKED should be emitted with this limit
    pub pending_stream_data_blocked: Option<u64>,
    /// RESET_STREAM should be emitted with this code
    pub pending_reset: Option<VarInt>,
    /// The code a queued/sent RESET_STREAM carries, for retransmission
    reset_code: Option<VarInt>,
    /// STOP_SENDING should be emitted with this code
    pub pending_stop_sending: Option<VarInt>,
    /// The code a queued/sent STOP_SENDING carries
    stop_sending_code: Option<VarInt>,

    /// Error the peer reset the stream with
    pub peer_reset_error: Option<VarInt>,

    /// The stream sits in the connection's send queue
    pub in_send_queue: bool,

    /// Highest offset charged against connection-level flow control
    pub tx_flow_charged: u64,
}

impl Stream {
    pub fn new(
        id: StreamId,
        local_role: endpoint::Type,
        max_send_offset: u64,
        recv_window: u64,
    ) -> Self {
        let bidi = id.stream_type().is_bidirectional();
        let local = id.initiator() == local_role;
        Self {
            id,
            send_enabled: bidi || local,
            recv_enabled: bidi || !local,
            send_state: Sender::default(),
            recv_state: Receiver::default(),
            send: SendBuffer::default(),
            recv: RecvBuffer::default(),
            max_send_offset,
            max_recv_offset: recv_window,
            recv_window,
            pending_max_stream_data: false,
            pending_stream_data_blocked: None,
            pending_reset: None,
            reset_code: None,
            pending_stop_sending: None,
            stop_sending_code: None,
            peer_reset_error: None,
            in_send_queue: false,
            tx_flow_charged: 0,
        }
    }

    #[inline]
    pub fn is_send_enabled(&self) -> bool {
        self.send_enabled
    }

    #[inline]
    pub fn is_recv_enabled(&self) -> bool {
        self.recv_enabled
    }

    /// Both halves have nothing more to do
    pub fn is_terminal(&self) -> bool {
        (!self.send_enabled || self.send_state.is_terminal())
            && (!self.recv_enabled || self.recv_state.is_terminal())
    }

    // === application operations ===

    pub fn write(&mut self, data: &[u8], fin: bool) -> Result<(), ApiError> {
        if !self.send_enabled || self.send.is_finished() {
            return Err(ApiError::InvalidState);
        }
        if self.send_state.is_resetting() || self.send_state.is_terminal() {
            return Err(ApiError::InvalidState);
        }

        if !data.is_empty() {
            self.send.push(data);
            let _ = self.send_state.on_send_stream();
        }
        if fin {
            self.send.finish();
        }
        Ok(())
    }

    pub fn read(&mut self, out: &mut [u8]) -> Result<(usize, bool), ApiError> {
        if !self.recv_enabled {
            return Err(ApiError::InvalidState);
        }
        if let Some(code) = self.peer_reset_error {
            let _ = self.recv_state.on_reset_read();
            return Err(ApiError::Reset(code));
        }

        let (copied, at_fin) = self.recv.read(out);
        if at_fin {
            let _ = self.recv_state.on_all_data_read();
        } else if copied > 0 {
            self.update_recv_window();
        }
        Ok((copied, at_fin))
    }

    /// Abruptly terminates the send side
    pub fn reset(&mut self, code: VarInt) -> Result<(), ApiError> {
        if !self.send_enabled {
            return Err(ApiError::InvalidState);
        }
        if self.send_state.on_send_reset().is_err() {
            return Err(ApiError::InvalidState);
        }
        // on_send_reset already moved to ResetSent; the frame itself
        // still needs to go out
        self.pending_reset = Some(code);
        self.reset_code = Some(code);
        Ok(())
    }

    /// Asks the peer to stop sending
    pub fn stop_sending(&mut self, code: VarInt) -> Result<(), ApiError> {
        if !self.recv_enabled || self.recv_state.is_terminal() {
            return Err(ApiError::InvalidState);
        }
        self.pending_stop_sending = Some(code);
        self.stop_sending_code = Some(code);
        Ok(())
    }

    // === frame handlers ===

    /// Handles a STREAM frame. Returns the growth of the highest
    /// received offset, for connection-level flow accounting.
    pub fn on_stream_frame(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<u64, Error> {
        if !self.recv_enabled {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-4.2
            //# An endpoint that receives a RESET_STREAM frame, or a STREAM
            //# frame ... for a send-only stream MUST terminate the
            //# connection with error STREAM_STATE_ERROR.
            return Err(Error::new(Error::STREAM_STATE_ERROR)
                .with_reason("stream frame on send-only stream"));
        }
        if self.recv_state.is_reset() {
            // data after a reset carries no information
            return Ok(0);
        }

        let before = self.recv.highest_received();
        let end = offset.saturating_add(data.len() as u64);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A receiver MUST close the connection with an error of type
        //# FLOW_CONTROL_ERROR if the sender violates the advertised
        //# connection or stream data limits
        if end > self.max_recv_offset {
            return Err(Error::new(Error::FLOW_CONTROL_ERROR));
        }

        let after = self.recv.write(offset, data, fin)?;

        if fin {
            let _ = self.recv_state.on_fin_received();
        }
        if self.recv.is_complete() {
            let _ = self.recv_state.on_all_data_received();
        }

        Ok(after.saturating_sub(before))
    }

    pub fn on_reset_frame(&mut self, code: VarInt, final_size: u64) -> Result<u64, Error> {
        if !self.recv_enabled {
            return Err(Error::new(Error::STREAM_STATE_ERROR)
                .with_reason("reset on send-only stream"));
        }
        if final_size > self.max_recv_offset {
            return Err(Error::new(Error::FLOW_CONTROL_ERROR));
        }

        let before = self.recv.highest_received();
        self.recv.on_reset(final_size)?;
        let growth = final_size.saturating_sub(before);

        if self.recv_state.on_reset_received().is_ok() {
            self.peer_reset_error = Some(code);
        }
        Ok(growth)
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-3.5
    //# A STOP_SENDING frame requests that the receiving endpoint send a
    //# RESET_STREAM frame.
    pub fn on_stop_sending_frame(&mut self, code: VarInt) -> Result<(), Error> {
        if !self.send_enabled {
            return Err(Error::new(Error::STREAM_STATE_ERROR)
                .with_reason("stop_sending on receive-only stream"));
        }
        if self.send_state.on_send_reset().is_ok() {
            self.pending_reset = Some(code);
            self.reset_code = Some(code);
        }
        Ok(())
    }

    pub fn on_max_stream_data_frame(&mut self, limit: u64) -> bool {
        if !self.send_enabled {
            // tolerated on receive-only bidirectional halves; ignored
            return false;
        }
        if limit > self.max_send_offset {
            self.max_send_offset = limit;
            self.pending_stream_data_blocked = None;
            return true;
        }
        false
    }

    pub fn on_stream_data_blocked_frame(&mut self) {
        // informational; accepting it keeps the ACK machinery honest
    }

    // === acknowledgment plumbing ===

    pub fn on_stream_frame_acked(&mut self, offset: u64, len: u64, fin: bool) {
        if self.send.on_frame_acked(offset, len, fin) {
            let _ = self.send_state.on_all_data_acked();
        }
    }

    pub fn on_stream_frame_lost(&mut self, offset: u64, len: u64, fin: bool) {
        if self.send_state.is_resetting() {
            return;
        }
        self.send.on_frame_lost(offset, len, fin);
    }

    pub fn on_reset_frame_acked(&mut self) {
        let _ = self.send_state.on_reset_acked();
    }

    pub fn on_reset_frame_lost(&mut self) {
        if self.send_state.is_reset_sent() {
            self.pending_reset = self.reset_code;
        }
    }

    pub fn on_stop_sending_frame_lost(&mut self) {
        if !self.recv_state.is_terminal() && !self.recv_state.is_reset() {
            self.pending_stop_sending = self.stop_sending_code;
        }
    }

    // === send-side queries for the flush path ===

    /// Work that requires this stream to appear in the send queue
    pub fn has_send_work(&self) -> bool {
        if self.pending_reset.is_some()
            || self.pending_stop_sending.is_some()
            || self.pending_max_stream_data
            || self.pending_stream_data_blocked.is_some()
        {
            return true;
        }
        if self.send_enabled && !self.send_state.is_resetting() {
            return self.send.has_transmittable(self.max_send_offset);
        }
        false
    }

    /// Marks the FIN/data transmission progress into the state machine
    pub fn on_stream_chunk_sent(&mut self, offset: u64, len: usize, fin: bool) {
        self.send.on_chunk_sent(offset, len, fin);
        if fin {
            let _ = self.send_state.on_send_fin();
        } else {
            let _ = self.send_state.on_send_stream();
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A sender SHOULD send a STREAM_DATA_BLOCKED or DATA_BLOCKED frame
        //# to indicate to its peer that it is blocked by flow control
        if self.send.is_blocked_by_peer(self.max_send_offset) {
            self.pending_stream_data_blocked = Some(self.max_send_offset);
        }
    }

    // === receive window management ===

    /// Emit MAX_STREAM_DATA once half the window is consumed
    fn update_recv_window(&mut self) {
        if !self.recv_enabled || self.recv.final_size().is_some() {
            return;
        }
        let target = self.recv.bytes_read() + self.recv_window;
        if target >= self.max_recv_offset + self.recv_window / 2 {
            self.pending_max_stream_data = true;
        }
    }

    /// The limit to announce in MAX_STREAM_DATA
    pub fn next_max_stream_data(&self) -> u64 {
        self.recv.bytes_read() + self.recv_window
    }

    pub fn on_max_stream_data_sent(&mut self, limit: u64) {
        self.max_recv_offset = self.max_recv_offset.max(limit);
        self.pending_max_stream_data = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bidi_stream() -> Stream {
        Stream::new(
            StreamId::from_varint(VarInt::from_u8(0)),
            endpoint::Type::Client,
            1000,
            1000,
        )
    }

    #[test]
    fn write_then_fin_reaches_data_recvd() {
        let mut stream = bidi_stream();
        stream.write(b"hello", true).unwrap();
        assert!(stream.has_send_work());

        let (offset, data, fin) = stream.send.next_chunk(stream.max_send_offset, 1024).unwrap();
        assert_eq!((offset, data, fin), (0, &b"hello"[..], true));
        stream.on_stream_chunk_sent(0, 5, true);
        assert!(stream.send_state.is_data_sent());

        stream.on_stream_frame_acked(0, 5, true);
        assert!(stream.send_state.is_terminal());
    }

    #[test]
    fn recv_flow_control_enforced() {
        let mut stream = bidi_stream();
        let error = stream
            .on_stream_frame(990, &[0u8; 20], false)
            .unwrap_err();
        assert_eq!(error.code, Error::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn peer_reset_surfaces_on_read() {
        let mut stream = bidi_stream();
        stream.on_stream_frame(0, b"partial", false).unwrap();
        stream.on_reset_frame(VarInt::from_u8(9), 7).unwrap();

        let mut out = [0u8; 16];
        let error = stream.read(&mut out).unwrap_err();
        assert_eq!(error, ApiError::Reset(VarInt::from_u8(9)));
        assert!(stream.recv_state.is_terminal());
    }

    #[test]
    fn stop_sending_triggers_reset() {
        let mut stream = bidi_stream();
        stream.write(b"data", false).unwrap();
        stream.on_stop_sending_frame(VarInt::from_u8(3)).unwrap();
        assert_eq!(stream.pending_reset, Some(VarInt::from_u8(3)));
        assert!(stream.send_state.is_reset_sent());
    }

    #[test]
    fn window_replenishes_at_half() {
        let mut stream = bidi_stream();
        stream.on_stream_frame(0, &[0u8; 600], false).unwrap();

        let mut out = [0u8; 600];
        stream.read(&mut out).unwrap();
        assert!(stream.pending_max_stream_data);
        assert_eq!(stream.next_max_stream_data(), 1600);

        stream.on_max_stream_data_sent(1600);
        assert!(!stream.pending_max_stream_data);
        assert_eq!(stream.max_recv_offset, 1600);
    }

    #[test]
    fn blocked_by_peer_limit() {
        let mut stream = Stream::new(
            StreamId::from_varint(VarInt::from_u8(0)),
            endpoint::Type::Client,
            10,
            1000,
        );
        stream.write(&[0u8; 50], false).unwrap();
        let (_, data, _) = stream.send.next_chunk(stream.max_send_offset, 1024).unwrap();
        assert_eq!(data.len(), 10);
        stream.on_stream_chunk_sent(0, 10, false);
        assert_eq!(stream.pending_stream_data_blocked, Some(10));

        assert!(stream.on_max_stream_data_frame(100));
        assert_eq!(stream.pending_stream_data_blocked, None);
        assert!(stream.has_send_work());
    }

    #[test]
    fn frames_on_wrong_direction_are_errors() {
        // client uni stream 2: send-only from the client's view
        let mut stream = Stream::new(
            StreamId::from_varint(VarInt::from_u8(2)),
            endpoint::Type::Client,
            1000,
            1000,
        );
        assert!(!stream.is_recv_enabled());
        let error = stream.on_stream_frame(0, b"x", false).unwrap_err();
        assert_eq!(error.code, Error::STREAM_STATE_ERROR);

        // and the mirror: reading it is an API misuse
        let mut out = [0u8; 4];
        assert_eq!(stream.read(&mut out).unwrap_err(), ApiError::InvalidState);
    }
}
