// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Outbound stream data: enqueued bytes, the retransmission set, and
//! acknowledgment bookkeeping. Bytes are retained until acknowledged.

use quill_core::range::RangeSet;

#[derive(Default, Debug)]
pub struct SendBuffer {
    /// Unacknowledged bytes from `buffer_offset` onward
    buffer: Vec<u8>,
    /// Stream offset of `buffer[0]`
    buffer_offset: u64,
    /// Offsets queued for (re)transmission
    pending: RangeSet,
    /// Offsets acknowledged by the peer
    acked: RangeSet,
    /// Total bytes enqueued so far
    next_offset: u64,
    fin_offset: Option<u64>,
    fin_pending: bool,
    fin_acked: bool,
}

impl SendBuffer {
    /// Enqueues application bytes; the caller enforces stream-data
    /// admission limits
    pub fn push(&mut self, data: &[u8]) {
        debug_assert!(self.fin_offset.is_none(), "no writes after fin");
        self.buffer.extend_from_slice(data);
        self.pending.add(self.next_offset, data.len() as u64);
        self.next_offset += data.len() as u64;
    }

    /// Marks the end of the stream at the current write offset
    pub fn finish(&mut self) {
        if self.fin_offset.is_none() {
            self.fin_offset = Some(self.next_offset);
            self.fin_pending = true;
        }
    }

    #[inline]
    pub fn total_enqueued(&self) -> u64 {
        self.next_offset
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.fin_offset.is_some()
    }

    #[inline]
    pub fn fin_offset(&self) -> Option<u64> {
        self.fin_offset
    }

    /// True when data (or the FIN) is ready to go out under
    /// `max_send_offset`
    pub fn has_transmittable(&self, max_send_offset: u64) -> bool {
        if let Some(subrange) = self.pending.get(0) {
            if subrange.low < max_send_offset {
                return true;
            }
        }
        self.fin_pending
    }

    /// True when data wants out but the peer's limit stands in the way
    pub fn is_blocked_by_peer(&self, max_send_offset: u64) -> bool {
        match self.pending.get(0) {
            Some(subrange) => subrange.low >= max_send_offset,
            None => false,
        }
    }

    /// The next chunk to transmit, clipped to the peer's flow limit
    /// and `max_len`. Returns `(offset, data, is_fin)`.
    pub fn next_chunk(&self, max_send_offset: u64, max_len: usize) -> Option<(u64, &[u8], bool)> {
        if let Some(subrange) = self.pending.get(0) {
            if subrange.low < max_send_offset {
                let allowed = max_send_offset - subrange.low;
                let len = subrange.count.min(allowed).min(max_len as u64);

                let start = (subrange.low - self.buffer_offset) as usize;
                let data = &self.buffer[start..start + len as usize];

                let end = subrange.low + len;
                let is_fin = self.fin_offset == Some(end) && self.pending.len() == 1
                    && subrange.low + subrange.count == end;
                return Some((subrange.low, data, is_fin));
            }
        }

        // a bare FIN at the end of fully transmitted data
        if self.fin_pending && self.pending.is_empty() {
            return Some((self.fin_offset.unwrap_or(0), &[], true));
        }

        None
    }

    pub fn on_chunk_sent(&mut self, offset: u64, len: usize, fin: bool) {
        if len > 0 {
            let _ = self.pending.remove(offset, len as u64);
        }
        if fin {
            self.fin_pending = false;
        }
    }

    /// Processes a STREAM frame acknowledgment. Returns true when all
    /// data and the FIN are acknowledged.
    pub fn on_frame_acked(&mut self, offset: u64, len: u64, fin: bool) -> bool {
        if len > 0 {
            self.acked.add(offset, len);
            self.release_acked_prefix();
        }
        if fin {
            self.fin_acked = true;
        }
        self.is_fully_acked()
    }

    /// Requeues a lost STREAM frame, excluding anything acked since
    pub fn on_frame_lost(&mut self, offset: u64, len: u64, fin: bool) {
        let mut low = offset;
        let end = offset + len;
        // walk the acked set and re-add the holes
        for subrange in self.acked.iter() {
            if subrange.low >= end || low >= end {
                break;
            }
            if subrange.high() < low {
                continue;
            }
            if subrange.low > low {
                self.pending.add(low, subrange.low - low);
            }
            low = low.max(subrange.low + subrange.count);
        }
        if low < end {
            self.pending.add(low, end - low);
        }
        if fin && !self.fin_acked {
            self.fin_pending = true;
        }
    }

    #[inline]
    pub fn is_fully_acked(&self) -> bool {
        let Some(fin_offset) = self.fin_offset else {
            return false;
        };
        if !self.fin_acked {
            return false;
        }
        if fin_offset == 0 {
            return true;
        }
        matches!(
            self.acked.get(0),
            Some(subrange) if subrange.low == 0 && subrange.count >= fin_offset
        )
    }

    /// Frees buffered bytes that are contiguously acknowledged
    fn release_acked_prefix(&mut self) {
        let Some(first) = self.acked.get(0) else {
            return;
        };
        if first.low > self.buffer_offset {
            return;
        }
        let acked_end = first.low + first.count;
        if acked_end <= self.buffer_offset {
            return;
        }
        let release = (acked_end - self.buffer_offset) as usize;
        self.buffer.drain(..release.min(self.buffer.len()));
        self.buffer_offset = acked_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_send_ack_cycle() {
        let mut buffer = SendBuffer::default();
        buffer.push(b"hello world");

        let (offset, data, fin) = buffer.next_chunk(u64::MAX, 1024).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(data, b"hello world");
        assert!(!fin);

        buffer.on_chunk_sent(0, 11, false);
        assert!(!buffer.has_transmittable(u64::MAX));

        buffer.finish();
        let (offset, data, fin) = buffer.next_chunk(u64::MAX, 1024).unwrap();
        assert_eq!(offset, 11);
        assert!(data.is_empty());
        assert!(fin);
        buffer.on_chunk_sent(11, 0, true);

        assert!(!buffer.on_frame_acked(0, 11, false));
        assert!(buffer.on_frame_acked(11, 0, true));
        assert!(buffer.is_fully_acked());
    }

    #[test]
    fn flow_limit_clips_chunks() {
        let mut buffer = SendBuffer::default();
        buffer.push(&[0xaa; 100]);

        let (_, data, _) = buffer.next_chunk(40, 1024).unwrap();
        assert_eq!(data.len(), 40);
        buffer.on_chunk_sent(0, 40, false);

        assert!(buffer.is_blocked_by_peer(40));
        assert!(!buffer.has_transmittable(40));
        assert!(buffer.has_transmittable(41));
    }

    #[test]
    fn lost_ranges_requeue_around_acks() {
        let mut buffer = SendBuffer::default();
        buffer.push(&[0xbb; 100]);
        buffer.on_chunk_sent(0, 100, false);

        // the middle got acked via a later retransmission
        buffer.on_frame_acked(40, 20, false);

        buffer.on_frame_lost(0, 100, false);
        let (offset, data, _) = buffer.next_chunk(u64::MAX, 1024).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(data.len(), 40);
        buffer.on_chunk_sent(0, 40, false);

        let (offset, data, _) = buffer.next_chunk(u64::MAX, 1024).unwrap();
        assert_eq!(offset, 60);
        assert_eq!(data.len(), 40);
    }

    #[test]
    fn acked_prefix_releases_memory() {
        let mut buffer = SendBuffer::default();
        buffer.push(&[1; 50]);
        buffer.push(&[2; 50]);
        buffer.on_chunk_sent(0, 100, false);

        buffer.on_frame_acked(0, 60, false);
        assert_eq!(buffer.buffer.len(), 40);
        assert_eq!(buffer.buffer_offset, 60);

        // an ack for released bytes is harmless
        buffer.on_frame_acked(10, 20, false);
        assert_eq!(buffer.buffer_offset, 60);
    }

    #[test]
    fn empty_stream_fin() {
        let mut buffer = SendBuffer::default();
        buffer.finish();
        let (offset, data, fin) = buffer.next_chunk(u64::MAX, 1024).unwrap();
        assert_eq!(offset, 0);
        assert!(data.is_empty());
        assert!(fin);
        buffer.on_chunk_sent(0, 0, true);
        assert!(buffer.on_frame_acked(0, 0, true));
    }
}
