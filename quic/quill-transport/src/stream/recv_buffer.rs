// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inbound stream reassembly: gaps-and-data buffering with in-order
//! delivery and final-size enforcement.

use crate::config::REASSEMBLY_RANGE_BYTES;
use quill_core::{range::RangeSet, transport::Error};

#[derive(Debug)]
pub struct RecvBuffer {
    /// Bytes from `read_offset` onward, possibly with unreceived gaps
    buffer: Vec<u8>,
    /// Offset of `buffer[0]`; everything below was delivered
    read_offset: u64,
    /// Offsets received so far (absolute)
    received: RangeSet,
    final_size: Option<u64>,
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            read_offset: 0,
            received: RangeSet::with_max_alloc(REASSEMBLY_RANGE_BYTES),
            final_size: None,
        }
    }
}

impl RecvBuffer {
    /// Buffers a STREAM frame.
    ///
    /// Returns the new high-watermark of received data, used by the
    /// caller for flow-control accounting.
    pub fn write(&mut self, offset: u64, data: &[u8], is_fin: bool) -> Result<u64, Error> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| Error::new(Error::FRAME_ENCODING_ERROR).with_reason("offset overflow"))?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.5
        //# Once a final size for a stream is known, it cannot change.  If a
        //# RESET_STREAM or STREAM frame is received indicating a change in
        //# the final size for the stream, an endpoint MUST respond with an
        //# error of type FINAL_SIZE_ERROR
        if let Some(final_size) = self.final_size {
            if end > final_size || (is_fin && end != final_size) {
                return Err(Error::new(Error::FINAL_SIZE_ERROR));
            }
        }
        if is_fin {
            if self.highest_received() > end {
                return Err(Error::new(Error::FINAL_SIZE_ERROR));
            }
            self.final_size = Some(end);
        }

        if !data.is_empty() && end > self.read_offset {
            // clip off anything already delivered
            let (offset, data) = if offset < self.read_offset {
                let skip = (self.read_offset - offset) as usize;
                (self.read_offset, &data[skip..])
            } else {
                (offset, data)
            };

            let start = (offset - self.read_offset) as usize;
            let needed = start + data.len();
            if self.buffer.len() < needed {
                self.buffer.resize(needed, 0);
            }
            self.buffer[start..needed].copy_from_slice(data);
            self.received.add(offset, data.len() as u64);
        }

        Ok(self.highest_received())
    }

    /// Records the final size from a RESET_STREAM frame
    pub fn on_reset(&mut self, final_size: u64) -> Result<(), Error> {
        if self.highest_received() > final_size {
            return Err(Error::new(Error::FINAL_SIZE_ERROR));
        }
        if let Some(existing) = self.final_size {
            if existing != final_size {
                return Err(Error::new(Error::FINAL_SIZE_ERROR));
            }
        }
        self.final_size = Some(final_size);
        Ok(())
    }

    /// The highest offset seen on this stream, for flow accounting
    #[inline]
    pub fn highest_received(&self) -> u64 {
        self.received
            .max_value()
            .map(|high| high + 1)
            .unwrap_or(self.read_offset)
            .max(self.read_offset)
            .max(self.final_size.unwrap_or(0))
    }

    #[inline]
    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    /// Bytes delivered to the application so far
    #[inline]
    pub fn bytes_read(&self) -> u64 {
        self.read_offset
    }

    /// Length of the contiguous run available for reading
    pub fn readable_len(&self) -> usize {
        match self.received.get(0) {
            Some(first) if first.low <= self.read_offset => {
                (first.low + first.count - self.read_offset) as usize
            }
            _ => 0,
        }
    }

    /// True when every byte up to the final size has arrived
    pub fn is_complete(&self) -> bool {
        match self.final_size {
            Some(final_size) => self.read_offset + self.readable_len() as u64 >= final_size,
            None => false,
        }
    }

    /// True when the application consumed everything
    pub fn is_fully_read(&self) -> bool {
        matches!(self.final_size, Some(final_size) if self.read_offset >= final_size)
    }

    /// Copies readable bytes into `out`; returns `(copied, at_fin)`
    pub fn read(&mut self, out: &mut [u8]) -> (usize, bool) {
        let available = self.readable_len().min(out.len());
        if available > 0 {
            out[..available].copy_from_slice(&self.buffer[..available]);
            self.buffer.drain(..available);
            self.read_offset += available as u64;
            let _ = self.received.remove(
                self.read_offset - available as u64,
                available as u64,
            );
        }
        (available, self.is_fully_read())
    }

    /// Takes the full readable run
    pub fn read_all(&mut self) -> (Vec<u8>, bool) {
        let len = self.readable_len();
        let mut out = vec![0u8; len];
        let (copied, fin) = self.read(&mut out);
        debug_assert_eq!(copied, len);
        (out, fin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_delivery() {
        let mut buffer = RecvBuffer::default();
        buffer.write(0, b"hel", false).unwrap();
        buffer.write(3, b"lo", true).unwrap();

        assert_eq!(buffer.final_size(), Some(5));
        assert!(buffer.is_complete());

        let (data, fin) = buffer.read_all();
        assert_eq!(data, b"hello");
        assert!(fin);
        assert!(buffer.is_fully_read());
    }

    #[test]
    fn out_of_order_reassembly() {
        let mut buffer = RecvBuffer::default();
        buffer.write(6, b"world", false).unwrap();
        assert_eq!(buffer.readable_len(), 0);
        assert_eq!(buffer.highest_received(), 11);

        buffer.write(0, b"hello ", false).unwrap();
        let (data, fin) = buffer.read_all();
        assert_eq!(data, b"hello world");
        assert!(!fin);
    }

    #[test]
    fn duplicate_and_overlapping_frames() {
        let mut buffer = RecvBuffer::default();
        buffer.write(0, b"abcdef", false).unwrap();
        // retransmission overlapping delivered data
        let mut out = [0u8; 3];
        buffer.read(&mut out);
        assert_eq!(&out, b"abc");

        buffer.write(0, b"abcdef", false).unwrap();
        let (data, _) = buffer.read_all();
        assert_eq!(data, b"def");
    }

    #[test]
    fn final_size_violations() {
        let mut buffer = RecvBuffer::default();
        buffer.write(0, b"12345", true).unwrap();

        // data past the final size
        let error = buffer.write(5, b"6", false).unwrap_err();
        assert_eq!(error.code, Error::FINAL_SIZE_ERROR);

        // a different final size
        let error = buffer.write(0, b"123", true).unwrap_err();
        assert_eq!(error.code, Error::FINAL_SIZE_ERROR);

        // a reset announcing a smaller final size
        let error = buffer.on_reset(3).unwrap_err();
        assert_eq!(error.code, Error::FINAL_SIZE_ERROR);
        assert!(buffer.on_reset(5).is_ok());
    }
}
