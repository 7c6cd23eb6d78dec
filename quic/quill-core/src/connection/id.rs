// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection IDs
//!
//! An opaque byte string of 0 to 20 bytes, stored inline. Locally
//! issued IDs reserve a byte at a fixed index for the worker-partition
//! hint; that policy lives with the transport's CID controller, the
//! type here is just the container.

use core::{fmt, hash::{Hash, Hasher}};
use s2n_codec::{decoder_value, DecoderError, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# In QUIC version 1, this value MUST NOT exceed 20 bytes.
pub const MAX_LEN: usize = 20;

/// The index of the worker-partition hint byte in locally issued IDs
pub const PARTITION_INDEX: usize = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Error;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid connection id length")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// A QUIC connection ID
#[derive(Clone, Copy, Eq)]
pub struct ConnectionId {
    bytes: [u8; MAX_LEN],
    len: u8,
}

impl ConnectionId {
    pub const EMPTY: Self = Self {
        bytes: [0; MAX_LEN],
        len: 0,
    };

    #[inline]
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, Error> {
        if slice.len() > MAX_LEN {
            return Err(Error);
        }
        let mut bytes = [0; MAX_LEN];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(Self {
            bytes,
            len: slice.len() as u8,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len()]
    }

    /// The worker-partition hint byte, if the ID is long enough to
    /// carry one
    #[inline]
    pub fn partition_byte(&self) -> Option<u8> {
        self.as_bytes().get(PARTITION_INDEX).copied()
    }
}

impl Default for ConnectionId {
    #[inline]
    fn default() -> Self {
        Self::EMPTY
    }
}

impl AsRef<[u8]> for ConnectionId {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl PartialEq for ConnectionId {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Hash for ConnectionId {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x")?;
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl TryFrom<&[u8]> for ConnectionId {
    type Error = Error;

    #[inline]
    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Self::try_from_slice(slice)
    }
}

decoder_value!(
    impl<'a> ConnectionId {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (slice, buffer) = buffer.decode_slice_with_len_prefix::<u8>()?;
            let id = Self::try_from_slice(slice.as_less_safe_slice())
                .map_err(|_| DecoderError::InvariantViolation("invalid connection id"))?;
            Ok((id, buffer))
        }
    }
);

impl EncoderValue for ConnectionId {
    /// Encodes the ID with its one-byte length prefix, the layout used
    /// by long headers and NEW_CONNECTION_ID frames
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&(self.len() as u8));
        encoder.write_slice(self.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s2n_codec::{DecoderBuffer, EncoderBuffer};

    #[test]
    fn length_bounds() {
        assert!(ConnectionId::try_from_slice(&[0u8; MAX_LEN]).is_ok());
        assert!(ConnectionId::try_from_slice(&[0u8; MAX_LEN + 1]).is_err());
        assert!(ConnectionId::try_from_slice(&[]).unwrap().is_empty());
    }

    #[test]
    fn prefixed_round_trip() {
        let id = ConnectionId::try_from_slice(&[1, 2, 3, 4, 5]).unwrap();
        let mut bytes = [0u8; MAX_LEN + 1];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&id);
        let len = encoder.len();
        assert_eq!(len, 6);

        let (decoded, remaining) = DecoderBuffer::new(&bytes[..len])
            .decode::<ConnectionId>()
            .unwrap();
        assert!(remaining.is_empty());
        assert_eq!(decoded, id);
    }

    #[test]
    fn oversized_decode_fails() {
        let mut bytes = [0u8; 32];
        bytes[0] = 21;
        assert!(DecoderBuffer::new(&bytes).decode::<ConnectionId>().is_err());
    }
}
