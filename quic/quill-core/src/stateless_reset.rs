// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use s2n_codec::{decoder_value, Encoder, EncoderValue};
use subtle::ConstantTimeEq;

//= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
//# A stateless reset is provided as an option of last resort for an
//# endpoint that does not have access to the state of a connection.

pub const TOKEN_LEN: usize = 16;

/// The minimum UDP payload that can carry a stateless reset: a one-byte
/// header, at least 5 bytes of unpredictable bits, and the token
pub const MIN_RESET_LEN: usize = 1 + 5 + TOKEN_LEN;

/// A 16-byte stateless reset token.
///
/// Tokens are compared in constant time so a lookup keyed on received
/// tokens does not leak which byte mismatched.
#[derive(Clone, Copy, Debug, Eq)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    pub const ZEROED: Self = Self([0; TOKEN_LEN]);

    #[inline]
    pub const fn new(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

impl PartialEq for Token {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl From<[u8; TOKEN_LEN]> for Token {
    #[inline]
    fn from(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Token {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

decoder_value!(
    impl<'a> Token {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (slice, buffer) = buffer.decode_slice(TOKEN_LEN)?;
            let mut bytes = [0u8; TOKEN_LEN];
            bytes.copy_from_slice(slice.as_less_safe_slice());
            Ok((Self(bytes), buffer))
        }
    }
);

impl EncoderValue for Token {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq() {
        let a = Token::new([1; TOKEN_LEN]);
        let b = Token::new([1; TOKEN_LEN]);
        let c = Token::new([2; TOKEN_LEN]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
