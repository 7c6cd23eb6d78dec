// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

//= https://www.rfc-editor.org/rfc/rfc9001#section-4.8
//# QUIC is only able to convey an alert level of "fatal".

/// A TLS alert carried in the 0x1XX transport error space
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CryptoError {
    pub code: u8,
    pub reason: &'static str,
}

impl CryptoError {
    pub const fn new(code: u8) -> Self {
        Self { code, reason: "" }
    }

    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }
}

impl fmt::Debug for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut d = f.debug_struct("CryptoError");
        d.field("code", &self.code);
        if !self.reason.is_empty() {
            d.field("reason", &self.reason);
        }
        d.finish()
    }
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "crypto alert {}", self.code)
        } else {
            f.write_str(self.reason)
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CryptoError {}

macro_rules! alert {
    ($(#[doc = $doc:literal])* $name:ident, $code:expr) => {
        impl CryptoError {
            $(#[doc = $doc])*
            pub const $name: Self = Self::new($code);
        }
    };
}

alert!(CLOSE_NOTIFY, 0);
alert!(UNEXPECTED_MESSAGE, 10);
alert!(BAD_RECORD_MAC, 20);
alert!(
    /// AEAD open failed; also used for malformed protected input
    DECODE_ERROR,
    50
);
alert!(DECRYPT_ERROR, 51);
alert!(INTERNAL_ERROR, 80);
alert!(MISSING_EXTENSION, 109);
alert!(UNSUPPORTED_EXTENSION, 110);
alert!(NO_APPLICATION_PROTOCOL, 120);

impl From<ring::error::Unspecified> for CryptoError {
    fn from(_: ring::error::Unspecified) -> Self {
        Self::DECRYPT_ERROR
    }
}
