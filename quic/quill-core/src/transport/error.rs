// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{crypto::CryptoError, varint::VarInt};
use core::fmt;
use s2n_codec::DecoderError;

//= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
//# QUIC transport error codes and application error codes are 62-bit
//# unsigned integers.

/// A transport-level error carried in CONNECTION_CLOSE frames of type
/// 0x1c
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Error {
    pub code: VarInt,
    pub frame_type: Option<VarInt>,
    pub reason: &'static str,
}

impl Error {
    pub const fn new(code: VarInt) -> Self {
        Self {
            code,
            frame_type: None,
            reason: "",
        }
    }

    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }

    pub const fn with_frame_type(mut self, frame_type: VarInt) -> Self {
        self.frame_type = Some(frame_type);
        self
    }

    //= https://www.rfc-editor.org/rfc/rfc9001#section-4.8
    //# CRYPTO_ERROR (0x1XX):  The cryptographic handshake failed.  A range
    //# of 256 values is reserved for carrying error codes specific to the
    //# cryptographic handshake that is used.
    #[inline]
    pub const fn crypto_error(alert: u8) -> Self {
        Self::new(VarInt::from_u16(0x100 | alert as u16))
    }

    /// True when the code signals no error (NO_ERROR)
    #[inline]
    pub fn is_no_error(&self) -> bool {
        self.code == Self::NO_ERROR
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut d = f.debug_struct("transport::Error");
        d.field("code", &self.code);
        if let Some(frame_type) = self.frame_type {
            d.field("frame_type", &frame_type);
        }
        if !self.reason.is_empty() {
            d.field("reason", &self.reason);
        }
        d.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "transport error {}", self.code)
        } else {
            f.write_str(self.reason)
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Defines a standard error code constant
macro_rules! def_error {
    ($(#[doc = $doc:literal])* $name:ident, $code:expr) => {
        impl Error {
            $(#[doc = $doc])*
            pub const $name: VarInt = VarInt::from_u8($code);
        }
    };
}

def_error!(
    /// The connection is being closed abruptly in the absence of any
    /// error
    NO_ERROR,
    0x0
);
def_error!(
    /// The endpoint encountered an internal error and cannot continue
    INTERNAL_ERROR,
    0x1
);
def_error!(
    /// The server refused to accept a new connection
    CONNECTION_REFUSED,
    0x2
);
def_error!(
    /// Received more data than permitted in advertised data limits
    FLOW_CONTROL_ERROR,
    0x3
);
def_error!(
    /// Received a frame for a stream identifier above advertised limits
    STREAM_LIMIT_ERROR,
    0x4
);
def_error!(
    /// Received a frame for a stream that was not in a state permitting
    /// it
    STREAM_STATE_ERROR,
    0x5
);
def_error!(
    /// Received data beyond an established final size, or conflicting
    /// final sizes
    FINAL_SIZE_ERROR,
    0x6
);
def_error!(
    /// Received a badly formatted frame
    FRAME_ENCODING_ERROR,
    0x7
);
def_error!(
    /// Received malformed, invalid, duplicate or missing transport
    /// parameters
    TRANSPORT_PARAMETER_ERROR,
    0x8
);
def_error!(
    /// More connection IDs were provided than the advertised limit
    CONNECTION_ID_LIMIT_ERROR,
    0x9
);
def_error!(
    /// A general protocol violation not covered by a more specific code
    PROTOCOL_VIOLATION,
    0xA
);
def_error!(
    /// Received an invalid Retry token
    INVALID_TOKEN,
    0xB
);
def_error!(
    /// The application or application protocol caused the connection to
    /// be closed
    APPLICATION_ERROR,
    0xC
);
def_error!(
    /// More data was received in CRYPTO frames than can be buffered
    CRYPTO_BUFFER_EXCEEDED,
    0xD
);
def_error!(
    /// A key update error was detected
    KEY_UPDATE_ERROR,
    0xE
);
def_error!(
    /// The minimum AEAD confidentiality limit was reached
    AEAD_LIMIT_REACHED,
    0xF
);

//= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
//# An endpoint MUST treat the receipt of a frame of unknown type as a
//# connection error of type FRAME_ENCODING_ERROR.
impl From<DecoderError> for Error {
    fn from(error: DecoderError) -> Self {
        Self::new(Self::FRAME_ENCODING_ERROR).with_reason(error.into())
    }
}

impl From<CryptoError> for Error {
    fn from(error: CryptoError) -> Self {
        Self::crypto_error(error.code).with_reason(error.reason)
    }
}

impl From<crate::varint::VarIntError> for Error {
    fn from(_: crate::varint::VarIntError) -> Self {
        Self::new(Self::INTERNAL_ERROR).with_reason("varint range exceeded")
    }
}

/// Builds a `transport::Error` from a named code, optionally with a
/// reason
#[macro_export]
macro_rules! transport_error {
    ($code:ident) => {
        $crate::transport::Error::new($crate::transport::Error::$code)
    };
    ($code:ident, $reason:expr) => {
        $crate::transport::Error::new($crate::transport::Error::$code).with_reason($reason)
    };
}
