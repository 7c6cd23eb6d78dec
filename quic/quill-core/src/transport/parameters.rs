// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport parameter codec.
//!
//! Parameters are carried in the TLS handshake as a sequence of
//! `(id, length, value)` entries. Unknown IDs are skipped; duplicates
//! and out-of-range values are a TRANSPORT_PARAMETER_ERROR.

use crate::{
    connection::ConnectionId,
    stateless_reset,
    transport::Error,
    varint::VarInt,
};
use core::time::Duration;
use s2n_codec::{DecoderBuffer, Encoder, EncoderValue};

const ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0x00;
const MAX_IDLE_TIMEOUT: u64 = 0x01;
const STATELESS_RESET_TOKEN: u64 = 0x02;
const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const INITIAL_MAX_DATA: u64 = 0x04;
const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const ACK_DELAY_EXPONENT: u64 = 0x0a;
const MAX_ACK_DELAY: u64 = 0x0b;
const DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
const INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0f;
const RETRY_SOURCE_CONNECTION_ID: u64 = 0x10;

/// Private parameter carrying opaque QA hooks
const VENDOR_PRIVATE: u64 = 77;

/// Upper bound on the vendor-private payload
pub const VENDOR_PRIVATE_MAX_LEN: usize = 2345;

//= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
//# If present, transport parameters that set initial per-stream flow-
//# control limits (initial_max_stream_data_bidi_local,
//# initial_max_stream_data_bidi_remote, and initial_max_stream_data_uni)
//# are equivalent to sending a MAX_STREAM_DATA frame (Section 19.10) on
//# every stream of the corresponding type immediately after opening.

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportParameters {
    pub original_destination_connection_id: Option<ConnectionId>,
    pub max_idle_timeout: Duration,
    pub stateless_reset_token: Option<stateless_reset::Token>,
    pub max_udp_payload_size: VarInt,
    pub initial_max_data: VarInt,
    pub initial_max_stream_data_bidi_local: VarInt,
    pub initial_max_stream_data_bidi_remote: VarInt,
    pub initial_max_stream_data_uni: VarInt,
    pub initial_max_streams_bidi: VarInt,
    pub initial_max_streams_uni: VarInt,
    pub ack_delay_exponent: u8,
    pub max_ack_delay: Duration,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: VarInt,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
    pub vendor_private: Option<Vec<u8>>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
            //# Idle timeout is disabled when both endpoints omit this
            //# transport parameter or specify a value of 0.
            max_idle_timeout: Duration::ZERO,
            stateless_reset_token: None,
            max_udp_payload_size: VarInt::from_u32(65_527),
            initial_max_data: VarInt::ZERO,
            initial_max_stream_data_bidi_local: VarInt::ZERO,
            initial_max_stream_data_bidi_remote: VarInt::ZERO,
            initial_max_stream_data_uni: VarInt::ZERO,
            initial_max_streams_bidi: VarInt::ZERO,
            initial_max_streams_uni: VarInt::ZERO,
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),
            disable_active_migration: false,
            active_connection_id_limit: VarInt::from_u8(2),
            initial_source_connection_id: None,
            retry_source_connection_id: None,
            vendor_private: None,
        }
    }
}

fn param_error(reason: &'static str) -> Error {
    Error::new(Error::TRANSPORT_PARAMETER_ERROR).with_reason(reason)
}

impl TransportParameters {
    /// Decodes an entire encoded parameter sequence
    pub fn decode(buffer: DecoderBuffer) -> Result<Self, Error> {
        let mut params = Self::default();
        let mut seen = 0u64;
        let mut buffer = buffer;

        while !buffer.is_empty() {
            let (id, remaining) = buffer
                .decode::<VarInt>()
                .map_err(|_| param_error("malformed parameter id"))?;
            let (value, remaining) = remaining
                .decode_slice_with_len_prefix::<VarInt>()
                .map_err(|_| param_error("malformed parameter length"))?;
            buffer = remaining;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4
            //# An endpoint SHOULD treat receipt of duplicate transport
            //# parameters as a connection error of type
            //# TRANSPORT_PARAMETER_ERROR.
            if id.as_u64() < 64 {
                let bit = 1u64 << id.as_u64();
                if seen & bit != 0 {
                    return Err(param_error("duplicate transport parameter"));
                }
                seen |= bit;
            }

            match id.as_u64() {
                ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_connection_id = Some(decode_cid(value)?);
                }
                MAX_IDLE_TIMEOUT => {
                    params.max_idle_timeout = Duration::from_millis(decode_varint(value)?.as_u64());
                }
                STATELESS_RESET_TOKEN => {
                    let (token, rest) = value
                        .decode::<stateless_reset::Token>()
                        .map_err(|_| param_error("malformed stateless reset token"))?;
                    ensure_empty(rest)?;
                    params.stateless_reset_token = Some(token);
                }
                MAX_UDP_PAYLOAD_SIZE => {
                    let size = decode_varint(value)?;
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
                    //# Values below 1200 are invalid.
                    if size < 1200u64 {
                        return Err(param_error("max_udp_payload_size below 1200"));
                    }
                    params.max_udp_payload_size = size;
                }
                INITIAL_MAX_DATA => params.initial_max_data = decode_varint(value)?,
                INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = decode_varint(value)?;
                }
                INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = decode_varint(value)?;
                }
                INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = decode_varint(value)?;
                }
                INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = decode_stream_count(value)?;
                }
                INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = decode_stream_count(value)?;
                }
                ACK_DELAY_EXPONENT => {
                    let exponent = decode_varint(value)?;
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
                    //# Values above 20 are invalid.
                    if exponent > 20u64 {
                        return Err(param_error("ack_delay_exponent above 20"));
                    }
                    params.ack_delay_exponent = exponent.as_u64() as u8;
                }
                MAX_ACK_DELAY => {
                    let delay = decode_varint(value)?;
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
                    //# Values of 2^14 or greater are invalid.
                    if delay >= 1u64 << 14 {
                        return Err(param_error("max_ack_delay out of range"));
                    }
                    params.max_ack_delay = Duration::from_millis(delay.as_u64());
                }
                DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(param_error("disable_active_migration carries a value"));
                    }
                    params.disable_active_migration = true;
                }
                ACTIVE_CONNECTION_ID_LIMIT => {
                    let limit = decode_varint(value)?;
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
                    //# The value of the active_connection_id_limit parameter MUST
                    //# be at least 2.
                    if limit < 2u64 {
                        return Err(param_error("active_connection_id_limit below 2"));
                    }
                    params.active_connection_id_limit = limit;
                }
                INITIAL_SOURCE_CONNECTION_ID => {
                    params.initial_source_connection_id = Some(decode_cid(value)?);
                }
                RETRY_SOURCE_CONNECTION_ID => {
                    params.retry_source_connection_id = Some(decode_cid(value)?);
                }
                VENDOR_PRIVATE => {
                    if value.len() > VENDOR_PRIVATE_MAX_LEN {
                        return Err(param_error("vendor parameter too large"));
                    }
                    params.vendor_private = Some(value.into_less_safe_slice().to_vec());
                }
                //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4.2
                //# An endpoint MUST ignore transport parameters that it does
                //# not support.
                _ => {}
            }
        }

        Ok(params)
    }

    /// Validates parameters received from a server against what the
    /// client requires
    pub fn validate_required(&self, is_server_params: bool) -> Result<(), Error> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.3
        //# An endpoint MUST treat the absence of the
        //# initial_source_connection_id transport parameter from either
        //# endpoint ... as a connection error of type
        //# TRANSPORT_PARAMETER_ERROR.
        if self.initial_source_connection_id.is_none() {
            return Err(param_error("missing initial_source_connection_id"));
        }
        if is_server_params && self.original_destination_connection_id.is_none() {
            return Err(param_error("missing original_destination_connection_id"));
        }
        Ok(())
    }
}

fn decode_varint(buffer: DecoderBuffer) -> Result<VarInt, Error> {
    let (value, rest) = buffer
        .decode::<VarInt>()
        .map_err(|_| param_error("malformed varint parameter"))?;
    ensure_empty(rest)?;
    Ok(value)
}

fn decode_stream_count(buffer: DecoderBuffer) -> Result<VarInt, Error> {
    let count = decode_varint(buffer)?;
    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
    //# If a max_streams transport parameter or a MAX_STREAMS frame is
    //# received with a value greater than 2^60, this would allow a maximum
    //# stream ID that cannot be expressed as a variable-length integer;
    //# see Section 16.  If either is received, the connection MUST be
    //# closed immediately with a connection error of type
    //# TRANSPORT_PARAMETER_ERROR
    if count > 1u64 << 60 {
        return Err(param_error("stream count above 2^60"));
    }
    Ok(count)
}

fn decode_cid(buffer: DecoderBuffer) -> Result<ConnectionId, Error> {
    // connection ID parameters carry raw bytes with no length prefix
    ConnectionId::try_from_slice(buffer.into_less_safe_slice())
        .map_err(|_| param_error("malformed connection id parameter"))
}

fn ensure_empty(buffer: DecoderBuffer) -> Result<(), Error> {
    if buffer.is_empty() {
        Ok(())
    } else {
        Err(param_error("trailing parameter bytes"))
    }
}

fn encode_entry<E: Encoder, V: EncoderValue>(encoder: &mut E, id: u64, value: &V) {
    encoder.encode(&VarInt::new(id).expect("parameter ids fit a varint"));
    encoder.encode_with_len_prefix::<VarInt, _>(value);
}

impl EncoderValue for TransportParameters {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        if let Some(cid) = &self.original_destination_connection_id {
            encode_entry(encoder, ORIGINAL_DESTINATION_CONNECTION_ID, &cid.as_bytes());
        }
        if !self.max_idle_timeout.is_zero() {
            let millis = VarInt::new(self.max_idle_timeout.as_millis() as u64)
                .expect("idle timeout fits a varint");
            encode_entry(encoder, MAX_IDLE_TIMEOUT, &millis);
        }
        if let Some(token) = &self.stateless_reset_token {
            encode_entry(encoder, STATELESS_RESET_TOKEN, token);
        }
        encode_entry(encoder, MAX_UDP_PAYLOAD_SIZE, &self.max_udp_payload_size);
        encode_entry(encoder, INITIAL_MAX_DATA, &self.initial_max_data);
        encode_entry(
            encoder,
            INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            &self.initial_max_stream_data_bidi_local,
        );
        encode_entry(
            encoder,
            INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            &self.initial_max_stream_data_bidi_remote,
        );
        encode_entry(
            encoder,
            INITIAL_MAX_STREAM_DATA_UNI,
            &self.initial_max_stream_data_uni,
        );
        encode_entry(encoder, INITIAL_MAX_STREAMS_BIDI, &self.initial_max_streams_bidi);
        encode_entry(encoder, INITIAL_MAX_STREAMS_UNI, &self.initial_max_streams_uni);
        if self.ack_delay_exponent != 3 {
            encode_entry(
                encoder,
                ACK_DELAY_EXPONENT,
                &VarInt::from_u8(self.ack_delay_exponent),
            );
        }
        let max_ack_delay_ms = self.max_ack_delay.as_millis() as u64;
        if max_ack_delay_ms != 25 {
            encode_entry(
                encoder,
                MAX_ACK_DELAY,
                &VarInt::new(max_ack_delay_ms).expect("max_ack_delay fits a varint"),
            );
        }
        if self.disable_active_migration {
            encode_entry(encoder, DISABLE_ACTIVE_MIGRATION, &());
        }
        encode_entry(
            encoder,
            ACTIVE_CONNECTION_ID_LIMIT,
            &self.active_connection_id_limit,
        );
        if let Some(cid) = &self.initial_source_connection_id {
            encode_entry(encoder, INITIAL_SOURCE_CONNECTION_ID, &cid.as_bytes());
        }
        if let Some(cid) = &self.retry_source_connection_id {
            encode_entry(encoder, RETRY_SOURCE_CONNECTION_ID, &cid.as_bytes());
        }
        if let Some(blob) = &self.vendor_private {
            debug_assert!(blob.len() <= VENDOR_PRIVATE_MAX_LEN);
            encode_entry(encoder, VENDOR_PRIVATE, &blob.as_slice());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s2n_codec::EncoderBuffer;

    fn round_trip(params: &TransportParameters) -> TransportParameters {
        let mut bytes = [0u8; 1024];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(params);
        let len = encoder.len();
        TransportParameters::decode(DecoderBuffer::new(&bytes[..len])).unwrap()
    }

    #[test]
    fn default_round_trip() {
        let params = TransportParameters::default();
        assert_eq!(round_trip(&params), params);
    }

    #[test]
    fn full_round_trip() {
        let params = TransportParameters {
            original_destination_connection_id: Some(
                ConnectionId::try_from_slice(&[1, 2, 3]).unwrap(),
            ),
            max_idle_timeout: Duration::from_millis(30_000),
            stateless_reset_token: Some(stateless_reset::Token::new([9; 16])),
            max_udp_payload_size: VarInt::from_u16(1500),
            initial_max_data: VarInt::from_u32(1 << 20),
            initial_max_stream_data_bidi_local: VarInt::from_u32(65_536),
            initial_max_stream_data_bidi_remote: VarInt::from_u32(65_536),
            initial_max_stream_data_uni: VarInt::from_u32(32_768),
            initial_max_streams_bidi: VarInt::from_u8(100),
            initial_max_streams_uni: VarInt::from_u8(3),
            ack_delay_exponent: 8,
            max_ack_delay: Duration::from_millis(20),
            disable_active_migration: true,
            active_connection_id_limit: VarInt::from_u8(4),
            initial_source_connection_id: Some(ConnectionId::try_from_slice(&[7; 8]).unwrap()),
            retry_source_connection_id: Some(ConnectionId::try_from_slice(&[8; 8]).unwrap()),
            vendor_private: Some(vec![0xab; 32]),
        };
        assert_eq!(round_trip(&params), params);
    }

    #[test]
    fn rejects_invalid_values() {
        // ack_delay_exponent of 21
        let bytes = [0x0a, 0x01, 21];
        assert!(TransportParameters::decode(DecoderBuffer::new(&bytes)).is_err());

        // max_udp_payload_size below 1200
        let bytes = [0x03, 0x02, 0x44, 0x00];
        assert!(TransportParameters::decode(DecoderBuffer::new(&bytes)).is_err());

        // duplicate parameter
        let bytes = [0x04, 0x01, 1, 0x04, 0x01, 1];
        assert!(TransportParameters::decode(DecoderBuffer::new(&bytes)).is_err());

        // active_connection_id_limit of 1
        let bytes = [0x0e, 0x01, 1];
        assert!(TransportParameters::decode(DecoderBuffer::new(&bytes)).is_err());

        // unknown parameters are skipped
        let bytes = [0x3f, 0x02, 0xaa, 0xbb];
        assert!(TransportParameters::decode(DecoderBuffer::new(&bytes)).is_ok());
    }

    #[test]
    fn required_parameters() {
        let mut params = TransportParameters::default();
        assert!(params.validate_required(true).is_err());

        params.initial_source_connection_id = Some(ConnectionId::EMPTY);
        assert!(params.validate_required(false).is_ok());
        assert!(params.validate_required(true).is_err());

        params.original_destination_connection_id = Some(ConnectionId::EMPTY);
        assert!(params.validate_required(true).is_ok());
    }
}
