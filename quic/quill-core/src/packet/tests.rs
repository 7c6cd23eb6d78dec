// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{
    crypto::{
        initial::{initial_keys, INITIAL_SALT_V1},
        key::TAG_LEN,
    },
    endpoint,
    packet::{
        long::{LongHeaderBuilder, VersionNegotiation},
        short::ShortHeaderBuilder,
    },
};
use s2n_codec::{DecoderBufferMut, EncoderBuffer, Encoder};

fn cid(bytes: &[u8]) -> ConnectionId {
    ConnectionId::try_from_slice(bytes).unwrap()
}

/// Builds, protects, decodes, unprotects and decrypts a pair of
/// coalesced Initial + Handshake-shaped packets
#[test]
fn long_header_round_trip() {
    let dcid = cid(&[1, 2, 3, 4, 5, 6, 7, 8]);
    let scid = cid(&[9, 10, 11]);
    let token = [0xaau8; 7];
    let payload = b"crypto frame bytes go here padded out...";

    let client_keys = initial_keys(&INITIAL_SALT_V1, dcid.as_bytes(), endpoint::Type::Client).unwrap();
    let server_keys = initial_keys(&INITIAL_SALT_V1, dcid.as_bytes(), endpoint::Type::Server).unwrap();

    let mut datagram = [0u8; 256];
    let mut encoder = EncoderBuffer::new(&mut datagram);

    let pn = number::PacketNumber::new(2).unwrap();
    let truncated = pn.truncate(None);

    let builder = LongHeaderBuilder {
        packet_type: PacketType::Initial,
        version: VERSION_V1,
        dcid: &dcid,
        scid: &scid,
        token: &token,
    };
    let mark = builder.encode(&mut encoder, truncated);
    encoder.write_slice(payload);
    mark.finish(&mut encoder, TAG_LEN);
    encoder.write_repeated(TAG_LEN, 0);

    let packet_end = encoder.len();
    drop(encoder);

    {
        let packet = &mut datagram[..packet_end];
        let (header, protected) = packet.split_at_mut(mark.pn_offset + mark.pn_len);
        client_keys
            .sealer
            .seal_in_place(pn, header, protected)
            .unwrap();
        crypto::apply_header_protection(packet, mark.pn_offset, truncated.len(), &client_keys.sealer_hp)
            .unwrap();
    }

    // decode as the server
    let buffer = DecoderBufferMut::new(&mut datagram[..packet_end]);
    let (packet, remaining) = ProtectedPacket::decode(buffer, 8).unwrap();
    assert!(remaining.is_empty());

    let ProtectedPacket::Encrypted(mut packet) = packet else {
        panic!("expected an encrypted packet");
    };
    assert_eq!(packet.packet_type, PacketType::Initial);
    assert_eq!(packet.version, VERSION_V1);
    assert_eq!(packet.dcid, dcid);
    assert_eq!(packet.scid, Some(scid));
    assert_eq!(packet.token(), &token);

    let decoded_pn = packet.unprotect(&server_keys.opener_hp, None).unwrap();
    assert_eq!(decoded_pn, pn);

    let cleartext = packet.decrypt(&server_keys.opener, decoded_pn).unwrap();
    assert_eq!(cleartext, payload);
}

#[test]
fn short_header_round_trip() {
    let dcid = cid(&[7; 8]);
    let payload = b"one rtt payload large enough to sample..";

    // initial-style keys stand in for 1-RTT keys in this codec test
    let keys = initial_keys(&INITIAL_SALT_V1, dcid.as_bytes(), endpoint::Type::Client).unwrap();

    let mut datagram = [0u8; 128];
    let mut encoder = EncoderBuffer::new(&mut datagram);

    let pn = number::PacketNumber::new(0x1234).unwrap();
    let truncated = pn.truncate(Some(number::PacketNumber::new(0x1200).unwrap()));

    let builder = ShortHeaderBuilder {
        dcid: &dcid,
        spin_bit: true,
        key_phase: false,
    };
    let mark = builder.encode(&mut encoder, truncated);
    encoder.write_slice(payload);
    encoder.write_repeated(TAG_LEN, 0);
    let packet_end = encoder.len();
    drop(encoder);

    {
        let packet = &mut datagram[..packet_end];
        let (header, protected) = packet.split_at_mut(mark.pn_offset + mark.pn_len);
        keys.sealer.seal_in_place(pn, header, protected).unwrap();
        crypto::apply_header_protection(packet, mark.pn_offset, truncated.len(), &keys.sealer_hp)
            .unwrap();
    }

    let buffer = DecoderBufferMut::new(&mut datagram[..packet_end]);
    let (packet, remaining) = ProtectedPacket::decode(buffer, dcid.len()).unwrap();
    assert!(remaining.is_empty());

    let ProtectedPacket::Encrypted(mut packet) = packet else {
        panic!("expected an encrypted packet");
    };
    assert_eq!(packet.packet_type, PacketType::OneRtt);
    assert_eq!(packet.dcid, dcid);

    let decoded_pn = packet
        .unprotect(&keys.opener_hp, Some(number::PacketNumber::new(0x1200).unwrap()))
        .unwrap();
    assert_eq!(decoded_pn, pn);
    assert!(packet.spin_bit());
    assert!(!packet.key_phase());

    let cleartext = packet.decrypt(&keys.opener, decoded_pn).unwrap();
    assert_eq!(cleartext, payload);
}

#[test]
fn version_negotiation_round_trip() {
    let dcid = cid(&[1; 4]);
    let scid = cid(&[2; 4]);

    let mut datagram = [0u8; 64];
    let mut encoder = EncoderBuffer::new(&mut datagram);
    long::encode_version_negotiation(&mut encoder, &scid, &dcid, 0x15);
    let end = encoder.len();
    drop(encoder);

    let buffer = DecoderBufferMut::new(&mut datagram[..end]);
    let (packet, remaining) = ProtectedPacket::decode(buffer, 8).unwrap();
    assert!(remaining.is_empty());

    let ProtectedPacket::VersionNegotiation(VersionNegotiation { dcid: d, scid: s, versions }) =
        packet
    else {
        panic!("expected version negotiation");
    };
    // the peer's SCID becomes our DCID
    assert_eq!(d, scid);
    assert_eq!(s, dcid);
    assert_eq!(versions, vec![VERSION_V1]);
}

#[test]
fn retry_round_trip() {
    let odcid = cid(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]);
    let new_scid = cid(&[0xf0, 0x67, 0xa5, 0x50, 0x2a, 0x42, 0x62, 0xb5]);
    let client_scid = cid(&[0x01, 0x02]);
    let token = b"token";

    let mut datagram = [0u8; 128];
    let mut encoder = EncoderBuffer::new(&mut datagram);
    long::encode_retry(&mut encoder, VERSION_V1, &client_scid, &new_scid, &odcid, token);
    let end = encoder.len();
    drop(encoder);

    let buffer = DecoderBufferMut::new(&mut datagram[..end]);
    let (packet, remaining) = ProtectedPacket::decode(buffer, 8).unwrap();
    assert!(remaining.is_empty());

    let ProtectedPacket::Retry(retry) = packet else {
        panic!("expected retry");
    };
    assert_eq!(retry.dcid, client_scid);
    assert_eq!(retry.scid, new_scid);
    assert_eq!(retry.token(), token);
    assert!(retry.is_tag_valid(&odcid));
    assert!(!retry.is_tag_valid(&client_scid));
}

#[test]
fn route_dcid_extraction() {
    // long header
    let mut datagram = [0u8; 64];
    let mut encoder = EncoderBuffer::new(&mut datagram);
    let dcid = cid(&[5; 12]);
    let scid = cid(&[6; 4]);
    let builder = LongHeaderBuilder {
        packet_type: PacketType::Handshake,
        version: VERSION_V1,
        dcid: &dcid,
        scid: &scid,
        token: &[],
    };
    let pn = number::PacketNumber::new(0).unwrap();
    builder.encode(&mut encoder, pn.truncate(None));
    let end = encoder.len();
    drop(encoder);
    assert_eq!(route_dcid(&datagram[..end], 8), Some(dcid));

    // short header
    let mut datagram = [0u8; 64];
    let mut encoder = EncoderBuffer::new(&mut datagram);
    let short_dcid = cid(&[9; 8]);
    let builder = ShortHeaderBuilder {
        dcid: &short_dcid,
        spin_bit: false,
        key_phase: false,
    };
    builder.encode(&mut encoder, pn.truncate(None));
    drop(encoder);
    assert_eq!(route_dcid(&datagram, 8), Some(short_dcid));

    // runt datagrams route nowhere
    assert_eq!(route_dcid(&[], 8), None);
    assert_eq!(route_dcid(&[0x40, 1, 2], 8), None);
}
