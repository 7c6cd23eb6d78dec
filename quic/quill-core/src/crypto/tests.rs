// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{
    crypto::{
        initial::{InitialSecrets, INITIAL_SALT_V1, INITIAL_SUITE},
        key::{HeaderKey, OneRttKeySet, PacketKey, TAG_LEN},
    },
    packet::number::{PacketNumber, PacketNumberLen},
};
use hex_literal::hex;

const EXAMPLE_DCID: [u8; 8] = hex!("8394c8f03e515708");

#[test]
fn seal_open_round_trip() {
    let secrets = InitialSecrets::new(&INITIAL_SALT_V1, &EXAMPLE_DCID).unwrap();
    let sealer = PacketKey::from_secret(INITIAL_SUITE, &secrets.client).unwrap();
    let opener = PacketKey::from_secret(INITIAL_SUITE, &secrets.client).unwrap();

    let header = [0xc3u8, 0, 0, 0, 1];
    let pn = PacketNumber::new(2).unwrap();

    let mut buffer = Vec::from(&b"hello quic"[..]);
    buffer.resize(buffer.len() + TAG_LEN, 0);

    sealer.seal_in_place(pn, &header, &mut buffer).unwrap();
    assert_ne!(&buffer[..10], b"hello quic");

    let cleartext = opener.open_in_place(pn, &header, &mut buffer).unwrap();
    assert_eq!(cleartext, b"hello quic");

    // a different packet number produces a different nonce and fails
    let mut buffer = Vec::from(&b"hello quic"[..]);
    buffer.resize(buffer.len() + TAG_LEN, 0);
    sealer.seal_in_place(pn, &header, &mut buffer).unwrap();
    let wrong_pn = PacketNumber::new(3).unwrap();
    assert!(opener.open_in_place(wrong_pn, &header, &mut buffer).is_err());
}

//= https://www.rfc-editor.org/rfc/rfc9001#appendix-A.2
//# sample = d1b1c98dd7689fb8ec11d242b123dc9b
//#
//# mask = AES-ECB(hp, sample)[0..4]
//#      = 437b9aec36
#[test]
fn rfc_client_initial_hp_mask() {
    let secrets = InitialSecrets::new(&INITIAL_SALT_V1, &EXAMPLE_DCID).unwrap();
    let hp = HeaderKey::from_secret(INITIAL_SUITE, &secrets.client).unwrap();

    let sample = hex!("d1b1c98dd7689fb8ec11d242b123dc9b");
    let mask = hp.mask(&sample).unwrap();
    assert_eq!(mask, hex!("437b9aec36"));
}

//= https://www.rfc-editor.org/rfc/rfc9001#appendix-A.5
//# In this example, TLS produces an application write secret from which
//# a server uses HKDF-Expand-Label to produce four values: a key, an IV,
//# a header protection key, and the secret that will be used after keys
//# are updated (this last value is not used further in this example).
#[test]
fn rfc_chacha20_short_packet() {
    let secret = hex!("9ac312a7f877468ebe69422748ad00a15443f18203a07d6060f688f30f21632b");
    let suite = CipherSuite::ChaCha20Poly1305Sha256;

    let sealer = PacketKey::from_secret(suite, &secret).unwrap();
    let hp = HeaderKey::from_secret(suite, &secret).unwrap();

    //# The header of the example packet is 42 00 bf f4 (that is, a short
    //# header with a three-byte packet number) protecting packet 654360564
    let pn = PacketNumber::new(654_360_564).unwrap();
    let pn_len = PacketNumberLen::THREE;

    let mut packet = vec![0x42u8, 0x00, 0xbf, 0xf4, 0x01];
    packet.resize(packet.len() + TAG_LEN, 0);

    let (header, payload) = packet.split_at_mut(4);
    sealer.seal_in_place(pn, header, payload).unwrap();
    apply_header_protection(&mut packet, 1, pn_len, &hp).unwrap();

    assert_eq!(
        packet[..],
        hex!("4cfe4189655e5cd55c41f69080575d7999c25a5bfb")[..]
    );

    // and back again
    let opener_hp = HeaderKey::from_secret(suite, &secret).unwrap();
    let truncated = remove_header_protection(&mut packet, 1, &opener_hp).unwrap();
    assert_eq!(truncated.len(), pn_len);
    assert_eq!(truncated.as_u32(), 0x00bff4);
    assert_eq!(packet[..4], [0x42, 0x00, 0xbf, 0xf4]);

    let opener = PacketKey::from_secret(suite, &secret).unwrap();
    let (header, payload) = packet.split_at_mut(4);
    let cleartext = opener.open_in_place(pn, header, payload).unwrap();
    assert_eq!(cleartext, [0x01]);
}

#[test]
fn key_update_round_trip() {
    let client_app = hex!("0011223344556677889900112233445566778899001122334455667788990011");
    let server_app = hex!("ffeeddccbbaa9988ffeeddccbbaa9988ffeeddccbbaa9988ffeeddccbbaa9988");
    let suite = CipherSuite::Aes128GcmSha256;

    let mut client = OneRttKeySet::from_secrets(suite, &client_app, &server_app).unwrap();
    let mut server = OneRttKeySet::from_secrets(suite, &server_app, &client_app).unwrap();

    let seal = |keys: &OneRttKeySet, pn: u64, msg: &[u8]| {
        let pn = PacketNumber::new(pn).unwrap();
        let mut buffer = msg.to_vec();
        buffer.resize(buffer.len() + TAG_LEN, 0);
        keys.sealer().seal_in_place(pn, &[0x40], &mut buffer).unwrap();
        buffer
    };

    // generation 0 in both directions
    let mut packet = seal(&client, 0, b"gen0");
    let (cleartext, outcome) = server
        .open_in_place(client.key_phase(), PacketNumber::new(0).unwrap(), &[0x40], &mut packet)
        .unwrap();
    assert_eq!(cleartext, b"gen0");
    assert_eq!(outcome, key::KeyPhaseOutcome::Current);

    // the client initiates a key update
    client.update().unwrap();
    assert_eq!(client.generation(), 1);

    let mut packet = seal(&client, 1, b"gen1");
    let (cleartext, outcome) = server
        .open_in_place(client.key_phase(), PacketNumber::new(1).unwrap(), &[0x40], &mut packet)
        .unwrap();
    assert_eq!(cleartext, b"gen1");
    assert_eq!(outcome, key::KeyPhaseOutcome::Updated);
    assert_eq!(server.generation(), 1);
    assert_eq!(server.key_phase(), client.key_phase());

    // the server's replies under the new generation reach the client,
    // whose own update already moved it to the same phase
    let mut packet = seal(&server, 7, b"reply");
    let (cleartext, outcome) = client
        .open_in_place(server.key_phase(), PacketNumber::new(7).unwrap(), &[0x40], &mut packet)
        .unwrap();
    assert_eq!(cleartext, b"reply");
    assert_eq!(outcome, key::KeyPhaseOutcome::Current);
}
