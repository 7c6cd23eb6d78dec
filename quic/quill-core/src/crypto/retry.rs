// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::crypto::key::TAG_LEN;
use hex_literal::hex;
use ring::aead;
use subtle::ConstantTimeEq;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.8
//# The Retry Integrity Tag is a 128-bit field that is computed as the
//# output of AES-128-GCM used with the following secret key and nonce.
//# secret_key = 0xbe0c690b9f66575a1d766b54e368c84e
//# nonce = 0x461599d35d632bf2239825bb
const SECRET_KEY_V1: [u8; 16] = hex!("be0c690b9f66575a1d766b54e368c84e");
const NONCE_V1: [u8; 12] = hex!("461599d35d632bf2239825bb");

/// Computes the integrity tag for a Retry packet.
///
/// The AEAD is run with an empty plaintext; the associated data is the
/// Retry pseudo-packet: the original destination connection ID with a
/// one-byte length prefix, followed by the Retry packet up to but not
/// including the tag.
pub fn retry_tag(odcid: &[u8], retry_packet_sans_tag: &[u8]) -> [u8; TAG_LEN] {
    debug_assert!(odcid.len() <= crate::connection::id::MAX_LEN);

    let mut pseudo_packet = Vec::with_capacity(1 + odcid.len() + retry_packet_sans_tag.len());
    pseudo_packet.push(odcid.len() as u8);
    pseudo_packet.extend_from_slice(odcid);
    pseudo_packet.extend_from_slice(retry_packet_sans_tag);

    let key = aead::UnboundKey::new(&aead::AES_128_GCM, &SECRET_KEY_V1)
        .expect("fixed-size retry key is valid");
    let key = aead::LessSafeKey::new(key);

    let tag = key
        .seal_in_place_separate_tag(
            aead::Nonce::assume_unique_for_key(NONCE_V1),
            aead::Aad::from(&pseudo_packet),
            &mut [],
        )
        .expect("empty plaintext cannot fail");

    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Validates a received Retry packet's trailing integrity tag in
/// constant time
pub fn is_retry_tag_valid(odcid: &[u8], retry_packet: &[u8]) -> bool {
    let Some(split) = retry_packet.len().checked_sub(TAG_LEN) else {
        return false;
    };
    let (sans_tag, tag) = retry_packet.split_at(split);
    let expected = retry_tag(odcid, sans_tag);
    expected.ct_eq(tag).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    //= https://www.rfc-editor.org/rfc/rfc9001#appendix-A.4
    //# This shows a Retry packet that might be sent in response to the
    //# Initial packet in Appendix A.2.  The integrity check includes the
    //# client-chosen connection ID value of 0x8394c8f03e515708
    //#
    //# ff000000010008f067a5502a4262b574 6f6b656e04a265ba2eff4d829058fb3f
    //# 0f2496ba
    #[test]
    fn rfc_retry_vector() {
        let odcid = hex!("8394c8f03e515708");
        let packet = hex!(
            "
            ff000000010008f067a5502a4262b574 6f6b656e04a265ba2eff4d829058fb3f
            0f2496ba
            "
        );

        assert!(is_retry_tag_valid(&odcid, &packet));

        let (sans_tag, tag) = packet.split_at(packet.len() - TAG_LEN);
        assert_eq!(retry_tag(&odcid, sans_tag), tag);

        // any flipped bit invalidates the tag
        let mut corrupt = packet;
        corrupt[1] ^= 1;
        assert!(!is_retry_tag_valid(&odcid, &corrupt));
        assert!(!is_retry_tag_valid(&hex!("8394c8f03e515709"), &packet));
    }
}
