// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

//! Built-in attestation key and certificate.
//!
//! Like the reference U2F software tokens, the agent ships one shared
//! attestation key pair compiled into the binary. It proves nothing about
//! the hardware and is explicitly not production-grade; relying parties that
//! verify attestation chains will (correctly) flag it as a software token.
//! The certificate is a minimal self-signed X.509 blob built at first use,
//! deterministic because the signature scheme is RFC 6979 ECDSA.

use std::sync::OnceLock;

use hex_literal::hex;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};

const ATTESTATION_KEY_BYTES: [u8; 32] =
    hex!("f3b0c1a4d59e6b72c8d90f134a5e6d7c8b9a0f1e2d3c4b5a69788796a5b4c3d2");

const SUBJECT_CN: &str = "TKey FIDO Software Attestation";

fn signing_key() -> &'static SigningKey {
    static KEY: OnceLock<SigningKey> = OnceLock::new();
    KEY.get_or_init(|| {
        #[allow(clippy::expect_used)]
        SigningKey::from_bytes(&ATTESTATION_KEY_BYTES.into())
            .expect("compiled-in attestation key is a valid scalar")
    })
}

/// Public half, for tests and diagnostics.
pub fn verifying_key() -> VerifyingKey {
    *signing_key().verifying_key()
}

/// ECDSA-SHA256 over `data`, DER-encoded.
pub fn sign(data: &[u8]) -> Result<Vec<u8>, p256::ecdsa::Error> {
    let digest: [u8; 32] = Sha256::digest(data).into();
    let signature: Signature = signing_key().sign_prehash(&digest)?;
    Ok(signature.to_der().as_bytes().to_vec())
}

/// The attestation certificate, DER.
pub fn certificate_der() -> &'static [u8] {
    static CERT: OnceLock<Vec<u8>> = OnceLock::new();
    CERT.get_or_init(build_certificate).as_slice()
}

// -- minimal DER below: just enough X.509 for a self-signed EC certificate --

const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_INTEGER: u8 = 0x02;
const TAG_BIT_STRING: u8 = 0x03;
const TAG_OID: u8 = 0x06;
const TAG_UTF8_STRING: u8 = 0x0c;
const TAG_UTC_TIME: u8 = 0x17;
/// Context tag [0], constructed: the explicit version wrapper.
const TAG_VERSION: u8 = 0xa0;

const OID_ECDSA_WITH_SHA256: [u8; 8] = [0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02];
const OID_EC_PUBLIC_KEY: [u8; 7] = [0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
const OID_PRIME256V1: [u8; 8] = [0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
const OID_COMMON_NAME: [u8; 3] = [0x55, 0x04, 0x03];

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
    out.extend_from_slice(content);
    out
}

fn sequence(parts: &[&[u8]]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, &parts.concat())
}

fn build_certificate() -> Vec<u8> {
    let version = tlv(TAG_VERSION, &tlv(TAG_INTEGER, &[2]));
    let serial = tlv(TAG_INTEGER, &[1]);
    let signature_alg = sequence(&[&tlv(TAG_OID, &OID_ECDSA_WITH_SHA256)]);

    // self-signed: issuer == subject
    let name = sequence(&[&tlv(
        TAG_SET,
        &sequence(&[
            &tlv(TAG_OID, &OID_COMMON_NAME),
            &tlv(TAG_UTF8_STRING, SUBJECT_CN.as_bytes()),
        ]),
    )]);

    let validity = sequence(&[
        &tlv(TAG_UTC_TIME, b"230101000000Z"),
        &tlv(TAG_UTC_TIME, b"380101000000Z"),
    ]);

    let point = verifying_key().to_encoded_point(false);
    let mut key_bits = vec![0u8]; // no unused bits
    key_bits.extend_from_slice(point.as_bytes());
    let spki = sequence(&[
        &sequence(&[
            &tlv(TAG_OID, &OID_EC_PUBLIC_KEY),
            &tlv(TAG_OID, &OID_PRIME256V1),
        ]),
        &tlv(TAG_BIT_STRING, &key_bits),
    ]);

    let tbs = sequence(&[&version, &serial, &signature_alg, &name, &validity, &name, &spki]);

    // sign() only fails on an invalid key, which the compiled-in constant
    // is not
    let signature = sign(&tbs).unwrap_or_default();
    let mut signature_bits = vec![0u8];
    signature_bits.extend_from_slice(&signature);

    sequence(&[
        &tbs,
        &signature_alg,
        &tlv(TAG_BIT_STRING, &signature_bits),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashVerifier;

    #[test]
    fn signature_verifies() {
        let data = b"attestation input";
        let der = sign(data).unwrap();
        let signature = Signature::from_der(&der).unwrap();
        let digest: [u8; 32] = Sha256::digest(data).into();
        verifying_key().verify_prehash(&digest, &signature).unwrap();
    }

    #[test]
    fn certificate_is_wellformed_der() {
        let cert = certificate_der();
        assert_eq!(cert[0], TAG_SEQUENCE);
        // outer TLV length must cover exactly the rest of the blob
        let (len, header) = match cert[1] {
            0x82 => (
                (usize::from(cert[2]) << 8) | usize::from(cert[3]),
                4,
            ),
            0x81 => (usize::from(cert[2]), 3),
            short => (usize::from(short), 2),
        };
        assert_eq!(cert.len(), header + len);
    }

    #[test]
    fn certificate_is_deterministic() {
        assert_eq!(certificate_der(), build_certificate().as_slice());
    }

    #[test]
    fn tlv_length_forms() {
        assert_eq!(tlv(0x04, &[0xab])[..2], [0x04, 0x01]);
        let long = vec![0u8; 0x90];
        assert_eq!(tlv(0x04, &long)[..3], [0x04, 0x81, 0x90]);
        let longer = vec![0u8; 0x0123];
        assert_eq!(tlv(0x04, &longer)[..4], [0x04, 0x82, 0x01, 0x23]);
    }
}
