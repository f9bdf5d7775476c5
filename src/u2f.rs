// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

//! Stateless U2F key material: derivation, key handles, signing.
//!
//! There is no writable storage on the device, so a registration cannot save
//! anything. Instead the private key for a site is recomputed from what the
//! relying party sends back:
//!
//! - registration draws a fresh 32-byte nonce and derives the private key
//!   `k = BLAKE2s(key = CDI, app_param ‖ nonce)`;
//! - the key handle given to the relying party is `nonce ‖ mac` with
//!   `mac = BLAKE2s(key = CDI, app_param ‖ k)`;
//! - verification re-derives `k` from the returned nonce and checks the MAC.
//!
//! A handle therefore authenticates itself: it only verifies on the device
//! (CDI) it was minted on, and only for the app parameter it was minted for.

use blake2::digest::{FixedOutput, KeyInit, Update};
use blake2::Blake2sMac256;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::SecretKey;
use sha2::{Digest as _, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::hal::{wait_touched, Hal, LedColor};
use crate::rng::CdiRng;

pub const KEY_HANDLE_BYTES: usize = 64;
pub const PUBLIC_KEY_BYTES: usize = 64;
pub const SIGNATURE_BYTES: usize = 64;

/// `nonce ‖ mac`, the opaque 64-byte token handed to the relying party.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KeyHandle {
    pub nonce: [u8; 32],
    pub mac: [u8; 32],
}

impl KeyHandle {
    pub fn from_bytes(bytes: &[u8; KEY_HANDLE_BYTES]) -> Self {
        let mut nonce = [0u8; 32];
        let mut mac = [0u8; 32];
        nonce.copy_from_slice(&bytes[..32]);
        mac.copy_from_slice(&bytes[32..]);
        Self { nonce, mac }
    }

    pub fn to_bytes(self) -> [u8; KEY_HANDLE_BYTES] {
        let mut bytes = [0u8; KEY_HANDLE_BYTES];
        bytes[..32].copy_from_slice(&self.nonce);
        bytes[32..].copy_from_slice(&self.mac);
        bytes
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The derived scalar was zero or not below the curve order. Probability
    /// per registration is about 2^-32; the caller sees the failure rather
    /// than a silent retry with a new nonce.
    KeyGeneration,
    /// ECDSA signing failed.
    Signing,
}

/// Outcome of a registration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Registration {
    /// Nobody touched the device within the timeout. No key material is
    /// produced.
    NoUserPresence,
    Registered {
        key_handle: KeyHandle,
        /// Uncompressed point, X ‖ Y, without the 0x04 marker.
        public_key: [u8; PUBLIC_KEY_BYTES],
    },
}

/// Outcome of an authentication.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Assertion {
    /// The key handle does not belong to this device/app_param.
    InvalidHandle,
    /// Handle valid, but user presence was required and nobody touched.
    NoUserPresence,
    Signed {
        user_presence: bool,
        /// Raw `r ‖ s`; the host converts to DER.
        signature: [u8; SIGNATURE_BYTES],
    },
}

/// The key-handle core, holding the device secret.
pub struct U2f {
    secret: [u8; 32],
}

impl core::fmt::Debug for U2f {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("U2f { .. }")
    }
}

impl Drop for U2f {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl U2f {
    /// Takes ownership of the CDI read from hardware.
    pub fn new(cdi: [u8; 32]) -> Self {
        Self { secret: cdi }
    }

    /// BLAKE2s keyed by the CDI over `part1 ‖ part2`. Both the private-key
    /// derivation and the handle MAC are instances of this.
    fn keyed_hash(&self, part1: &[u8; 32], part2: &[u8; 32]) -> [u8; 32] {
        let mut mac = Blake2sMac256::new((&self.secret).into());
        Update::update(&mut mac, part1);
        Update::update(&mut mac, part2);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize_fixed());
        out
    }

    fn derive_private(&self, app_param: &[u8; 32], nonce: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.keyed_hash(app_param, nonce))
    }

    fn handle_mac(&self, app_param: &[u8; 32], private: &[u8; 32]) -> [u8; 32] {
        self.keyed_hash(app_param, private)
    }

    /// Whether `key_handle` was minted by this device for `app_param`.
    /// Constant-time in the MAC comparison; no touch, no LED.
    pub fn check_only(&self, app_param: &[u8; 32], key_handle: &KeyHandle) -> bool {
        let private = self.derive_private(app_param, &key_handle.nonce);
        let expected = self.handle_mac(app_param, &private);
        expected.ct_eq(&key_handle.mac).into()
    }

    /// Mint a key pair and handle for `app_param`, gated on touch.
    pub fn register<H: Hal>(
        &self,
        hal: &mut H,
        rng: &mut CdiRng,
        app_param: &[u8; 32],
    ) -> Result<Registration, Error> {
        if !wait_touched(hal, LedColor::Blue) {
            return Ok(Registration::NoUserPresence);
        }

        // steady while the key pair is derived
        hal.led(LedColor::Blue);

        let nonce = rng.fill_nonce(hal);
        let private = self.derive_private(app_param, &nonce);
        let public_key = keypair_from_bytes(&private)?;
        let mac = self.handle_mac(app_param, &private);

        Ok(Registration::Registered {
            key_handle: KeyHandle { nonce, mac },
            public_key,
        })
    }

    /// Verify `key_handle`, optionally gate on touch, and sign
    /// `app_param ‖ user_presence ‖ counter_be ‖ chall_param`.
    pub fn authenticate<H: Hal>(
        &self,
        hal: &mut H,
        app_param: &[u8; 32],
        chall_param: &[u8; 32],
        key_handle: &KeyHandle,
        check_user: bool,
        counter: u32,
    ) -> Result<Assertion, Error> {
        if !self.check_only(app_param, key_handle) {
            // no touch for a handle we did not mint
            return Ok(Assertion::InvalidHandle);
        }

        let user_presence = if check_user {
            if !wait_touched(hal, LedColor::Green) {
                return Ok(Assertion::NoUserPresence);
            }
            true
        } else {
            false
        };

        // steady while signing
        hal.led(LedColor::Green);

        let mut sig_data = [0u8; 32 + 1 + 4 + 32];
        sig_data[..32].copy_from_slice(app_param);
        sig_data[32] = user_presence as u8;
        sig_data[33..37].copy_from_slice(&counter.to_be_bytes());
        sig_data[37..].copy_from_slice(chall_param);

        let digest: [u8; 32] = Sha256::digest(sig_data).into();

        let private = self.derive_private(app_param, &key_handle.nonce);
        let signature = ecdsa_sign(&private, &digest)?;

        Ok(Assertion::Signed {
            user_presence,
            signature,
        })
    }
}

/// Recover the public key for the scalar `private`. Fails iff the scalar is
/// zero or not below the curve order.
fn keypair_from_bytes(private: &[u8; 32]) -> Result<[u8; PUBLIC_KEY_BYTES], Error> {
    let secret = SecretKey::from_bytes(private.into()).map_err(|_| Error::KeyGeneration)?;
    let point = secret.public_key().to_encoded_point(false);
    let mut public = [0u8; PUBLIC_KEY_BYTES];
    public[..32].copy_from_slice(point.x().ok_or(Error::KeyGeneration)?);
    public[32..].copy_from_slice(point.y().ok_or(Error::KeyGeneration)?);
    Ok(public)
}

fn ecdsa_sign(private: &[u8; 32], digest: &[u8; 32]) -> Result<[u8; SIGNATURE_BYTES], Error> {
    let key = SigningKey::from_bytes(private.into()).map_err(|_| Error::Signing)?;
    let signature: Signature = key.sign_prehash(digest).map_err(|_| Error::Signing)?;
    let mut raw = [0u8; SIGNATURE_BYTES];
    raw.copy_from_slice(&signature.to_bytes());
    Ok(raw)
}
