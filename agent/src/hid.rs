// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

//! The soft-HID translator: U2F raw messages in, U2F raw messages out.
//!
//! One browser request at a time: the device is single-threaded and the
//! SET/GO authenticate split must never interleave with another operation,
//! so everything runs under the operation mutex. Whatever happens on the
//! serial side, the browser always gets a well-formed status word back.

use std::fmt;
use std::sync::Mutex;

use iso7816::Status;
use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::attestation;
use crate::client::DeviceClient;
use crate::counter::CounterStore;
use crate::u2f::{respond, ControlByte, Request, VERSION_STRING};

/// Our key handles are always nonce ‖ MAC.
const KEY_HANDLE_LEN: usize = 64;

pub struct SoftHid {
    client: DeviceClient,
    counters: CounterStore,
    operation: Mutex<()>,
}

impl fmt::Debug for SoftHid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftHid").finish_non_exhaustive()
    }
}

impl SoftHid {
    pub fn new(client: DeviceClient, counters: CounterStore) -> Self {
        Self {
            client,
            counters,
            operation: Mutex::new(()),
        }
    }

    /// Handle one raw message; the returned bytes include the status word.
    pub fn handle(&self, msg: &[u8]) -> Vec<u8> {
        let _operation = self
            .operation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let request = match Request::decode(msg) {
            Ok(request) => request,
            Err(status) => {
                info!("unsupported or malformed request: {:?}", status);
                return respond(&[], status);
            }
        };

        match request {
            Request::Version => {
                info!("cmd: version");
                respond(VERSION_STRING, Status::Success)
            }
            Request::Register {
                chall_param,
                app_param,
            } => {
                info!("cmd: register app={}", hex(&app_param[..8]));
                self.register(chall_param, app_param)
            }
            Request::Authenticate {
                ctrl,
                chall_param,
                app_param,
                key_handle,
            } => {
                info!("cmd: authenticate app={} ctrl={:?}", hex(&app_param[..8]), ctrl);
                self.authenticate(ctrl, chall_param, app_param, key_handle)
            }
        }
    }

    fn register(&self, chall_param: &[u8; 32], app_param: &[u8; 32]) -> Vec<u8> {
        let result = match self.client.u2f_register(*app_param) {
            Ok(result) => result,
            Err(err) => {
                warn!("register failed: {}", err);
                return respond(&[], Status::UnspecifiedCheckingError);
            }
        };

        let (Some(key_handle), Some(public_key)) = (result.key_handle, result.public_key) else {
            info!("register: no user present");
            return respond(&[], Status::ConditionsOfUseNotSatisfied);
        };

        // attestation over 0x00 ‖ app ‖ chall ‖ keyhandle ‖ pubkey
        let mut signed = Vec::with_capacity(1 + 32 + 32 + KEY_HANDLE_LEN + 65);
        signed.push(0x00);
        signed.extend_from_slice(app_param);
        signed.extend_from_slice(chall_param);
        signed.extend_from_slice(&key_handle);
        signed.extend_from_slice(&public_key);

        let signature = match attestation::sign(&signed) {
            Ok(signature) => signature,
            Err(err) => {
                warn!("attestation signing failed: {}", err);
                return respond(&[], Status::UnspecifiedCheckingError);
            }
        };

        let mut response = Vec::new();
        response.push(0x05); // registration reserved byte
        response.extend_from_slice(&public_key);
        response.push(KEY_HANDLE_LEN as u8);
        response.extend_from_slice(&key_handle);
        response.extend_from_slice(attestation::certificate_der());
        response.extend_from_slice(&signature);

        info!("register: success");
        respond(&response, Status::Success)
    }

    fn authenticate(
        &self,
        ctrl: ControlByte,
        chall_param: &[u8; 32],
        app_param: &[u8; 32],
        key_handle: &[u8],
    ) -> Vec<u8> {
        // only our own 64-byte handles can possibly verify; don't even wake
        // the device for anything else
        let Ok(key_handle) = <[u8; KEY_HANDLE_LEN]>::try_from(key_handle) else {
            info!(
                "authenticate: foreign keyhandle of {} bytes",
                key_handle.len()
            );
            return respond(&[], Status::IncorrectDataParameter);
        };

        match self.client.u2f_check_only(*app_param, key_handle) {
            Ok(true) => {}
            Ok(false) => {
                info!("authenticate: keyhandle not valid: {}", hex(&key_handle));
                return respond(&[], Status::IncorrectDataParameter);
            }
            Err(err) => {
                warn!("check-only failed: {}", err);
                return respond(&[], Status::IncorrectDataParameter);
            }
        }

        if ctrl == ControlByte::CheckOnly {
            // U2F §5.1: a valid handle answers check-only with
            // test-of-user-presence-required; despite the name this is the
            // success signal
            info!("authenticate: check-only success");
            return respond(&[], Status::ConditionsOfUseNotSatisfied);
        }

        let check_user = ctrl == ControlByte::EnforceUserPresenceAndSign;
        let counter = self.counters.next(&key_handle);

        let result = match self.client.u2f_authenticate(
            *app_param,
            *chall_param,
            key_handle,
            check_user,
            counter,
        ) {
            Ok(result) => result,
            Err(err) => {
                warn!("authenticate failed: {}", err);
                return respond(&[], Status::IncorrectDataParameter);
            }
        };

        if !result.key_handle_valid {
            info!("authenticate: keyhandle not valid: {}", hex(&key_handle));
            return respond(&[], Status::IncorrectDataParameter);
        }
        if check_user && result.user_presence == 0 {
            info!("authenticate: user not present but required");
            return respond(&[], Status::ConditionsOfUseNotSatisfied);
        }
        let Some(signature) = result.signature_der else {
            warn!("authenticate: device sent no signature");
            return respond(&[], Status::IncorrectDataParameter);
        };

        let mut response = Vec::with_capacity(1 + 4 + signature.len());
        response.push(result.user_presence);
        response.extend_from_slice(&counter.to_be_bytes());
        response.extend_from_slice(&signature);

        info!("authenticate: success");
        respond(&response, Status::Success)
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
