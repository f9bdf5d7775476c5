// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

//! U2F raw messages, browser side.
//!
//! The USB-HID emulation layer hands over complete `U2FHID_MSG` payloads:
//! ISO 7816-ish APDUs in the CTAP1 flavor, which always encodes the request
//! length in three bytes and may append a two-byte expected length we
//! ignore. Status words reuse the `iso7816` vocabulary; U2F names them
//! differently but the values are the same:
//!
//! - `SW_NO_ERROR`                 = `Status::Success` (0x9000)
//! - `SW_CONDITIONS_NOT_SATISFIED` = `Status::ConditionsOfUseNotSatisfied` (0x6985)
//! - `SW_WRONG_DATA`               = `Status::IncorrectDataParameter` (0x6A80)
//! - `SW_CLA_NOT_SUPPORTED`        = `Status::ClassNotSupported` (0x6E00)

use core::convert::TryFrom;

use iso7816::Status;

/// Response to a version request.
pub const VERSION_STRING: &[u8] = b"U2F_V2";

const CLA: u8 = 0x00;
const INS_REGISTER: u8 = 0x01;
const INS_AUTHENTICATE: u8 = 0x02;
const INS_VERSION: u8 = 0x03;

/// P1 of an authenticate request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ControlByte {
    CheckOnly = 0x07,
    EnforceUserPresenceAndSign = 0x03,
    DontEnforceUserPresenceAndSign = 0x08,
}

impl TryFrom<u8> for ControlByte {
    type Error = Status;

    fn try_from(byte: u8) -> Result<Self, Status> {
        match byte {
            0x07 => Ok(Self::CheckOnly),
            0x03 => Ok(Self::EnforceUserPresenceAndSign),
            0x08 => Ok(Self::DontEnforceUserPresenceAndSign),
            _ => Err(Status::IncorrectDataParameter),
        }
    }
}

/// A decoded authenticator request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Request<'l> {
    Version,
    Register {
        chall_param: &'l [u8; 32],
        app_param: &'l [u8; 32],
    },
    Authenticate {
        ctrl: ControlByte,
        chall_param: &'l [u8; 32],
        app_param: &'l [u8; 32],
        /// Arbitrary length on the wire; the translator rejects anything
        /// but 64 before the device ever sees it.
        key_handle: &'l [u8],
    },
}

impl<'l> Request<'l> {
    /// Decode one raw message. The error is the status word to send back;
    /// unknown commands map to `ClassNotSupported` because browsers probe
    /// for U2F support that way.
    pub fn decode(msg: &'l [u8]) -> Result<Self, Status> {
        if msg.len() < 4 {
            return Err(Status::WrongLength);
        }
        if msg[0] != CLA {
            return Err(Status::ClassNotSupported);
        }
        let (ins, p1) = (msg[1], msg[2]);
        let (lc, data) = decode_length(&msg[4..])?;

        match ins {
            INS_VERSION => {
                if lc != 0 {
                    return Err(Status::WrongLength);
                }
                Ok(Self::Version)
            }
            INS_REGISTER => {
                if lc != 64 {
                    return Err(Status::WrongLength);
                }
                Ok(Self::Register {
                    chall_param: field32(data, 0)?,
                    app_param: field32(data, 32)?,
                })
            }
            INS_AUTHENTICATE => {
                if lc < 65 {
                    return Err(Status::WrongLength);
                }
                let key_handle_len = data[64] as usize;
                if lc != 65 + key_handle_len {
                    return Err(Status::WrongLength);
                }
                Ok(Self::Authenticate {
                    ctrl: ControlByte::try_from(p1)?,
                    chall_param: field32(data, 0)?,
                    app_param: field32(data, 32)?,
                    key_handle: &data[65..65 + key_handle_len],
                })
            }
            _ => Err(Status::ClassNotSupported),
        }
    }
}

/// CTAP1 length field: absent (no data), or three bytes `0x00 hi lo`,
/// optionally followed by a two-byte Le after the data.
fn decode_length(rest: &[u8]) -> Result<(usize, &[u8]), Status> {
    if rest.is_empty() {
        return Ok((0, rest));
    }
    if rest.len() < 3 || rest[0] != 0 {
        return Err(Status::WrongLength);
    }
    let lc = usize::from(rest[1]) << 8 | usize::from(rest[2]);
    let data = &rest[3..];
    if data.len() != lc && data.len() != lc + 2 {
        return Err(Status::WrongLength);
    }
    Ok((lc, &data[..lc]))
}

fn field32(data: &[u8], offset: usize) -> Result<&[u8; 32], Status> {
    data.get(offset..offset + 32)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(Status::WrongLength)
}

/// Append the status word to a response body.
pub fn respond(data: &[u8], status: Status) -> Vec<u8> {
    let mut response = data.to_vec();
    let sw: [u8; 2] = status.into();
    response.extend_from_slice(&sw);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apdu(ins: u8, p1: u8, data: &[u8]) -> Vec<u8> {
        let mut msg = vec![CLA, ins, p1, 0];
        if !data.is_empty() {
            msg.push(0);
            msg.push((data.len() >> 8) as u8);
            msg.push(data.len() as u8);
            msg.extend_from_slice(data);
        }
        msg
    }

    #[test]
    fn decodes_version() {
        assert_eq!(Request::decode(&apdu(INS_VERSION, 0, &[])), Ok(Request::Version));
        // version with the trailing Le bytes browsers send
        let msg = [0, 3, 0, 0, 0, 0, 0];
        assert_eq!(Request::decode(&msg), Ok(Request::Version));
    }

    #[test]
    fn decodes_register() {
        let mut data = [0u8; 64];
        data[..32].copy_from_slice(&[0x11; 32]);
        data[32..].copy_from_slice(&[0x22; 32]);
        match Request::decode(&apdu(INS_REGISTER, 0, &data)) {
            Ok(Request::Register {
                chall_param,
                app_param,
            }) => {
                assert_eq!(chall_param, &[0x11; 32]);
                assert_eq!(app_param, &[0x22; 32]);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn decodes_authenticate() {
        let mut data = vec![0u8; 65];
        data[..32].copy_from_slice(&[0x11; 32]);
        data[32..64].copy_from_slice(&[0x22; 32]);
        data[64] = 64;
        data.extend_from_slice(&[0x33; 64]);
        match Request::decode(&apdu(INS_AUTHENTICATE, 0x03, &data)) {
            Ok(Request::Authenticate {
                ctrl,
                key_handle,
                ..
            }) => {
                assert_eq!(ctrl, ControlByte::EnforceUserPresenceAndSign);
                assert_eq!(key_handle, &[0x33; 64][..]);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn authenticate_key_handle_length_honored() {
        let mut data = vec![0u8; 65];
        data[64] = 63;
        data.extend_from_slice(&[0x33; 63]);
        match Request::decode(&apdu(INS_AUTHENTICATE, 0x07, &data)) {
            Ok(Request::Authenticate { key_handle, .. }) => assert_eq!(key_handle.len(), 63),
            other => panic!("unexpected decode: {:?}", other),
        }
        // mismatch between the length byte and the data is an error
        let mut data = vec![0u8; 65];
        data[64] = 64;
        data.extend_from_slice(&[0x33; 10]);
        assert_eq!(
            Request::decode(&apdu(INS_AUTHENTICATE, 0x07, &data)),
            Err(Status::WrongLength)
        );
    }

    #[test]
    fn bad_control_byte() {
        let mut data = vec![0u8; 65];
        data[64] = 64;
        data.extend_from_slice(&[0x33; 64]);
        assert_eq!(
            Request::decode(&apdu(INS_AUTHENTICATE, 0x55, &data)),
            Err(Status::IncorrectDataParameter)
        );
    }

    #[test]
    fn unknown_ins_is_cla_not_supported() {
        assert_eq!(
            Request::decode(&apdu(0x42, 0, &[])),
            Err(Status::ClassNotSupported)
        );
    }

    #[test]
    fn wrong_register_length() {
        assert_eq!(
            Request::decode(&apdu(INS_REGISTER, 0, &[0u8; 63])),
            Err(Status::WrongLength)
        );
    }

    #[test]
    fn respond_appends_status_word() {
        assert_eq!(respond(b"U2F_V2", Status::Success), b"U2F_V2\x90\x00");
        assert_eq!(
            respond(&[], Status::ConditionsOfUseNotSatisfied),
            [0x69, 0x85]
        );
        assert_eq!(respond(&[], Status::IncorrectDataParameter), [0x6a, 0x80]);
        assert_eq!(respond(&[], Status::ClassNotSupported), [0x6e, 0x00]);
    }
}
