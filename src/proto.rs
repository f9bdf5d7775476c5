// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

//! App-level protocol: command and response codes, status bytes and the
//! fixed payload sizes of each exchange.
//!
//! The host agent's device client uses these definitions too, so the two
//! sides of the wire cannot drift apart.

use core::convert::TryFrom;

use tkey_framing::CmdLen;

/// First word of the app name, as reported by `GetNameVersion`.
/// Note the trailing space.
pub const APP_NAME0: [u8; 4] = *b"tk1 ";
/// Second word of the app name.
pub const APP_NAME1: [u8; 4] = *b"fido";
/// App version, little-endian on the wire.
pub const APP_VERSION: u32 = 0x0000_0001;

/// First payload byte of every response after the response code.
pub const STATUS_OK: u8 = 0;
pub const STATUS_BAD: u8 = 1;

/// Sub-code carried in the second payload byte of a `STATUS_BAD` response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum BadSub {
    /// Request frame length does not match the command's fixed length.
    WrongLength = 0x01,
    /// P-256 scalar derived from the nonce was out of range.
    KeyGeneration = 0x02,
    /// ECDSA signing failed.
    Signing = 0x03,
    /// `AuthenticateGo` without an immediately preceding `AuthenticateSet`.
    MissingSession = 0x04,
}

/// Commands the app accepts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum AppCmd {
    GetNameVersion = 0x01,
    Register = 0x03,
    CheckOnly = 0x05,
    AuthenticateSet = 0x07,
    AuthenticateGo = 0x08,
}

impl AppCmd {
    /// The fixed request frame length for this command.
    pub const fn cmd_len(self) -> CmdLen {
        match self {
            Self::GetNameVersion => CmdLen::L1,
            Self::Register
            | Self::CheckOnly
            | Self::AuthenticateSet
            | Self::AuthenticateGo => CmdLen::L128,
        }
    }

    /// The response code this command is answered with.
    pub const fn response(self) -> AppRsp {
        match self {
            Self::GetNameVersion => AppRsp::GetNameVersion,
            Self::Register => AppRsp::Register,
            Self::CheckOnly => AppRsp::CheckOnly,
            Self::AuthenticateSet | Self::AuthenticateGo => AppRsp::Authenticate,
        }
    }
}

impl TryFrom<u8> for AppCmd {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Ok(match byte {
            0x01 => Self::GetNameVersion,
            0x03 => Self::Register,
            0x05 => Self::CheckOnly,
            0x07 => Self::AuthenticateSet,
            0x08 => Self::AuthenticateGo,
            unknown => return Err(unknown),
        })
    }
}

/// Response codes the app emits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum AppRsp {
    GetNameVersion = 0x02,
    Register = 0x04,
    CheckOnly = 0x06,
    Authenticate = 0x09,
    UnknownCmd = 0xff,
}

impl AppRsp {
    /// The fixed response frame length for this response code.
    pub const fn rsp_len(self) -> CmdLen {
        match self {
            Self::GetNameVersion => CmdLen::L32,
            Self::Register | Self::Authenticate => CmdLen::L128,
            Self::CheckOnly => CmdLen::L4,
            Self::UnknownCmd => CmdLen::L1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_roundtrip() {
        for cmd in [
            AppCmd::GetNameVersion,
            AppCmd::Register,
            AppCmd::CheckOnly,
            AppCmd::AuthenticateSet,
            AppCmd::AuthenticateGo,
        ] {
            assert_eq!(AppCmd::try_from(cmd as u8), Ok(cmd));
        }
        assert_eq!(AppCmd::try_from(0x02), Err(0x02));
        assert_eq!(AppCmd::try_from(0xff), Err(0xff));
    }

    #[test]
    fn response_sizes_fit_payloads() {
        // status + user_presence + keyhandle must fit one register response
        assert!(1 + 1 + 64 < AppRsp::Register.rsp_len().bytes());
        // status + valid + user_presence + signature must fit one frame
        assert!(1 + 1 + 1 + 64 < AppRsp::Authenticate.rsp_len().bytes());
        // status + name0 + name1 + version
        assert!(1 + 4 + 4 + 4 < AppRsp::GetNameVersion.rsp_len().bytes());
        assert!(1 + 1 < AppRsp::CheckOnly.rsp_len().bytes());
    }
}
