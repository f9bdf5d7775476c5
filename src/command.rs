// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

//! Decoded command requests, borrowed out of the frame buffer.

use core::convert::TryFrom;

use tkey_framing::CmdLen;

use crate::ensure;
use crate::proto::AppCmd;

/// Decoded command request, along with data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command<'l> {
    /// Identify the running app.
    GetNameVersion,
    /// Mint a key pair and handle for a relying party.
    Register(Register<'l>),
    /// Ask whether a key handle belongs to this device, nothing else.
    CheckOnly(CheckOnly<'l>),
    /// Stage the parameters of an authentication.
    AuthenticateSet(AuthenticateSet<'l>),
    /// Commit the staged authentication.
    AuthenticateGo(AuthenticateGo<'l>),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Register<'l> {
    pub app_param: &'l [u8; 32],
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CheckOnly<'l> {
    pub app_param: &'l [u8; 32],
    pub key_handle: &'l [u8; 64],
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuthenticateSet<'l> {
    pub app_param: &'l [u8; 32],
    pub chall_param: &'l [u8; 32],
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuthenticateGo<'l> {
    pub key_handle: &'l [u8; 64],
    pub check_user: bool,
    pub counter: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// Command byte outside the app's table; answered with `UnknownCmd`.
    UnknownCommand(u8),
    /// Known command inside a frame of the wrong fixed length.
    WrongLength(AppCmd),
}

impl<'l> Command<'l> {
    /// Decode one frame payload. `data` is the complete payload (command
    /// byte first) and `frame_len` the length code from the frame header.
    pub fn parse(frame_len: CmdLen, data: &'l [u8]) -> Result<Self, ParseError> {
        let cmd = AppCmd::try_from(data[0]).map_err(ParseError::UnknownCommand)?;
        ensure(frame_len == cmd.cmd_len(), ParseError::WrongLength(cmd))?;
        let args = &data[1..];

        Ok(match cmd {
            AppCmd::GetNameVersion => Self::GetNameVersion,
            AppCmd::Register => Self::Register(Register {
                app_param: field32(args, 0).ok_or(ParseError::WrongLength(cmd))?,
            }),
            AppCmd::CheckOnly => Self::CheckOnly(CheckOnly {
                app_param: field32(args, 0).ok_or(ParseError::WrongLength(cmd))?,
                key_handle: field64(args, 32).ok_or(ParseError::WrongLength(cmd))?,
            }),
            AppCmd::AuthenticateSet => Self::AuthenticateSet(AuthenticateSet {
                app_param: field32(args, 0).ok_or(ParseError::WrongLength(cmd))?,
                chall_param: field32(args, 32).ok_or(ParseError::WrongLength(cmd))?,
            }),
            AppCmd::AuthenticateGo => {
                let key_handle = field64(args, 0).ok_or(ParseError::WrongLength(cmd))?;
                let check_user = *args.get(64).ok_or(ParseError::WrongLength(cmd))? != 0;
                let counter = args
                    .get(65..69)
                    .and_then(|b| b.try_into().ok())
                    .map(u32::from_be_bytes)
                    .ok_or(ParseError::WrongLength(cmd))?;
                Self::AuthenticateGo(AuthenticateGo {
                    key_handle,
                    check_user,
                    counter,
                })
            }
        })
    }
}

fn field32(data: &[u8], offset: usize) -> Option<&[u8; 32]> {
    data.get(offset..offset + 32)?.try_into().ok()
}

fn field64(data: &[u8], offset: usize) -> Option<&[u8; 64]> {
    data.get(offset..offset + 64)?.try_into().ok()
}
