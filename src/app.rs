// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

//! The app's run loop: frame parsing, command dispatch, responses.

use tkey_framing::{Endpoint, FrameHeader, CMDLEN_MAXBYTES};

use crate::command::{Command, ParseError};
use crate::hal::{Hal, LedColor};
use crate::proto::{self, AppRsp, BadSub};
use crate::rng::CdiRng;
use crate::u2f::{Assertion, KeyHandle, Registration, U2f};

/// The byte-oriented serial link to the host.
///
/// All reads block; the device has nothing else to do.
pub trait SerialIo {
    type Error;

    fn read_byte(&mut self) -> Result<u8, Self::Error>;
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Self::Error>;
    fn write_all(&mut self, buf: &[u8]) -> Result<(), Self::Error>;
}

/// Parameters staged by `AuthenticateSet`, consumed by the `AuthenticateGo`
/// that must follow immediately. Any other command in between drops the
/// session.
struct SigningSession {
    app_param: [u8; 32],
    chall_param: [u8; 32],
}

/// The device application.
pub struct App<H: Hal> {
    hal: H,
    rng: CdiRng,
    u2f: U2f,
    session: Option<SigningSession>,
}

impl<H: Hal> core::fmt::Debug for App<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("App")
            .field("session", &self.session.is_some())
            .finish()
    }
}

impl<H: Hal> App<H> {
    /// Reads the CDI and seeds the RNG; the hardware owns the CDI after this,
    /// the app keeps its copy only inside the key-handle core.
    pub fn new(mut hal: H) -> Self {
        let cdi = hal.cdi();
        let rng = CdiRng::init(&cdi, &mut hal);
        let u2f = U2f::new(cdi);
        hal.led(LedColor::Yellow);
        Self {
            hal,
            rng,
            u2f,
            session: None,
        }
    }

    /// Serve frames forever. Only transport errors escape.
    pub fn run<S: SerialIo>(&mut self, io: &mut S) -> Result<core::convert::Infallible, S::Error> {
        loop {
            self.step(io)?;
        }
    }

    /// Read and handle one frame. A malformed header is skipped silently so
    /// the loop re-synchronizes on the next byte.
    pub fn step<S: SerialIo>(&mut self, io: &mut S) -> Result<(), S::Error> {
        let byte = io.read_byte()?;
        let hdr = match FrameHeader::parse(byte) {
            Ok(hdr) => hdr,
            Err(_err) => {
                debug_now!("framing: skipping byte, {}", _err);
                return Ok(());
            }
        };

        let mut cmd = [0u8; CMDLEN_MAXBYTES];
        let data = &mut cmd[..hdr.len.bytes()];
        io.read_exact(data)?;

        match hdr.endpoint {
            Endpoint::Firmware => {
                // the host probes for firmware mode; tell it somebody else
                // already runs here
                info_now!("NOK to frame meant for firmware");
                io.write_all(&[hdr.reply_nok().to_byte(), 0])
            }
            Endpoint::App => {
                let result = self.dispatch(io, hdr, data);
                self.hal.led(LedColor::Yellow);
                result
            }
            _ => {
                info_now!("dropping frame for endpoint {:?}", hdr.endpoint);
                Ok(())
            }
        }
    }

    fn dispatch<S: SerialIo>(
        &mut self,
        io: &mut S,
        hdr: FrameHeader,
        data: &[u8],
    ) -> Result<(), S::Error> {
        // staging only survives from a SET into the very next command
        let session = self.session.take();

        let command = match Command::parse(hdr.len, data) {
            Ok(command) => command,
            Err(ParseError::UnknownCommand(_code)) => {
                info_now!("unknown command 0x{:02x}", _code);
                return reply(io, hdr, AppRsp::UnknownCmd, &[]);
            }
            Err(ParseError::WrongLength(cmd)) => {
                info_now!("wrong frame length for {:?}", cmd);
                return reply_bad(io, hdr, cmd.response(), BadSub::WrongLength);
            }
        };

        match command {
            Command::GetNameVersion => {
                let mut body = [0u8; 13];
                body[0] = proto::STATUS_OK;
                body[1..5].copy_from_slice(&proto::APP_NAME0);
                body[5..9].copy_from_slice(&proto::APP_NAME1);
                body[9..].copy_from_slice(&proto::APP_VERSION.to_le_bytes());
                reply(io, hdr, AppRsp::GetNameVersion, &body)
            }

            Command::Register(register) => {
                let outcome = self.u2f.register(&mut self.hal, &mut self.rng, register.app_param);
                self.hal.led(LedColor::Off);
                match outcome {
                    Ok(Registration::NoUserPresence) => {
                        info_now!("register: no user present");
                        // two OK frames, but no key material
                        reply(io, hdr, AppRsp::Register, &[proto::STATUS_OK, 0])?;
                        reply(io, hdr, AppRsp::Register, &[proto::STATUS_OK])
                    }
                    Ok(Registration::Registered {
                        key_handle,
                        public_key,
                    }) => {
                        info_now!("register: success");
                        // user_presence and keyhandle exceed one frame
                        // together with the pubkey, so the second frame
                        // carries the pubkey alone
                        let mut first = [0u8; 2 + 64];
                        first[0] = proto::STATUS_OK;
                        first[1] = 1;
                        first[2..].copy_from_slice(&key_handle.to_bytes());
                        reply(io, hdr, AppRsp::Register, &first)?;

                        let mut second = [0u8; 1 + 64];
                        second[0] = proto::STATUS_OK;
                        second[1..].copy_from_slice(&public_key);
                        reply(io, hdr, AppRsp::Register, &second)
                    }
                    Err(err) => reply_bad(io, hdr, AppRsp::Register, err.into()),
                }
            }

            Command::CheckOnly(check) => {
                let valid = self
                    .u2f
                    .check_only(check.app_param, &KeyHandle::from_bytes(check.key_handle));
                reply(io, hdr, AppRsp::CheckOnly, &[proto::STATUS_OK, valid as u8])
            }

            Command::AuthenticateSet(set) => {
                self.session = Some(SigningSession {
                    app_param: *set.app_param,
                    chall_param: *set.chall_param,
                });
                reply(io, hdr, AppRsp::Authenticate, &[proto::STATUS_OK])
            }

            Command::AuthenticateGo(go) => {
                let Some(session) = session else {
                    info_now!("authenticate: GO without SET");
                    return reply_bad(io, hdr, AppRsp::Authenticate, BadSub::MissingSession);
                };

                let outcome = self.u2f.authenticate(
                    &mut self.hal,
                    &session.app_param,
                    &session.chall_param,
                    &KeyHandle::from_bytes(go.key_handle),
                    go.check_user,
                    go.counter,
                );
                self.hal.led(LedColor::Off);
                match outcome {
                    Ok(Assertion::InvalidHandle) => {
                        info_now!("authenticate: invalid keyhandle");
                        reply(io, hdr, AppRsp::Authenticate, &[proto::STATUS_OK, 0])
                    }
                    Ok(Assertion::NoUserPresence) => {
                        info_now!("authenticate: no user present");
                        reply(io, hdr, AppRsp::Authenticate, &[proto::STATUS_OK, 1, 0])
                    }
                    Ok(Assertion::Signed {
                        user_presence,
                        signature,
                    }) => {
                        info_now!("authenticate: success");
                        let mut body = [0u8; 3 + 64];
                        body[0] = proto::STATUS_OK;
                        body[1] = 1;
                        body[2] = user_presence as u8;
                        body[3..].copy_from_slice(&signature);
                        reply(io, hdr, AppRsp::Authenticate, &body)
                    }
                    Err(err) => reply_bad(io, hdr, AppRsp::Authenticate, err.into()),
                }
            }
        }
    }
}

impl From<crate::u2f::Error> for BadSub {
    fn from(err: crate::u2f::Error) -> Self {
        match err {
            crate::u2f::Error::KeyGeneration => Self::KeyGeneration,
            crate::u2f::Error::Signing => Self::Signing,
        }
    }
}

/// Send one response frame: header, response code, body, zero padding up to
/// the response's fixed length.
fn reply<S: SerialIo>(
    io: &mut S,
    hdr: FrameHeader,
    rsp: AppRsp,
    body: &[u8],
) -> Result<(), S::Error> {
    let mut frame: heapless::Vec<u8, { 1 + CMDLEN_MAXBYTES }> = heapless::Vec::new();
    frame.push(hdr.reply(rsp.rsp_len()).to_byte()).ok();
    frame.push(rsp as u8).ok();
    let n = body.len().min(rsp.rsp_len().bytes() - 1);
    frame.extend_from_slice(&body[..n]).ok();
    frame.resize(1 + rsp.rsp_len().bytes(), 0).ok();
    io.write_all(&frame)
}

fn reply_bad<S: SerialIo>(
    io: &mut S,
    hdr: FrameHeader,
    rsp: AppRsp,
    sub: BadSub,
) -> Result<(), S::Error> {
    reply(io, hdr, rsp, &[proto::STATUS_BAD, sub as u8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::AppCmd;
    use crate::virt::{ScriptIo, VirtHal};
    use tkey_framing::CmdLen;

    const CDI: [u8; 32] = [0x5a; 32];

    fn request(cmd: AppCmd, args: &[u8]) -> Vec<u8> {
        let hdr = FrameHeader::new(2, Endpoint::App, cmd.cmd_len()).unwrap();
        let mut frame = vec![hdr.to_byte()];
        frame.push(cmd as u8);
        frame.extend_from_slice(args);
        frame.resize(1 + cmd.cmd_len().bytes(), 0);
        frame
    }

    /// Pop one response frame off the transmit buffer.
    fn response(tx: &mut Vec<u8>) -> (FrameHeader, Vec<u8>) {
        assert!(!tx.is_empty(), "expected a response frame");
        let hdr = FrameHeader::parse(tx[0]).unwrap();
        let payload: Vec<u8> = tx[1..1 + hdr.len.bytes()].to_vec();
        tx.drain(..1 + hdr.len.bytes());
        (hdr, payload)
    }

    fn drive(app: &mut App<VirtHal>, io: &mut ScriptIo) {
        while app.step(io).is_ok() {}
    }

    #[test]
    fn name_version() {
        let mut app = App::new(VirtHal::new(CDI));
        let mut io = ScriptIo::feed(&request(AppCmd::GetNameVersion, &[]));
        drive(&mut app, &mut io);

        let (hdr, payload) = response(&mut io.tx);
        assert_eq!(hdr.len, CmdLen::L32);
        assert_eq!(payload[0], AppRsp::GetNameVersion as u8);
        assert_eq!(payload[1], proto::STATUS_OK);
        assert_eq!(&payload[2..6], b"tk1 ");
        assert_eq!(&payload[6..10], b"fido");
        assert_eq!(payload[10..14], 1u32.to_le_bytes());
        assert!(io.tx.is_empty());
    }

    #[test]
    fn register_emits_two_frames() {
        let mut app = App::new(VirtHal::new(CDI).touch_after(0));
        let mut io = ScriptIo::feed(&request(AppCmd::Register, &[0xaa; 32]));
        drive(&mut app, &mut io);

        let (_, first) = response(&mut io.tx);
        assert_eq!(first[0], AppRsp::Register as u8);
        assert_eq!(first[1], proto::STATUS_OK);
        assert_eq!(first[2], 1, "user presence");
        let key_handle = &first[3..3 + 64];

        let (_, second) = response(&mut io.tx);
        assert_eq!(second[0], AppRsp::Register as u8);
        assert_eq!(second[1], proto::STATUS_OK);
        let public_key = &second[2..2 + 64];

        assert!(io.tx.is_empty());
        assert_ne!(key_handle, [0u8; 64]);
        assert_ne!(public_key, [0u8; 64]);
    }

    #[test]
    fn register_touch_timeout() {
        let mut app = App::new(VirtHal::new(CDI));
        let mut io = ScriptIo::feed(&request(AppCmd::Register, &[0xaa; 32]));
        drive(&mut app, &mut io);

        let (_, first) = response(&mut io.tx);
        assert_eq!(first[1], proto::STATUS_OK);
        assert_eq!(first[2], 0, "user presence");
        assert_eq!(&first[3..3 + 64], &[0u8; 64], "no key material");
        let (_, second) = response(&mut io.tx);
        assert_eq!(second[1], proto::STATUS_OK);
        assert_eq!(&second[2..2 + 64], &[0u8; 64]);
    }

    fn registered_handle(app: &mut App<VirtHal>) -> Vec<u8> {
        let mut io = ScriptIo::feed(&request(AppCmd::Register, &[0xaa; 32]));
        drive(app, &mut io);
        let (_, first) = response(&mut io.tx);
        assert_eq!(first[2], 1);
        first[3..3 + 64].to_vec()
    }

    #[test]
    fn check_only_valid_and_invalid() {
        let mut app = App::new(VirtHal::new(CDI).touch_after(0));
        let handle = registered_handle(&mut app);

        let mut args = vec![0xaa; 32];
        args.extend_from_slice(&handle);
        let mut io = ScriptIo::feed(&request(AppCmd::CheckOnly, &args));
        drive(&mut app, &mut io);
        let (hdr, payload) = response(&mut io.tx);
        assert_eq!(hdr.len, CmdLen::L4);
        assert_eq!(payload[1], proto::STATUS_OK);
        assert_eq!(payload[2], 1);

        // same handle under a different app_param
        let mut args = vec![0xbb; 32];
        args.extend_from_slice(&handle);
        let mut io = ScriptIo::feed(&request(AppCmd::CheckOnly, &args));
        drive(&mut app, &mut io);
        let (_, payload) = response(&mut io.tx);
        assert_eq!(payload[2], 0);
    }

    #[test]
    fn set_then_go_signs() {
        let mut app = App::new(VirtHal::new(CDI).touch_after(0));
        let handle = registered_handle(&mut app);

        let mut set_args = vec![0xaa; 32];
        set_args.extend_from_slice(&[0xcc; 32]);
        let mut go_args = handle.clone();
        go_args.push(0); // no presence check
        go_args.extend_from_slice(&7u32.to_be_bytes());

        let mut script = request(AppCmd::AuthenticateSet, &set_args);
        script.extend_from_slice(&request(AppCmd::AuthenticateGo, &go_args));
        let mut io = ScriptIo::feed(&script);
        drive(&mut app, &mut io);

        let (_, set_rsp) = response(&mut io.tx);
        assert_eq!(set_rsp[0], AppRsp::Authenticate as u8);
        assert_eq!(set_rsp[1], proto::STATUS_OK);

        let (_, go_rsp) = response(&mut io.tx);
        assert_eq!(go_rsp[1], proto::STATUS_OK);
        assert_eq!(go_rsp[2], 1, "keyhandle valid");
        assert_eq!(go_rsp[3], 0, "user presence not requested");
        assert_ne!(&go_rsp[4..4 + 64], &[0u8; 64]);
    }

    #[test]
    fn go_without_set_is_rejected() {
        let mut app = App::new(VirtHal::new(CDI).touch_after(0));
        let handle = registered_handle(&mut app);

        let mut go_args = handle;
        go_args.push(0);
        go_args.extend_from_slice(&0u32.to_be_bytes());
        let mut io = ScriptIo::feed(&request(AppCmd::AuthenticateGo, &go_args));
        drive(&mut app, &mut io);

        let (_, payload) = response(&mut io.tx);
        assert_eq!(payload[1], proto::STATUS_BAD);
        assert_eq!(payload[2], BadSub::MissingSession as u8);
    }

    #[test]
    fn staging_cleared_by_intervening_command() {
        let mut app = App::new(VirtHal::new(CDI).touch_after(0));
        let handle = registered_handle(&mut app);

        let mut set_args = vec![0xaa; 32];
        set_args.extend_from_slice(&[0xcc; 32]);
        let mut go_args = handle;
        go_args.push(0);
        go_args.extend_from_slice(&0u32.to_be_bytes());

        let mut script = request(AppCmd::AuthenticateSet, &set_args);
        script.extend_from_slice(&request(AppCmd::GetNameVersion, &[]));
        script.extend_from_slice(&request(AppCmd::AuthenticateGo, &go_args));
        let mut io = ScriptIo::feed(&script);
        drive(&mut app, &mut io);

        let (_, _set_rsp) = response(&mut io.tx);
        let (_, _name_rsp) = response(&mut io.tx);
        let (_, go_rsp) = response(&mut io.tx);
        assert_eq!(go_rsp[1], proto::STATUS_BAD);
        assert_eq!(go_rsp[2], BadSub::MissingSession as u8);
    }

    #[test]
    fn wrong_length_is_bad() {
        // register code inside a 1-byte frame
        let hdr = FrameHeader::new(2, Endpoint::App, CmdLen::L1).unwrap();
        let mut app = App::new(VirtHal::new(CDI));
        let mut io = ScriptIo::feed(&[hdr.to_byte(), AppCmd::Register as u8]);
        drive(&mut app, &mut io);

        let (_, payload) = response(&mut io.tx);
        assert_eq!(payload[0], AppRsp::Register as u8);
        assert_eq!(payload[1], proto::STATUS_BAD);
        assert_eq!(payload[2], BadSub::WrongLength as u8);
    }

    #[test]
    fn unknown_command() {
        let hdr = FrameHeader::new(2, Endpoint::App, CmdLen::L1).unwrap();
        let mut app = App::new(VirtHal::new(CDI));
        let mut io = ScriptIo::feed(&[hdr.to_byte(), 0x42]);
        drive(&mut app, &mut io);

        let (hdr, payload) = response(&mut io.tx);
        assert_eq!(hdr.len, CmdLen::L1);
        assert_eq!(payload, [AppRsp::UnknownCmd as u8]);
    }

    #[test]
    fn firmware_endpoint_gets_one_nok() {
        let hdr = FrameHeader::new(1, Endpoint::Firmware, CmdLen::L1).unwrap();
        let mut app = App::new(VirtHal::new(CDI));
        let mut io = ScriptIo::feed(&[hdr.to_byte(), 0x01]);
        drive(&mut app, &mut io);

        let (hdr, payload) = response(&mut io.tx);
        assert!(hdr.not_ok);
        assert_eq!(hdr.id, 1);
        assert_eq!(payload, [0]);
        assert!(io.tx.is_empty());
    }

    #[test]
    fn unknown_endpoint_is_dropped() {
        let hdr = FrameHeader::new(2, Endpoint::HwFpga, CmdLen::L1).unwrap();
        let mut app = App::new(VirtHal::new(CDI));
        let mut io = ScriptIo::feed(&[hdr.to_byte(), 0x01]);
        drive(&mut app, &mut io);
        assert!(io.tx.is_empty());
    }

    #[test]
    fn malformed_header_resynchronizes() {
        let mut script = vec![0x80]; // reserved bit set: skipped
        script.extend_from_slice(&request(AppCmd::GetNameVersion, &[]));
        let mut app = App::new(VirtHal::new(CDI));
        let mut io = ScriptIo::feed(&script);
        drive(&mut app, &mut io);

        let (_, payload) = response(&mut io.tx);
        assert_eq!(payload[0], AppRsp::GetNameVersion as u8);
        assert_eq!(payload[1], proto::STATUS_OK);
    }

    #[test]
    fn led_returns_to_idle_after_reply() {
        let mut app = App::new(VirtHal::new(CDI));
        let mut io = ScriptIo::feed(&request(AppCmd::GetNameVersion, &[]));
        drive(&mut app, &mut io);
        assert_eq!(app.hal.led_state(), LedColor::Yellow);
    }
}
