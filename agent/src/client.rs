// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

//! Serial connection to the fido app on the TKey.
//!
//! The client connects lazily: every U2F operation first makes sure a
//! connection exists, runs its framed exchanges under the client-wide mutex,
//! and then arms a short idle timer instead of closing the port. Browser
//! traffic comes in bursts (a check-only immediately followed by an
//! authenticate is the common case), so keeping the port open for a few
//! seconds amortizes the open/probe cost without hogging the TKey forever.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use p256::ecdsa::Signature;
use p256::PublicKey;
use tkey_framing::{CmdLen, Endpoint, FrameHeader};

use fido_app::proto::{self, AppCmd, AppRsp};

/// Default serial speed of the TKey, in bits per second.
pub const SERIAL_SPEED: u32 = 62_500;

/// USB vendor and product id of the TKey's CH552 serial converter.
pub const TKEY_VID: u16 = 0x1207;
pub const TKEY_PID: u16 = 0x8887;

/// How long the port stays open after the last operation.
const IDLE_DISCONNECT: Duration = Duration::from_secs(3);

/// Read timeout while probing what runs on the stick.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Frame id used for all exchanges with the app.
const FRAME_ID: u8 = 2;

/// Firmware identifies itself with these names on the firmware endpoint.
const FW_NAME0: [u8; 4] = *b"tk1 ";
const FW_NAME1: [u8; 4] = *b"mkdf";

#[derive(Debug)]
pub enum ClientError {
    /// Auto-detection found no TKey.
    NoDevice,
    /// Auto-detection found more than one TKey.
    ManyDevices,
    /// Opening the serial port failed.
    Open(String),
    Io(io::Error),
    /// Framing-level NOK response.
    Nok,
    /// A response frame did not match the request.
    UnexpectedResponse,
    /// The app replied BAD; the sub-code is the app's error byte.
    Device(u8),
    /// The device returned a public key that is not a valid P-256 point.
    InvalidPublicKey,
    /// Something is running on the stick, but it is not the fido app.
    WrongApp,
    /// The stick is in firmware mode and no app loader was configured.
    FirmwareMode,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevice => f.write_str("could not find any TKey plugged in"),
            Self::ManyDevices => f.write_str("cannot work with more than one TKey plugged in"),
            Self::Open(msg) => write!(f, "failed to open serial port: {}", msg),
            Self::Io(err) => write!(f, "serial i/o: {}", err),
            Self::Nok => f.write_str("device replied NOK"),
            Self::UnexpectedResponse => f.write_str("unexpected response frame"),
            Self::Device(sub) => write!(f, "device error 0x{:02x}", sub),
            Self::InvalidPublicKey => f.write_str("device returned an invalid public key"),
            Self::WrongApp => f.write_str("TKey is not running the fido app"),
            Self::FirmwareMode => f.write_str("TKey is in firmware mode, no app loader available"),
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// A byte-oriented link to the device. Production code opens a serial port;
/// tests plug in an in-memory wire.
pub trait Link: Read + Write + Send {
    /// `None` means block indefinitely (touch waits can take ten seconds).
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

/// Produces a fresh [`Link`] for every (re)connection.
pub type Connector = Box<dyn Fn() -> Result<Box<dyn Link>, ClientError> + Send + Sync>;

/// Uploads the app binary to a stick in firmware mode. The loader wire
/// protocol lives outside this crate; the agent only carries the seam.
pub trait Loader: Send + Sync {
    fn load(&self, link: &mut dyn Link, uss_digest: Option<&[u8; 32]>) -> Result<(), ClientError>;
}

#[derive(Debug)]
pub struct RegisterResult {
    pub user_presence: u8,
    /// Present iff the user touched.
    pub key_handle: Option<[u8; 64]>,
    /// Uncompressed SEC1 point, 0x04 marker included. Present iff the user
    /// touched.
    pub public_key: Option<[u8; 65]>,
}

#[derive(Debug)]
pub struct AuthenticateResult {
    pub key_handle_valid: bool,
    pub user_presence: u8,
    /// ASN.1 DER signature. Present iff the handle was valid and user
    /// presence, where demanded, was given.
    pub signature_der: Option<Vec<u8>>,
}

struct State {
    conn: Option<Connection>,
    /// Bumped by every connect/disconnect decision; a pending idle close
    /// only fires if the generation it captured is still current.
    generation: u64,
}

struct ClientInner {
    state: Mutex<State>,
    connector: Connector,
    loader: Option<Box<dyn Loader>>,
    uss_digest: Option<[u8; 32]>,
}

/// Connection manager and app-protocol client. Cheap to clone; all clones
/// share the one connection and its mutex.
#[derive(Clone)]
pub struct DeviceClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClient").finish_non_exhaustive()
    }
}

/// Serial port settings for the production connector.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Explicit port path; auto-detect when unset.
    pub dev_path: Option<String>,
    /// Serial speed; [`SERIAL_SPEED`] when zero.
    pub speed: u32,
    /// BLAKE2s digest of the user-supplied secret, passed to the loader.
    pub uss_digest: Option<[u8; 32]>,
}

impl DeviceClient {
    pub fn new(config: Config) -> Self {
        let uss_digest = config.uss_digest;
        Self::build(serial_connector(config), None, uss_digest)
    }

    /// Client over a custom transport; used by the integration tests.
    pub fn with_connector(connector: Connector) -> Self {
        Self::build(connector, None, None)
    }

    pub fn with_loader(config: Config, loader: Box<dyn Loader>) -> Self {
        let uss_digest = config.uss_digest;
        Self::build(serial_connector(config), Some(loader), uss_digest)
    }

    fn build(
        connector: Connector,
        loader: Option<Box<dyn Loader>>,
        uss_digest: Option<[u8; 32]>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                state: Mutex::new(State {
                    conn: None,
                    generation: 0,
                }),
                connector,
                loader,
                uss_digest,
            }),
        }
    }

    /// Run one operation against a live connection, connecting first if
    /// needed, and arm the idle timer afterwards. Any error tears the
    /// connection down so the next operation starts fresh.
    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        let result = {
            let mut state = self.inner.lock();
            state.generation += 1;
            if state.conn.is_none() {
                state.conn = Some(self.inner.open()?);
            }
            let Some(conn) = state.conn.as_mut() else {
                return Err(ClientError::UnexpectedResponse);
            };
            let result = op(conn);
            if result.is_err() {
                state.conn = None;
            }
            result
        };
        self.disconnect();
        result
    }

    /// Arm the idle timer. Never closes immediately: a quick follow-up
    /// operation cancels the close by bumping the generation.
    pub fn disconnect(&self) {
        let generation = {
            let mut state = self.inner.lock();
            if state.conn.is_none() {
                return;
            }
            state.generation += 1;
            state.generation
        };

        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            thread::sleep(IDLE_DISCONNECT);
            let mut state = inner.lock();
            if state.generation == generation && state.conn.is_some() {
                state.conn = None;
                info!("disconnected from TKey");
            }
        });
    }

    /// Close the port right now; for signal handlers.
    pub fn close_now(&self) {
        let mut state = self.inner.lock();
        state.generation += 1;
        state.conn = None;
    }

    pub fn u2f_register(&self, app_param: [u8; 32]) -> Result<RegisterResult, ClientError> {
        self.with_connection(|conn| {
            conn.write_app_cmd(AppCmd::Register, &app_param)?;

            let first = conn.expect_response(AppRsp::Register)?;
            let first = ok_body(&first)?;
            let user_presence = first[1];
            let mut key_handle = [0u8; 64];
            key_handle.copy_from_slice(&first[2..66]);

            // the pubkey does not fit the first frame; a second one always
            // follows a successful register
            let second = conn.expect_response(AppRsp::Register)?;
            let second = ok_body(&second)?;

            if user_presence == 0 {
                return Ok(RegisterResult {
                    user_presence,
                    key_handle: None,
                    public_key: None,
                });
            }

            let mut public_key = [0u8; 65];
            public_key[0] = 0x04;
            public_key[1..].copy_from_slice(&second[1..65]);
            if PublicKey::from_sec1_bytes(&public_key).is_err() {
                return Err(ClientError::InvalidPublicKey);
            }

            Ok(RegisterResult {
                user_presence,
                key_handle: Some(key_handle),
                public_key: Some(public_key),
            })
        })
    }

    pub fn u2f_check_only(
        &self,
        app_param: [u8; 32],
        key_handle: [u8; 64],
    ) -> Result<bool, ClientError> {
        self.with_connection(|conn| {
            let mut args = [0u8; 96];
            args[..32].copy_from_slice(&app_param);
            args[32..].copy_from_slice(&key_handle);
            conn.write_app_cmd(AppCmd::CheckOnly, &args)?;
            let body = conn.expect_response(AppRsp::CheckOnly)?;
            let body = ok_body(&body)?;
            Ok(body[1] != 0)
        })
    }

    /// The SET/GO pair is a wire detail: callers see one authenticate call,
    /// and the mutex inside [`Self::with_connection`] keeps the two frames
    /// back to back on the wire.
    pub fn u2f_authenticate(
        &self,
        app_param: [u8; 32],
        chall_param: [u8; 32],
        key_handle: [u8; 64],
        check_user: bool,
        counter: u32,
    ) -> Result<AuthenticateResult, ClientError> {
        self.with_connection(|conn| {
            let mut set_args = [0u8; 64];
            set_args[..32].copy_from_slice(&app_param);
            set_args[32..].copy_from_slice(&chall_param);
            conn.write_app_cmd(AppCmd::AuthenticateSet, &set_args)?;
            let body = conn.expect_response(AppRsp::Authenticate)?;
            ok_body(&body)?;

            let mut go_args = [0u8; 69];
            go_args[..64].copy_from_slice(&key_handle);
            go_args[64] = check_user as u8;
            go_args[65..].copy_from_slice(&counter.to_be_bytes());
            conn.write_app_cmd(AppCmd::AuthenticateGo, &go_args)?;
            let body = conn.expect_response(AppRsp::Authenticate)?;
            let body = ok_body(&body)?;

            let key_handle_valid = body[1] != 0;
            let user_presence = body[2];
            if !key_handle_valid || (check_user && user_presence == 0) {
                return Ok(AuthenticateResult {
                    key_handle_valid,
                    user_presence,
                    signature_der: None,
                });
            }

            let signature = Signature::from_slice(&body[3..67])
                .map_err(|_| ClientError::UnexpectedResponse)?;
            Ok(AuthenticateResult {
                key_handle_valid,
                user_presence,
                signature_der: Some(signature.to_der().as_bytes().to_vec()),
            })
        })
    }
}

impl ClientInner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self) -> Result<Connection, ClientError> {
        let link = (self.connector)()?;
        let mut conn = Connection { link };

        if conn.is_firmware_mode()? {
            info!("TKey is in firmware mode");
            match &self.loader {
                Some(loader) => {
                    info!("loading fido app");
                    loader.load(conn.link.as_mut(), self.uss_digest.as_ref())?;
                }
                None => {
                    error!("TKey is in firmware mode and no app loader is available");
                    return Err(ClientError::FirmwareMode);
                }
            }
        }

        if !conn.is_wanted_app()? {
            // kinda stuck here: ask the user to replug
            error!("please remove and plug in your TKey again - it might be running the wrong app");
            return Err(ClientError::WrongApp);
        }

        info!("connected to the fido app");
        Ok(conn)
    }
}

/// Check the app status byte; BAD carries a sub-code in the next byte.
fn ok_body(body: &[u8]) -> Result<&[u8], ClientError> {
    match body.first() {
        Some(&proto::STATUS_OK) => Ok(body),
        Some(&proto::STATUS_BAD) => Err(ClientError::Device(body.get(1).copied().unwrap_or(0))),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

struct Connection {
    link: Box<dyn Link>,
}

impl Connection {
    fn write_frame(
        &mut self,
        endpoint: Endpoint,
        code: u8,
        len: CmdLen,
        args: &[u8],
    ) -> Result<(), ClientError> {
        let hdr = FrameHeader::new(FRAME_ID, endpoint, len)
            .map_err(|_| ClientError::UnexpectedResponse)?;
        let mut frame = vec![0u8; 1 + len.bytes()];
        frame[0] = hdr.to_byte();
        frame[1] = code;
        frame[2..2 + args.len()].copy_from_slice(args);
        debug!("tx frame: cmd 0x{:02x}, {} bytes", code, frame.len());
        self.link.write_all(&frame)?;
        self.link.flush()?;
        Ok(())
    }

    fn write_app_cmd(&mut self, cmd: AppCmd, args: &[u8]) -> Result<(), ClientError> {
        self.write_frame(Endpoint::App, cmd as u8, cmd.cmd_len(), args)
    }

    fn read_frame(&mut self) -> Result<(FrameHeader, Vec<u8>), ClientError> {
        let mut hdr_byte = [0u8; 1];
        self.link.read_exact(&mut hdr_byte)?;
        let hdr = FrameHeader::parse(hdr_byte[0]).map_err(|_| ClientError::UnexpectedResponse)?;

        let mut payload = vec![0u8; hdr.len.bytes()];
        self.link.read_exact(&mut payload)?;
        debug!("rx frame: rsp 0x{:02x}, {} bytes", payload[0], payload.len());

        if hdr.not_ok {
            return Err(ClientError::Nok);
        }
        Ok((hdr, payload))
    }

    /// Read one frame and pair it with the request by response code and
    /// frame id. Returns the payload including the status byte.
    fn expect_response(&mut self, rsp: AppRsp) -> Result<Vec<u8>, ClientError> {
        let (hdr, payload) = self.read_frame()?;
        if hdr.id != FRAME_ID || payload[0] != rsp as u8 {
            warn!(
                "response mismatch: id {}, code 0x{:02x}",
                hdr.id, payload[0]
            );
            return Err(ClientError::UnexpectedResponse);
        }
        Ok(payload[1..].to_vec())
    }

    /// Whether the firmware, rather than an app, answers on the firmware
    /// endpoint. An app replies NOK there; silence means no stick at all.
    fn is_firmware_mode(&mut self) -> Result<bool, ClientError> {
        self.link.set_read_timeout(Some(PROBE_TIMEOUT))?;
        self.write_frame(Endpoint::Firmware, 0x01, CmdLen::L1, &[])?;
        let result = match self.read_frame() {
            Ok((_, payload)) => {
                // firmware name/version comes back bare: code, names, version
                Ok(payload[0] == 0x02
                    && payload[1..5] == FW_NAME0
                    && payload[5..9] == FW_NAME1)
            }
            Err(ClientError::Nok) => Ok(false),
            Err(ClientError::Io(err)) if err.kind() == io::ErrorKind::TimedOut => Ok(false),
            Err(err) => Err(err),
        };
        self.link.set_read_timeout(None)?;
        result
    }

    /// Whether the running app identifies as the fido app.
    fn is_wanted_app(&mut self) -> Result<bool, ClientError> {
        self.link.set_read_timeout(Some(PROBE_TIMEOUT))?;
        let result = (|| {
            self.write_app_cmd(AppCmd::GetNameVersion, &[])?;
            let body = self.expect_response(AppRsp::GetNameVersion)?;
            let body = ok_body(&body)?;
            Ok::<_, ClientError>(
                body[1..5] == proto::APP_NAME0 && body[5..9] == proto::APP_NAME1,
            )
        })();
        self.link.set_read_timeout(None)?;
        match result {
            Ok(wanted) => Ok(wanted),
            Err(ClientError::Io(err)) if err.kind() == io::ErrorKind::TimedOut => Ok(false),
            Err(err) => Err(err),
        }
    }
}

struct SerialLink(Box<dyn serialport::SerialPort>);

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Link for SerialLink {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        // the serial crate has no "block forever"; a day is close enough
        let timeout = timeout.unwrap_or(Duration::from_secs(86_400));
        self.0
            .set_timeout(timeout)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }
}

fn serial_connector(config: Config) -> Connector {
    Box::new(move || {
        let path = match &config.dev_path {
            Some(path) => path.clone(),
            None => {
                let path = detect_serial_port()?;
                info!("auto-detected serial port {}", path);
                path
            }
        };
        let speed = if config.speed == 0 {
            SERIAL_SPEED
        } else {
            config.speed
        };

        info!("connecting to TKey on serial port {}", path);
        let port = serialport::new(path.as_str(), speed)
            .timeout(PROBE_TIMEOUT)
            .open()
            .map_err(|err| ClientError::Open(err.to_string()))?;
        Ok(Box::new(SerialLink(port)) as Box<dyn Link>)
    })
}

/// Find the single plugged-in TKey by USB id.
pub fn detect_serial_port() -> Result<String, ClientError> {
    let mut ports = tkey_ports()?;
    match ports.len() {
        0 => Err(ClientError::NoDevice),
        1 => Ok(ports.remove(0).0),
        _ => Err(ClientError::ManyDevices),
    }
}

/// All serial ports that look like a TKey: `(path, usb serial number)`.
pub fn tkey_ports() -> Result<Vec<(String, Option<String>)>, ClientError> {
    let ports = serialport::available_ports().map_err(|err| ClientError::Open(err.to_string()))?;
    Ok(ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            serialport::SerialPortType::UsbPort(usb)
                if usb.vid == TKEY_VID && usb.pid == TKEY_PID =>
            {
                Some((port.port_name, usb.serial_number))
            }
            _ => None,
        })
        .collect())
}
