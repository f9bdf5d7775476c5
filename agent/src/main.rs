// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

use std::io::Read;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::thread;

use blake2::{Blake2s256, Digest as _};
use clap::Parser;
use log::{error, info};
use sha2::{Digest as _, Sha256};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use tkey_fido_agent::client::{self, Config, DeviceClient};
use tkey_fido_agent::counter::CounterStore;
use tkey_fido_agent::hid::SoftHid;
use tkey_fido_agent::sock;

/// Expose a TKey running the fido app as a U2F authenticator.
#[derive(Debug, Parser)]
#[command(name = "tkey-fido", version, about)]
struct Args {
    /// List possible serial ports to use with --port.
    #[arg(short = 'L', long)]
    list_ports: bool,

    /// Serial port device PATH. Auto-detection is attempted when unset.
    #[arg(long, value_name = "PATH")]
    port: Option<String>,

    /// Serial port speed in bits per second.
    #[arg(long, value_name = "BPS", default_value_t = client::SERIAL_SPEED)]
    speed: u32,

    /// Read FILE and hash its contents as the User Supplied Secret passed to
    /// the app loader. Use '-' to read from stdin.
    #[arg(long, value_name = "FILE")]
    uss_file: Option<PathBuf>,

    /// Unix socket the USB-HID bridge connects to.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Run a simple U2F register/authenticate test against the TKey, then
    /// exit.
    #[arg(long)]
    test: bool,
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    if args.list_ports {
        exit(list_ports());
    }

    let uss_digest = match args.uss_file.as_deref() {
        Some(path) => match read_uss(path) {
            Ok(digest) => Some(digest),
            Err(err) => {
                error!("failed to read uss-file {}: {}", path.display(), err);
                exit(1);
            }
        },
        None => None,
    };

    let client = DeviceClient::new(Config {
        dev_path: args.port,
        speed: args.speed,
        uss_digest,
    });

    handle_signals(client.clone());

    if args.test {
        exit(self_test(&client));
    }

    let socket = args.socket.unwrap_or_else(default_socket_path);
    let hid = Arc::new(SoftHid::new(client, CounterStore::open_default()));
    if let Err(err) = sock::serve(&socket, hid) {
        error!("serving {} failed: {}", socket.display(), err);
        exit(1);
    }
}

fn list_ports() -> i32 {
    match client::tkey_ports() {
        Ok(ports) if ports.is_empty() => {
            eprintln!("No TKey serial ports found.");
            1
        }
        Ok(ports) => {
            eprintln!("TKey serial ports (on stdout):");
            for (path, serial) in ports {
                println!("{} serialNumber:{}", path, serial.unwrap_or_default());
            }
            0
        }
        Err(err) => {
            error!("failed to list ports: {}", err);
            1
        }
    }
}

/// The full file contents are hashed unmodified; a different secret yields a
/// different CDI and thereby different credentials.
fn read_uss(path: &std::path::Path) -> std::io::Result<[u8; 32]> {
    let contents = if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        buf
    } else {
        std::fs::read(path)?
    };
    Ok(Blake2s256::digest(&contents).into())
}

fn default_socket_path() -> PathBuf {
    directories::ProjectDirs::from("se", "tillitis", "tkey-fido")
        .and_then(|dirs| dirs.runtime_dir().map(|dir| dir.to_path_buf()))
        .unwrap_or_else(std::env::temp_dir)
        .join("tkey-fido.sock")
}

fn handle_signals(client: DeviceClient) {
    // HUP is ignored on purpose: an old udev rule may still send it
    let mut signals = match Signals::new([SIGHUP, SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(err) => {
            error!("failed to install signal handlers: {}", err);
            return;
        }
    };
    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGHUP => info!("ignoring SIGHUP"),
                _ => {
                    info!("exiting on signal {}", signal);
                    client.close_now();
                    exit(1);
                }
            }
        }
    });
}

/// Register, check and authenticate against the plugged-in TKey, verifying
/// the returned signature on the way. Touch twice when the LED flashes.
fn self_test(client: &DeviceClient) -> i32 {
    use p256::ecdsa::signature::hazmat::PrehashVerifier;
    use p256::ecdsa::{Signature, VerifyingKey};

    let app_param: [u8; 32] = Sha256::digest(b"example.com").into();
    let chall_param: [u8; 32] = Sha256::digest(b"self-test challenge").into();
    let counter = 0u32;

    println!("Register (touch the TKey)...");
    let registration = match client.u2f_register(app_param) {
        Ok(registration) => registration,
        Err(err) => {
            error!("register failed: {}", err);
            return 1;
        }
    };
    let (Some(key_handle), Some(public_key)) = (registration.key_handle, registration.public_key)
    else {
        error!("user not present, bailing out");
        return 1;
    };
    println!("Register done, keyhandle of {} bytes", key_handle.len());

    println!("CheckOnly...");
    match client.u2f_check_only(app_param, key_handle) {
        Ok(true) => {}
        Ok(false) => {
            error!("keyhandle not valid, bailing out");
            return 1;
        }
        Err(err) => {
            error!("check-only failed: {}", err);
            return 1;
        }
    }

    println!("Authenticate (touch the TKey)...");
    let assertion =
        match client.u2f_authenticate(app_param, chall_param, key_handle, true, counter) {
            Ok(assertion) => assertion,
            Err(err) => {
                error!("authenticate failed: {}", err);
                return 1;
            }
        };
    if !assertion.key_handle_valid || assertion.user_presence == 0 {
        error!("no valid assertion, bailing out");
        return 1;
    }
    let Some(signature_der) = assertion.signature_der else {
        error!("no signature, bailing out");
        return 1;
    };

    let mut signed = Vec::with_capacity(69);
    signed.extend_from_slice(&app_param);
    signed.push(assertion.user_presence);
    signed.extend_from_slice(&counter.to_be_bytes());
    signed.extend_from_slice(&chall_param);
    let digest: [u8; 32] = Sha256::digest(&signed).into();

    let verified = VerifyingKey::from_sec1_bytes(&public_key)
        .and_then(|key| {
            Signature::from_der(&signature_der)
                .and_then(|signature| key.verify_prehash(&digest, &signature))
        })
        .is_ok();

    if verified {
        println!("Their signature verified!");
        0
    } else {
        println!("Their signature did NOT verify");
        1
    }
}
