// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

//! Attachment point for the USB-HID emulation layer.
//!
//! The kernel-facing uhid bridge lives outside this crate; it connects over
//! a Unix socket and exchanges length-prefixed U2F raw messages: two bytes
//! big-endian length, then the message, same framing both ways.

use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use log::{debug, info, warn};

use crate::hid::SoftHid;

pub fn serve(path: &Path, hid: Arc<SoftHid>) -> io::Result<()> {
    // a stale socket from a previous run would make bind fail
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    info!("listening for the HID bridge on {}", path.display());

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let hid = Arc::clone(&hid);
                thread::spawn(move || {
                    if let Err(err) = serve_stream(stream, &hid) {
                        debug!("HID bridge connection ended: {}", err);
                    }
                });
            }
            Err(err) => warn!("accept failed: {}", err),
        }
    }
    Ok(())
}

fn serve_stream(mut stream: UnixStream, hid: &SoftHid) -> io::Result<()> {
    loop {
        let mut len = [0u8; 2];
        match stream.read_exact(&mut len) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
        let mut msg = vec![0u8; usize::from(u16::from_be_bytes(len))];
        stream.read_exact(&mut msg)?;

        let response = hid.handle(&msg);

        stream.write_all(&(response.len() as u16).to_be_bytes())?;
        stream.write_all(&response)?;
    }
}
