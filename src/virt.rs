// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

//! Software platform for tests: a deterministic [`Hal`], a scripted serial
//! link for driving [`crate::App`] in unit tests, and an in-memory duplex
//! wire so the host agent's integration tests can talk to a real app
//! instance running on another thread.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use std::vec::Vec;

use crate::app::SerialIo;
use crate::hal::{Hal, LedColor};

/// Virtual polls per timer second. Kept tiny so touch timeouts expire after
/// a handful of loop iterations instead of ten wall-clock seconds.
const POLLS_PER_SEC: u32 = 4;

#[derive(Clone, Copy, Debug)]
enum TouchMode {
    Never,
    /// Produce a touch event after this many polls, once.
    After(u32),
    /// Touch immediately, every time something waits.
    Always,
}

/// Deterministic hardware: CDI as constructed, TRNG from a seeded xorshift,
/// touch and timer scripted by the test.
#[derive(Debug)]
pub struct VirtHal {
    cdi: [u8; 32],
    trng_state: u64,
    trng_drawn: usize,
    led: LedColor,
    touch: TouchMode,
    touch_pending: bool,
    timer_left: u32,
    touch_waits: usize,
}

impl VirtHal {
    pub fn new(cdi: [u8; 32]) -> Self {
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&cdi[..8]);
        Self {
            cdi,
            trng_state: u64::from_le_bytes(seed) | 1,
            trng_drawn: 0,
            led: LedColor::Off,
            touch: TouchMode::Never,
            touch_pending: false,
            timer_left: 0,
            touch_waits: 0,
        }
    }

    /// Script a touch `polls` touch-register reads into the next wait.
    pub fn touch_after(mut self, polls: u32) -> Self {
        self.touch = TouchMode::After(polls);
        self
    }

    /// A very cooperative user: every wait is answered with a touch.
    pub fn touch_always(mut self) -> Self {
        self.touch = TouchMode::Always;
        self
    }

    /// Leave a stale touch event pending from "before" the operation.
    pub fn stray_touch(mut self) -> Self {
        self.touch_pending = true;
        self
    }

    pub fn led_state(&self) -> LedColor {
        self.led
    }

    pub fn trng_words_drawn(&self) -> usize {
        self.trng_drawn
    }

    /// How many touch waits (timer arms) the app performed.
    pub fn touch_waits(&self) -> usize {
        self.touch_waits
    }
}

impl Hal for VirtHal {
    fn cdi(&self) -> [u8; 32] {
        self.cdi
    }

    fn trng_word(&mut self) -> u32 {
        self.trng_drawn += 1;
        self.trng_state ^= self.trng_state << 13;
        self.trng_state ^= self.trng_state >> 7;
        self.trng_state ^= self.trng_state << 17;
        (self.trng_state >> 32) as u32
    }

    fn led(&mut self, color: LedColor) {
        self.led = color;
    }

    fn touch_clear(&mut self) {
        self.touch_pending = false;
    }

    fn touch_event(&mut self) -> bool {
        match self.touch {
            TouchMode::After(0) => {
                self.touch_pending = true;
                self.touch = TouchMode::Never;
            }
            TouchMode::After(polls) => self.touch = TouchMode::After(polls - 1),
            TouchMode::Always => self.touch_pending = true,
            TouchMode::Never => {}
        }
        self.touch_pending
    }

    fn timer_start(&mut self, secs: u32) {
        self.touch_waits += 1;
        self.timer_left = secs.saturating_mul(POLLS_PER_SEC);
    }

    fn timer_expired(&mut self) -> bool {
        if self.timer_left == 0 {
            return true;
        }
        self.timer_left -= 1;
        false
    }
}

/// Serial link driven from a pre-recorded byte script; everything the app
/// writes lands in `tx`.
#[derive(Debug, Default)]
pub struct ScriptIo {
    rx: VecDeque<u8>,
    pub tx: Vec<u8>,
}

/// The script ran out: the test is over.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EndOfScript;

impl ScriptIo {
    pub fn feed(script: &[u8]) -> Self {
        Self {
            rx: script.iter().copied().collect(),
            tx: Vec::new(),
        }
    }
}

impl SerialIo for ScriptIo {
    type Error = EndOfScript;

    fn read_byte(&mut self) -> Result<u8, EndOfScript> {
        self.rx.pop_front().ok_or(EndOfScript)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), EndOfScript> {
        for byte in buf {
            *byte = self.rx.pop_front().ok_or(EndOfScript)?;
        }
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), EndOfScript> {
        self.tx.extend_from_slice(buf);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct WireState {
    host_to_device: VecDeque<u8>,
    device_to_host: VecDeque<u8>,
    host_closed: bool,
    device_closed: bool,
}

type SharedWire = Arc<(Mutex<WireState>, Condvar)>;

/// An in-memory serial cable. The host end speaks `std::io`, the device end
/// speaks [`SerialIo`]; both block like a real port.
pub fn wire() -> (HostWire, DeviceWire) {
    let shared: SharedWire = Arc::new((Mutex::new(WireState::default()), Condvar::new()));
    (
        HostWire {
            shared: shared.clone(),
            read_timeout: None,
        },
        DeviceWire { shared },
    )
}

/// Host end of the in-memory cable.
#[derive(Debug)]
pub struct HostWire {
    shared: SharedWire,
    read_timeout: Option<Duration>,
}

impl HostWire {
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }
}

impl io::Read for HostWire {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().map_err(|_| io::ErrorKind::Other)?;
        loop {
            if !state.device_to_host.is_empty() {
                let mut n = 0;
                while n < buf.len() {
                    match state.device_to_host.pop_front() {
                        Some(byte) => {
                            buf[n] = byte;
                            n += 1;
                        }
                        None => break,
                    }
                }
                return Ok(n);
            }
            if state.device_closed {
                return Ok(0);
            }
            state = match self.read_timeout {
                Some(timeout) => {
                    let (guard, result) = condvar
                        .wait_timeout(state, timeout)
                        .map_err(|_| io::ErrorKind::Other)?;
                    if result.timed_out() && guard.device_to_host.is_empty() {
                        return Err(io::ErrorKind::TimedOut.into());
                    }
                    guard
                }
                None => condvar.wait(state).map_err(|_| io::ErrorKind::Other)?,
            };
        }
    }
}

impl io::Write for HostWire {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().map_err(|_| io::ErrorKind::Other)?;
        if state.device_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.host_to_device.extend(buf);
        condvar.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for HostWire {
    fn drop(&mut self) {
        let (lock, condvar) = &*self.shared;
        if let Ok(mut state) = lock.lock() {
            state.host_closed = true;
            condvar.notify_all();
        }
    }
}

/// Device end of the in-memory cable.
#[derive(Debug)]
pub struct DeviceWire {
    shared: SharedWire,
}

/// The host hung up; the app thread should wind down.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WireClosed;

impl SerialIo for DeviceWire {
    type Error = WireClosed;

    fn read_byte(&mut self) -> Result<u8, WireClosed> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), WireClosed> {
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().map_err(|_| WireClosed)?;
        for byte in buf {
            loop {
                if let Some(b) = state.host_to_device.pop_front() {
                    *byte = b;
                    break;
                }
                if state.host_closed {
                    return Err(WireClosed);
                }
                state = condvar.wait(state).map_err(|_| WireClosed)?;
            }
        }
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), WireClosed> {
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().map_err(|_| WireClosed)?;
        if state.host_closed {
            return Err(WireClosed);
        }
        state.device_to_host.extend(buf);
        condvar.notify_all();
        Ok(())
    }
}

impl Drop for DeviceWire {
    fn drop(&mut self) {
        let (lock, condvar) = &*self.shared;
        if let Ok(mut state) = lock.lock() {
            state.device_closed = true;
            condvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn wire_carries_bytes_both_ways() {
        let (mut host, mut device) = wire();
        host.write_all(&[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        SerialIo::read_exact(&mut device, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        SerialIo::write_all(&mut device, &[4, 5]).unwrap();
        let mut buf = [0u8; 2];
        host.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [4, 5]);
    }

    #[test]
    fn host_read_times_out() {
        let (mut host, _device) = wire();
        host.set_read_timeout(Some(Duration::from_millis(10)));
        let mut buf = [0u8; 1];
        let err = host.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn device_read_fails_after_host_drop() {
        let (host, mut device) = wire();
        drop(host);
        assert_eq!(device.read_byte(), Err(WireClosed));
    }

    #[test]
    fn host_read_sees_eof_after_device_drop() {
        let (mut host, device) = wire();
        drop(device);
        let mut buf = [0u8; 1];
        assert_eq!(host.read(&mut buf).unwrap(), 0);
    }
}
