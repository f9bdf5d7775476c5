// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

//! Hardware abstraction for the TKey.
//!
//! The real chip exposes all of this as memory-mapped registers; the app only
//! ever goes through this trait, which keeps the crate `no_std`-clean and
//! testable off-device.

/// The RGB status LED.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LedColor {
    Off,
    /// Registration: flashing while waiting for touch, steady while the
    /// keypair is derived.
    Blue,
    /// Authentication: flashing while waiting for touch, steady while
    /// signing.
    Green,
    /// App is idle, waiting for a command.
    Yellow,
}

/// What the app needs from the hardware.
///
/// All methods are infallible: the underlying registers cannot refuse a read
/// or a write, they can at most make the caller wait.
pub trait Hal {
    /// The Compound Device Identifier. Read once at app start; the value is
    /// stable for the lifetime of the loaded app.
    fn cdi(&self) -> [u8; 32];

    /// One word from the true random number generator. Blocks until the
    /// entropy pool has a word available.
    fn trng_word(&mut self) -> u32;

    fn led(&mut self, color: LedColor);

    /// Discard any pending touch event.
    fn touch_clear(&mut self);

    /// Whether a touch event is pending. Does not consume the event;
    /// call [`Hal::touch_clear`] after observing one.
    fn touch_event(&mut self) -> bool;

    /// Arm the countdown timer.
    fn timer_start(&mut self, secs: u32);

    fn timer_expired(&mut self) -> bool;
}

/// Polls between LED toggles while waiting for touch. On the 18 MHz chip
/// this flashes at roughly 2 Hz.
const FLASH_POLLS: u32 = 130_000;

/// Wait for a touch, flashing `color`, for at most
/// [`crate::TOUCH_TIMEOUT_SECS`]. Returns whether the user touched in time.
///
/// Stray touch events from before the wait are discarded, and the consumed
/// event is cleared again afterwards so it cannot satisfy a later wait.
pub fn wait_touched<H: Hal>(hal: &mut H, color: LedColor) -> bool {
    hal.timer_start(crate::TOUCH_TIMEOUT_SECS);
    hal.touch_clear();

    let mut touched = false;
    let mut led_on = false;
    'waiting: loop {
        hal.led(if led_on { color } else { LedColor::Off });
        for _ in 0..FLASH_POLLS {
            if hal.timer_expired() {
                break 'waiting;
            }
            if hal.touch_event() {
                hal.touch_clear();
                touched = true;
                break 'waiting;
            }
        }
        led_on = !led_on;
    }
    hal.led(LedColor::Off);

    touched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virt::VirtHal;

    #[test]
    fn touch_within_timeout() {
        let mut hal = VirtHal::new([7; 32]).touch_after(3);
        assert!(wait_touched(&mut hal, LedColor::Blue));
        // the consumed event must not satisfy a second wait
        assert!(!wait_touched(&mut hal, LedColor::Blue));
    }

    #[test]
    fn timeout_without_touch() {
        let mut hal = VirtHal::new([7; 32]);
        assert!(!wait_touched(&mut hal, LedColor::Green));
        assert_eq!(hal.led_state(), LedColor::Off);
    }

    #[test]
    fn stray_touch_discarded() {
        // A touch pending from before the wait starts must not count.
        let mut hal = VirtHal::new([7; 32]).stray_touch();
        assert!(!wait_touched(&mut hal, LedColor::Blue));
    }
}
