// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

#![cfg_attr(not(test), no_std)]
#![warn(
    missing_debug_implementations,
    non_ascii_idents,
    trivial_casts,
    unused,
    unused_qualifications,
    clippy::expect_used,
    clippy::unwrap_used
)]
#![deny(unsafe_code)]

//! U2F/FIDO device application for the TKey security token.
//!
//! The TKey has no writable persistent storage, so the app never stores key
//! material: per-site P-256 private keys are derived on demand from the
//! Compound Device Identifier (CDI) and a fresh nonce, and handed back to the
//! relying party wrapped in a self-authenticating key handle. Loading a
//! different app binary (or the same binary with a different user-supplied
//! secret) yields a different CDI and thereby a different key universe.
//!
//! The crate is hardware-agnostic: everything the app needs from the chip is
//! behind the [`hal::Hal`] trait, and the serial link is behind
//! [`app::SerialIo`]. The `virt` feature provides software implementations of
//! both for tests and for the host agent's integration tests.

#[macro_use]
extern crate delog;
generate_macros!();

#[cfg(all(feature = "virt", not(test)))]
extern crate std;

pub mod app;
pub mod command;
pub mod hal;
pub mod proto;
pub mod rng;
pub mod u2f;

#[cfg(any(test, feature = "virt"))]
pub mod virt;

pub use app::App;

/// How long a registration or authentication waits for a touch.
pub const TOUCH_TIMEOUT_SECS: u32 = 10;

fn ensure<T>(cond: bool, err: T) -> core::result::Result<(), T> {
    match cond {
        true => Ok(()),
        false => Err(err),
    }
}
