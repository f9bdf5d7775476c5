// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

//! Host agent for the TKey fido app.
//!
//! Two layers sit between the browser and the device. The
//! [`client::DeviceClient`] owns the serial connection: it lazily connects,
//! probes what is running on the stick, speaks the framed app protocol and
//! disconnects again after a short idle period so other programs can use the
//! TKey. The [`hid::SoftHid`] translator sits on top and speaks the U2F
//! raw-message format: it decodes requests handed over by the USB-HID
//! emulation layer, drives the device client, performs attestation signing
//! and always answers with a well-formed U2F status word.

pub mod attestation;
pub mod client;
pub mod counter;
pub mod hid;
pub mod sock;
pub mod u2f;
