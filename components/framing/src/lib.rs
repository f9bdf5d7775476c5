// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

#![no_std]

//! The TKey serial framing protocol.
//!
//! Every frame on the wire is a single header byte followed by a fixed-size
//! payload. The header encodes a 2-bit frame id, the destination endpoint,
//! a response-status bit and one of four payload lengths:
//!
//! ```text
//! bit 7      reserved, must be zero
//! bits 6..5  frame id
//! bits 4..3  endpoint
//! bit 2      response status (0 = OK, 1 = NOK); unused in requests
//! bits 1..0  payload length code (1, 4, 32 or 128 bytes)
//! ```
//!
//! The payload's first byte is the command or response code; the remainder is
//! command data, zero-padded up to the fixed length.

use core::fmt;

/// Destination (or origin) of a frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Endpoint {
    /// CPU hardware endpoint; unused in this protocol revision.
    HwCpu = 0,
    /// FPGA hardware endpoint; unused in this protocol revision.
    HwFpga = 1,
    /// Firmware running on the CPU.
    Firmware = 2,
    /// Application running on the CPU.
    App = 3,
}

impl Endpoint {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::HwCpu,
            1 => Self::HwFpga,
            2 => Self::Firmware,
            _ => Self::App,
        }
    }
}

/// The four fixed payload lengths a frame can carry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CmdLen {
    L1 = 0,
    L4 = 1,
    L32 = 2,
    L128 = 3,
}

impl CmdLen {
    /// Payload length in bytes, command/response code byte included.
    pub const fn bytes(self) -> usize {
        match self {
            Self::L1 => 1,
            Self::L4 => 4,
            Self::L32 => 32,
            Self::L128 => 128,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::L1,
            1 => Self::L4,
            2 => Self::L32,
            _ => Self::L128,
        }
    }
}

/// Maximum frame payload, in bytes.
pub const CMDLEN_MAXBYTES: usize = CmdLen::L128.bytes();

/// A decoded frame header byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    /// Frame id, 0..=3. Echoed back in responses so the other side can pair
    /// them with requests.
    pub id: u8,
    pub endpoint: Endpoint,
    /// Response status; only meaningful in responses.
    pub not_ok: bool,
    pub len: CmdLen,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameError {
    /// Bit 7 of the header byte was set.
    ReservedBitSet,
    /// Frame id out of range (when constructing a header).
    BadFrameId,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservedBitSet => f.write_str("reserved header bit set"),
            Self::BadFrameId => f.write_str("frame id out of range"),
        }
    }
}

impl FrameHeader {
    pub fn new(id: u8, endpoint: Endpoint, len: CmdLen) -> Result<Self, FrameError> {
        if id > 3 {
            return Err(FrameError::BadFrameId);
        }
        Ok(Self {
            id,
            endpoint,
            not_ok: false,
            len,
        })
    }

    /// Parse a received header byte. Fails only on the reserved bit; all
    /// other bit patterns decode to something.
    pub fn parse(byte: u8) -> Result<Self, FrameError> {
        if byte & 0x80 != 0 {
            return Err(FrameError::ReservedBitSet);
        }
        Ok(Self {
            id: (byte >> 5) & 0b11,
            endpoint: Endpoint::from_bits(byte >> 3),
            not_ok: byte & 0b100 != 0,
            len: CmdLen::from_bits(byte),
        })
    }

    pub fn to_byte(self) -> u8 {
        (self.id << 5) | ((self.endpoint as u8) << 3) | ((self.not_ok as u8) << 2) | self.len as u8
    }

    /// Header for a response to this frame, same id, given payload length.
    pub fn reply(self, len: CmdLen) -> Self {
        Self {
            id: self.id,
            endpoint: self.endpoint,
            not_ok: false,
            len,
        }
    }

    /// Header for a NOK response to this frame: status bit set, minimal
    /// payload.
    pub fn reply_nok(self) -> Self {
        Self {
            id: self.id,
            endpoint: self.endpoint,
            not_ok: true,
            len: CmdLen::L1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        for id in 0..=3u8 {
            for endpoint in [
                Endpoint::HwCpu,
                Endpoint::HwFpga,
                Endpoint::Firmware,
                Endpoint::App,
            ] {
                for not_ok in [false, true] {
                    for len in [CmdLen::L1, CmdLen::L4, CmdLen::L32, CmdLen::L128] {
                        let hdr = FrameHeader {
                            id,
                            endpoint,
                            not_ok,
                            len,
                        };
                        assert_eq!(FrameHeader::parse(hdr.to_byte()), Ok(hdr));
                    }
                }
            }
        }
    }

    #[test]
    fn reserved_bit_rejected() {
        assert_eq!(
            FrameHeader::parse(0x80),
            Err(FrameError::ReservedBitSet)
        );
        assert_eq!(
            FrameHeader::parse(0xff),
            Err(FrameError::ReservedBitSet)
        );
    }

    #[test]
    fn known_encodings() {
        // id 2, app endpoint, 128-byte payload: the usual U2F request header
        let hdr = FrameHeader::new(2, Endpoint::App, CmdLen::L128).unwrap();
        assert_eq!(hdr.to_byte(), 0b0101_1011);
        // firmware probe: id 2, firmware endpoint, 1-byte payload
        let hdr = FrameHeader::new(2, Endpoint::Firmware, CmdLen::L1).unwrap();
        assert_eq!(hdr.to_byte(), 0b0101_0000);
    }

    #[test]
    fn nok_reply_shape() {
        let req = FrameHeader::new(1, Endpoint::Firmware, CmdLen::L128).unwrap();
        let nok = req.reply_nok();
        assert!(nok.not_ok);
        assert_eq!(nok.id, 1);
        assert_eq!(nok.len.bytes(), 1);
        let parsed = FrameHeader::parse(nok.to_byte()).unwrap();
        assert!(parsed.not_ok);
    }

    #[test]
    fn frame_id_range_checked() {
        assert_eq!(
            FrameHeader::new(4, Endpoint::App, CmdLen::L1),
            Err(FrameError::BadFrameId)
        );
    }
}
