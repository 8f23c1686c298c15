//! # Content Fingerprints
//!
//! Every DIO is reduced to a 16-bit CRC-16/XMODEM fingerprint (polynomial
//! `0x1021`, initial value `0x0000`, MSB-first, no final XOR). Receivers and
//! senders compute it independently, so the bit manipulation must stay exact.
//!
//! Distinct payloads may collide. A collision is indistinguishable from a
//! replay and is accepted as a false positive.

use std::fmt;

/// CRC-16/XMODEM generator polynomial.
pub const CRC16_POLY: u16 = 0x1021;

/// Register value before the first byte is folded in.
pub const CRC16_INIT: u16 = 0x0000;

/// 16-bit content fingerprint of a DIO payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u16);

impl Fingerprint {
    /// Fingerprint a payload.
    #[inline]
    pub fn of(payload: &[u8]) -> Self {
        Self(crc16_xmodem(payload))
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl From<Fingerprint> for u16 {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// Shorthand for [`Fingerprint::of`].
#[inline]
pub fn fingerprint(payload: &[u8]) -> Fingerprint {
    Fingerprint::of(payload)
}

fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}
