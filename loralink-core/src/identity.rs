//! Device identity: 32-bit device ID, stable across restarts once persisted.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Placeholder ID the firmware shipped with; never handed out as a real identity.
pub const RESERVED_DEVICE_ID: u32 = 0xA1B2_C3D4;

/// Device ID. Carried big-endian on the wire (beacon, heartbeat, bind packets).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(u32);

impl DeviceId {
    pub const fn new(raw: u32) -> Self {
        DeviceId(raw)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn to_be_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        DeviceId(u32::from_be_bytes(bytes))
    }

    /// Generate a fresh ID: low 4 bytes of `hardware_bits` XOR a random u32.
    /// `hardware_bits` may be empty (pure random ID).
    pub fn generate(hardware_bits: &[u8]) -> Self {
        let mut hw = [0u8; 4];
        let tail = &hardware_bits[hardware_bits.len().saturating_sub(4)..];
        hw[4 - tail.len()..].copy_from_slice(tail);
        let raw = u32::from_be_bytes(hw) ^ rand::thread_rng().next_u32();
        Self::sanitize(raw)
    }

    fn sanitize(raw: u32) -> Self {
        match raw {
            RESERVED_DEVICE_ID => DeviceId(raw ^ 0x1234_5678),
            0 => DeviceId(0x0000_0001),
            _ => DeviceId(raw),
        }
    }

    /// Parse a hexadecimal ID as typed by an operator ("33334444", "0x33334444").
    pub fn parse_hex(s: &str) -> Option<Self> {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.is_empty() || digits.len() > 8 {
            return None;
        }
        u32::from_str_radix(digits, 16).ok().map(DeviceId)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl From<u32> for DeviceId {
    fn from(raw: u32) -> Self {
        DeviceId(raw)
    }
}
