// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The HAWK handshake devices.
//!
//! A HAWK device is a one-byte latch the guest pokes through either port i/o
//! or a single unmapped memory address. A write latches the byte; the
//! response to the next read depends on the device profile. The yakvm tree
//! grew two profiles (the in-kernel device answers with a transformed latch,
//! the userspace shim answers with a constant), so both are kept selectable.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolViolation;

/// What a HAWK device answers when the guest reads it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceProfile {
    /// Each read consumes the latch and returns the latched value minus one.
    /// Reading with nothing latched is a protocol violation.
    Decrement,
    /// Every read returns the same sentinel, latched or not.
    Fixed(u8),
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceProfile::Decrement => write!(f, "decrement"),
            DeviceProfile::Fixed(value) => write!(f, "fixed:{}", value),
        }
    }
}

impl FromStr for DeviceProfile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<DeviceProfile, String> {
        if s == "decrement" {
            return Ok(DeviceProfile::Decrement);
        }
        if let Some(value) = s.strip_prefix("fixed:") {
            let value = value
                .parse::<u8>()
                .map_err(|e| format!("bad fixed response {:?}: {}", value, e))?;
            return Ok(DeviceProfile::Fixed(value));
        }
        Err(format!(
            "unknown device profile {:?}, expected \"decrement\" or \"fixed:<byte>\"",
            s
        ))
    }
}

/// One HAWK device instance: a profile plus the latched byte, if any.
pub struct HawkDevice {
    label: &'static str,
    profile: DeviceProfile,
    latched: Option<u8>,
}

impl HawkDevice {
    pub fn new(label: &'static str, profile: DeviceProfile) -> HawkDevice {
        HawkDevice {
            label,
            profile,
            latched: None,
        }
    }

    pub fn latched(&self) -> Option<u8> {
        self.latched
    }

    /// Guest write access: latch the byte.
    pub fn write(&mut self, value: u8) {
        self.latched = Some(value);
    }

    /// Guest read access. Under [`DeviceProfile::Decrement`] this consumes
    /// the latch, so two reads without an intervening write are a protocol
    /// violation.
    pub fn read(&mut self) -> std::result::Result<u8, ProtocolViolation> {
        match self.profile {
            DeviceProfile::Fixed(value) => Ok(value),
            DeviceProfile::Decrement => self
                .latched
                .take()
                .map(|value| value.wrapping_sub(1))
                .ok_or(ProtocolViolation::DeviceReadBeforeWrite { device: self.label }),
        }
    }
}
