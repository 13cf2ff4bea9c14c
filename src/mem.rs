// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest physical memory owned by the oracle.
//!
//! The address space is a set of non-overlapping byte-addressable regions.
//! Accesses outside every region are reported to the caller so the lockstep
//! engine can emulate the device living at the unmapped address.

use remain::sorted;
use thiserror::Error;

pub const PAGE_SIZE: u64 = 4096;

#[sorted]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid guest address {addr:#x} (width {width})")]
    InvalidGuestAddress { addr: u64, width: usize },
    #[error("new region {base:#x}+{size:#x} overlaps an existing region")]
    RegionOverlap { base: u64, size: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

struct Region {
    base: u64,
    bytes: Vec<u8>,
}

impl Region {
    fn contains(&self, addr: u64, width: usize) -> bool {
        addr >= self.base && addr.saturating_add(width as u64) <= self.base + self.bytes.len() as u64
    }

    fn overlaps(&self, base: u64, size: usize) -> bool {
        base < self.base + self.bytes.len() as u64 && self.base < base.saturating_add(size as u64)
    }
}

/// Flat guest memory backed by in-process buffers, one per mapped region.
pub struct GuestMemory {
    regions: Vec<Region>,
}

impl GuestMemory {
    pub fn new() -> GuestMemory {
        GuestMemory {
            regions: Vec::new(),
        }
    }

    /// Maps `size` zeroed bytes at guest physical address `base`.
    pub fn add_region(&mut self, base: u64, size: usize) -> Result<()> {
        if self.regions.iter().any(|r| r.overlaps(base, size)) {
            return Err(Error::RegionOverlap { base, size });
        }
        self.regions.push(Region {
            base,
            bytes: vec![0; size],
        });
        Ok(())
    }

    /// Returns whether `[addr, addr + width)` lies entirely inside one region.
    pub fn is_mapped(&self, addr: u64, width: usize) -> bool {
        self.regions.iter().any(|r| r.contains(addr, width))
    }

    fn region(&self, addr: u64, width: usize) -> Result<&Region> {
        self.regions
            .iter()
            .find(|r| r.contains(addr, width))
            .ok_or(Error::InvalidGuestAddress { addr, width })
    }

    fn region_mut(&mut self, addr: u64, width: usize) -> Result<&mut Region> {
        self.regions
            .iter_mut()
            .find(|r| r.contains(addr, width))
            .ok_or(Error::InvalidGuestAddress { addr, width })
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        let region = self.region(addr, 1)?;
        Ok(region.bytes[(addr - region.base) as usize])
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) -> Result<()> {
        let region = self.region_mut(addr, 1)?;
        let offset = (addr - region.base) as usize;
        region.bytes[offset] = value;
        Ok(())
    }

    pub fn read_slice(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let region = self.region(addr, buf.len())?;
        let offset = (addr - region.base) as usize;
        buf.copy_from_slice(&region.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    pub fn write_slice(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let region = self.region_mut(addr, data.len())?;
        let offset = (addr - region.base) as usize;
        region.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Default for GuestMemory {
    fn default() -> GuestMemory {
        GuestMemory::new()
    }
}
