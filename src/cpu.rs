// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Minimal 16-bit x86 step engine for the oracle.
//!
//! This is not a general-purpose emulator. It executes exactly the
//! instruction set the yakvm guests use and reports everything the lockstep
//! engine must arbitrate as an explicit [`Exit`] event: halts, port i/o and
//! faulting accesses to unmapped memory. Port i/o retires with the program
//! counter already advanced; unmapped accesses leave the program counter on
//! the faulting instruction so the device shim decides how to resume.

use remain::sorted;
use thiserror::Error;

use crate::mem::GuestMemory;

pub const HLT_OPCODE: u8 = 0xf4;
pub const IN_OPCODE: u8 = 0xec;
pub const OUT_OPCODE: u8 = 0xee;

#[sorted]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("instruction fetch from unmapped address {0:#x}")]
    Fetch(u64),
    #[error("invalid opcode {opcode:#04x} at {addr:#x}")]
    InvalidOpcode { addr: u64, opcode: u8 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a call to [`Cpu::step`] returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Exit {
    /// The instruction retired with no external side effect.
    Continue,
    /// A hlt instruction retired.
    Hlt,
    /// An `in al, dx` retired; the handler must supply AL.
    In { port: u16 },
    /// An `out dx, al` retired with `value` taken from AL.
    Out { port: u16, value: u8 },
    /// A one-byte load faulted on unmapped memory. IP still points at the
    /// faulting instruction.
    FaultRead { addr: u64, width: u8 },
    /// A one-byte store faulted on unmapped memory. IP still points at the
    /// faulting instruction.
    FaultWrite { addr: u64, width: u8, value: u8 },
}

/// Oracle register file. General purpose registers are stored 32 bits wide
/// so the address-size-prefixed forms can use the full EDX value even though
/// the oracle runs in 16-bit real mode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Regs {
    pub ax: u32,
    pub cx: u32,
    pub dx: u32,
    pub bx: u32,
    pub sp: u32,
    pub bp: u32,
    pub si: u32,
    pub di: u32,
    pub ip: u64,
    pub ss: u16,
}

impl Regs {
    fn gpr_mut(&mut self, index: u8) -> &mut u32 {
        match index & 7 {
            0 => &mut self.ax,
            1 => &mut self.cx,
            2 => &mut self.dx,
            3 => &mut self.bx,
            4 => &mut self.sp,
            5 => &mut self.bp,
            6 => &mut self.si,
            _ => &mut self.di,
        }
    }

    /// Writes a byte register in encoding order (al, cl, dl, bl, ah...).
    pub fn write8(&mut self, index: u8, value: u8) {
        let high = index & 4 != 0;
        let reg = self.gpr_mut(index & 3);
        if high {
            *reg = (*reg & !0xff00) | (u32::from(value) << 8);
        } else {
            *reg = (*reg & !0xff) | u32::from(value);
        }
    }

    pub fn write16(&mut self, index: u8, value: u16) {
        let reg = self.gpr_mut(index);
        *reg = (*reg & !0xffff) | u32::from(value);
    }

    pub fn write32(&mut self, index: u8, value: u32) {
        *self.gpr_mut(index) = value;
    }

    pub fn al(&self) -> u8 {
        self.ax as u8
    }

    pub fn set_al(&mut self, value: u8) {
        self.write8(0, value);
    }

    pub fn dx16(&self) -> u16 {
        self.dx as u16
    }
}

pub struct Cpu {
    pub regs: Regs,
}

impl Cpu {
    /// A 16-bit real-mode CPU about to execute its first instruction at
    /// `entry`, with the stack segment derived from `stack`.
    pub fn new(entry: u64, stack: u64) -> Cpu {
        let mut regs = Regs::default();
        regs.ip = entry;
        regs.ss = (stack / 0x10) as u16;
        regs.sp = 0x1000;
        Cpu { regs }
    }

    pub fn ip(&self) -> u64 {
        self.regs.ip
    }

    pub fn set_ip(&mut self, ip: u64) {
        self.regs.ip = ip;
    }

    pub fn advance(&mut self, len: u64) {
        self.regs.ip += len;
    }

    fn fetch(&self, mem: &GuestMemory, addr: u64) -> Result<u8> {
        mem.read_u8(addr).map_err(|_| Error::Fetch(addr))
    }

    fn fetch_imm16(&self, mem: &GuestMemory, addr: u64) -> Result<u16> {
        let lo = self.fetch(mem, addr)?;
        let hi = self.fetch(mem, addr + 1)?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn fetch_imm32(&self, mem: &GuestMemory, addr: u64) -> Result<u32> {
        let lo = self.fetch_imm16(mem, addr)?;
        let hi = self.fetch_imm16(mem, addr + 2)?;
        Ok(u32::from(lo) | (u32::from(hi) << 16))
    }

    /// Fetches, decodes and executes one instruction.
    pub fn step(&mut self, mem: &mut GuestMemory) -> Result<Exit> {
        let ip = self.regs.ip;
        let opcode = self.fetch(mem, ip)?;
        match opcode {
            // nop, cli, sti: the oracle carries no interrupt state.
            0x90 | 0xfa | 0xfb => {
                self.advance(1);
                Ok(Exit::Continue)
            }
            HLT_OPCODE => {
                self.advance(1);
                Ok(Exit::Hlt)
            }
            // mov r8, imm8
            0xb0..=0xb7 => {
                let imm = self.fetch(mem, ip + 1)?;
                self.regs.write8(opcode & 7, imm);
                self.advance(2);
                Ok(Exit::Continue)
            }
            // mov r16, imm16
            0xb8..=0xbf => {
                let imm = self.fetch_imm16(mem, ip + 1)?;
                self.regs.write16(opcode & 7, imm);
                self.advance(3);
                Ok(Exit::Continue)
            }
            // operand-size prefix: mov r32, imm32
            0x66 => {
                let next = self.fetch(mem, ip + 1)?;
                if !(0xb8..=0xbf).contains(&next) {
                    return Err(Error::InvalidOpcode { addr: ip, opcode });
                }
                let imm = self.fetch_imm32(mem, ip + 2)?;
                self.regs.write32(next & 7, imm);
                self.advance(6);
                Ok(Exit::Continue)
            }
            // address-size prefix: mov [edx], al / mov al, [edx]
            0x67 => {
                let next = self.fetch(mem, ip + 1)?;
                let modrm = self.fetch(mem, ip + 2)?;
                if modrm != 0x02 || (next != 0x88 && next != 0x8a) {
                    return Err(Error::InvalidOpcode { addr: ip, opcode });
                }
                let addr = u64::from(self.regs.dx);
                if next == 0x88 {
                    let value = self.regs.al();
                    if !mem.is_mapped(addr, 1) {
                        return Ok(Exit::FaultWrite {
                            addr,
                            width: 1,
                            value,
                        });
                    }
                    mem.write_u8(addr, value).map_err(|_| Error::Fetch(addr))?;
                } else {
                    if !mem.is_mapped(addr, 1) {
                        return Ok(Exit::FaultRead { addr, width: 1 });
                    }
                    let value = mem.read_u8(addr).map_err(|_| Error::Fetch(addr))?;
                    self.regs.set_al(value);
                }
                self.advance(3);
                Ok(Exit::Continue)
            }
            // jmp rel8
            0xeb => {
                let rel = self.fetch(mem, ip + 1)? as i8;
                self.regs.ip = (ip + 2).wrapping_add_signed(i64::from(rel));
                Ok(Exit::Continue)
            }
            IN_OPCODE => {
                let port = self.regs.dx16();
                self.advance(1);
                Ok(Exit::In { port })
            }
            OUT_OPCODE => {
                let port = self.regs.dx16();
                let value = self.regs.al();
                self.advance(1);
                Ok(Exit::Out { port, value })
            }
            _ => Err(Error::InvalidOpcode { addr: ip, opcode }),
        }
    }
}
