// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lockstep execution of the oracle against the module under test.
//!
//! The module prints one trace line per executed guest instruction. Before
//! the oracle retires instruction N it must observe the trace line for
//! instruction N and check that the reported address and opcode match its
//! own view of the guest. The oracle is therefore the reference for *what*
//! each instruction does, while the module's trace stream dictates *when*
//! it is allowed to happen.
//!
//! Port i/o and accesses to the monitored MMIO address never reach real
//! hardware on either side; the HAWK device shim supplies their semantics
//! and resumes the oracle past the instruction with a fresh run budget,
//! standing in for device latency.

use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::info;

use crate::console::Console;
use crate::cpu::Cpu;
use crate::cpu::Exit;
use crate::devices::DeviceProfile;
use crate::devices::HawkDevice;
use crate::error::Error;
use crate::error::ProtocolViolation;
use crate::error::Result;
use crate::mem::GuestMemory;
use crate::mem::PAGE_SIZE;

/// Prefix of the per-instruction trace line printed by the yakvm driver.
pub const TRACE_PREFIX: &str = "guest executes instruction at ";

/// Budget for the oracle to reach the next external event (halt or device
/// access), refreshed every time the shim resumes execution.
const RUN_BUDGET: Duration = Duration::from_secs(10);

const MMIO_WRITE_CODE: [u8; 3] = [0x67, 0x88, 0x02];
const MMIO_READ_CODE: [u8; 3] = [0x67, 0x8a, 0x02];

/// Everything the oracle needs to mirror the real guest.
pub struct OracleConfig {
    /// Flat guest binary image, loaded at `entry`.
    pub image: Vec<u8>,
    pub entry: u64,
    pub stack: u64,
    pub memory_size: u64,
    pub pio_port: u16,
    pub mmio_addr: u64,
    pub pio_profile: DeviceProfile,
    pub mmio_profile: DeviceProfile,
    /// Budget for each awaited console marker, trace lines included.
    pub timeout: Duration,
}

impl OracleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mmio_addr % PAGE_SIZE != 0 {
            return Err(Error::InvalidConfig(format!(
                "mmio address {:#x} is not {}-aligned",
                self.mmio_addr, PAGE_SIZE
            )));
        }
        if self.mmio_addr / PAGE_SIZE >= self.entry / PAGE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "mmio page {:#x} must precede the entry page {:#x}",
                self.mmio_addr, self.entry
            )));
        }
        let ram_base = self.mmio_addr + PAGE_SIZE;
        let image_end = self.entry - ram_base + self.image.len() as u64;
        if image_end > self.memory_size {
            return Err(Error::InvalidConfig(format!(
                "guest image of {:#x} bytes at {:#x} does not fit in {:#x} bytes of memory",
                self.image.len(),
                self.entry,
                self.memory_size
            )));
        }
        Ok(())
    }
}

/// One oracle session: the software CPU, its private guest memory, the two
/// HAWK devices and the console the trace lines arrive on. All shim state
/// lives here; nothing is global.
pub struct Oracle<'a> {
    cpu: Cpu,
    mem: GuestMemory,
    pio: HawkDevice,
    mmio: HawkDevice,
    console: &'a mut Console,
    entry: u64,
    pio_port: u16,
    mmio_addr: u64,
    trace_timeout: Duration,
    deadline: Instant,
}

impl<'a> Oracle<'a> {
    pub fn new(cfg: &OracleConfig, console: &'a mut Console) -> Result<Oracle<'a>> {
        cfg.validate()?;
        let mut mem = GuestMemory::new();
        mem.add_region(cfg.mmio_addr + PAGE_SIZE, cfg.memory_size as usize)?;
        mem.write_slice(cfg.entry, &cfg.image)?;
        Ok(Oracle {
            cpu: Cpu::new(cfg.entry, cfg.stack),
            mem,
            pio: HawkDevice::new("PIO_HAWK", cfg.pio_profile),
            mmio: HawkDevice::new("MMIO_HAWK", cfg.mmio_profile),
            console,
            entry: cfg.entry,
            pio_port: cfg.pio_port,
            mmio_addr: cfg.mmio_addr,
            trace_timeout: cfg.timeout,
            deadline: Instant::now() + RUN_BUDGET,
        })
    }

    /// Runs the oracle from the entry point until the guest halts. Every
    /// divergence from the module's trace stream is fatal.
    pub fn run(&mut self) -> Result<()> {
        self.deadline = Instant::now() + RUN_BUDGET;
        loop {
            let addr = self.cpu.ip();
            if Instant::now() > self.deadline {
                return Err(Error::OracleBudget {
                    budget: RUN_BUDGET,
                    addr,
                });
            }
            let opcode = self.mem.read_u8(addr)?;

            // Lockstep gate: instruction N may not retire before the module
            // has reported executing instruction N. Only the entry
            // instruction is exempt, since the module traces from the
            // second instruction on.
            if addr != self.entry {
                self.await_trace(addr, opcode)?;
            }

            match self.cpu.step(&mut self.mem)? {
                Exit::Continue => {}
                Exit::Hlt => {
                    info!("oracle: guest halted at {:#x}", addr);
                    return Ok(());
                }
                Exit::Out { port, value } => {
                    self.check_port(port)?;
                    debug!("oracle: out port {:#x} <- {:#04x}", port, value);
                    self.pio.write(value);
                    self.resume();
                }
                Exit::In { port } => {
                    self.check_port(port)?;
                    let value = self.pio.read()?;
                    debug!("oracle: in port {:#x} -> {:#04x}", port, value);
                    self.cpu.regs.set_al(value);
                    self.resume();
                }
                Exit::FaultWrite {
                    addr: fault,
                    width,
                    value,
                } => {
                    self.check_mmio(fault, width)?;
                    self.expect_encoding(MMIO_WRITE_CODE)?;
                    debug!("oracle: mmio {:#x} <- {:#04x}", fault, value);
                    self.mmio.write(value);
                    self.cpu.advance(MMIO_WRITE_CODE.len() as u64);
                    self.resume();
                }
                Exit::FaultRead { addr: fault, width } => {
                    self.check_mmio(fault, width)?;
                    self.expect_encoding(MMIO_READ_CODE)?;
                    let value = self.mmio.read()?;
                    debug!("oracle: mmio {:#x} -> {:#04x}", fault, value);
                    self.cpu.regs.set_al(value);
                    self.cpu.advance(MMIO_READ_CODE.len() as u64);
                    self.resume();
                }
            }
        }
    }

    /// Device emulation complete; resume with a fresh run budget.
    fn resume(&mut self) {
        self.deadline = Instant::now() + RUN_BUDGET;
    }

    /// Blocks until the module reports the next executed instruction, then
    /// checks it against the oracle's program counter and memory.
    fn await_trace(&mut self, addr: u64, opcode: u8) -> Result<()> {
        self.console.wait_for(TRACE_PREFIX, self.trace_timeout)?;
        let rest = self.console.wait_for("\n", self.trace_timeout)?;
        let (observed_addr, observed_opcode) = parse_trace(rest.trim_end())?;
        if observed_addr != addr || observed_opcode != opcode {
            return Err(ProtocolViolation::TraceMismatch {
                expected_addr: addr,
                expected_opcode: opcode,
                observed_addr,
                observed_opcode,
            }
            .into());
        }
        Ok(())
    }

    fn check_port(&self, port: u16) -> Result<()> {
        if port != self.pio_port {
            return Err(ProtocolViolation::UnexpectedPort {
                expected: self.pio_port,
                observed: port,
            }
            .into());
        }
        Ok(())
    }

    fn check_mmio(&self, addr: u64, width: u8) -> Result<()> {
        if addr != self.mmio_addr || width != 1 {
            return Err(ProtocolViolation::UnexpectedMmio {
                expected: self.mmio_addr,
                observed: addr,
                width,
            }
            .into());
        }
        Ok(())
    }

    /// A fault may only be raised by the known device access encodings; the
    /// oracle's memory must agree.
    fn expect_encoding(&self, expected: [u8; 3]) -> Result<()> {
        let ip = self.cpu.ip();
        let mut found = [0u8; 3];
        self.mem.read_slice(ip, &mut found)?;
        if found != expected {
            return Err(ProtocolViolation::MmioEncoding {
                addr: ip,
                expected,
                found,
            }
            .into());
        }
        Ok(())
    }
}

/// Parses the tail of a trace line, e.g. `0x2002, opcode = f4`.
fn parse_trace(text: &str) -> std::result::Result<(u64, u8), ProtocolViolation> {
    let malformed = || ProtocolViolation::MalformedTrace {
        text: text.to_string(),
    };
    let (addr_text, opcode_text) = text.split_once(", opcode = ").ok_or_else(malformed)?;
    let addr = addr_text
        .strip_prefix("0x")
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        .ok_or_else(malformed)?;
    let opcode = u8::from_str_radix(opcode_text.trim(), 16).map_err(|_| malformed())?;
    Ok((addr, opcode))
}

/// Formats the trace line the module is expected to print for one executed
/// instruction.
pub fn trace_line(addr: u64, opcode: u8) -> String {
    format!("{}{:#x}, opcode = {:x}", TRACE_PREFIX, addr, opcode)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    const ENTRY: u64 = 0x2000;

    fn config(image: &[u8]) -> OracleConfig {
        OracleConfig {
            image: image.to_vec(),
            entry: ENTRY,
            stack: 0x7000,
            memory_size: 2 * 1024 * 1024,
            pio_port: 0xaa,
            mmio_addr: 0,
            pio_profile: DeviceProfile::Fixed(2),
            mmio_profile: DeviceProfile::Decrement,
            timeout: Duration::from_secs(10),
        }
    }

    /// Trace lines the module would emit for `image`: one per instruction
    /// after the entry instruction.
    fn transcript_for(image: &[u8], lengths: &[u64]) -> String {
        let mut text = String::new();
        let mut addr = ENTRY;
        for (i, len) in lengths.iter().enumerate() {
            if i > 0 {
                let opcode = image[(addr - ENTRY) as usize];
                text.push_str(&trace_line(addr, opcode));
                text.push('\n');
            }
            addr += len;
        }
        text
    }

    fn scripted_console(transcript: &str) -> (Console, NamedTempFile, NamedTempFile) {
        let mut script = NamedTempFile::new().unwrap();
        write!(script, "cat <<'EOF'\n{}EOF\nsleep 30\n", transcript).unwrap();
        script.flush().unwrap();
        let history = NamedTempFile::new().unwrap();
        let console = Console::new(
            &format!("sh {}", script.path().display()),
            history.path(),
        )
        .unwrap();
        (console, history, script)
    }

    #[test]
    fn runs_to_halt_in_lockstep() {
        let image = [0xb0, 0x2a, 0x90, 0xf4];
        let transcript = transcript_for(&image, &[2, 1, 1]);
        let (mut console, _history, _script) = scripted_console(&transcript);
        let cfg = config(&image);
        let mut oracle = Oracle::new(&cfg, &mut console).unwrap();
        oracle.run().unwrap();
        assert_eq!(oracle.cpu.regs.al(), 0x2a);
    }

    #[test]
    fn mismatched_trace_address_is_a_protocol_violation() {
        let image = [0xb0, 0x2a, 0x90, 0xf4];
        let mut transcript = trace_line(0x9999, 0x90);
        transcript.push('\n');
        let (mut console, _history, _script) = scripted_console(&transcript);
        let cfg = config(&image);
        let mut oracle = Oracle::new(&cfg, &mut console).unwrap();
        match oracle.run() {
            Err(Error::Protocol(ProtocolViolation::TraceMismatch {
                expected_addr,
                observed_addr,
                ..
            })) => {
                assert_eq!(expected_addr, 0x2002);
                assert_eq!(observed_addr, 0x9999);
            }
            other => panic!("expected TraceMismatch, got {:?}", other),
        }
    }

    #[test]
    fn mismatched_trace_opcode_is_a_protocol_violation() {
        let image = [0xb0, 0x2a, 0x90, 0xf4];
        let mut transcript = trace_line(0x2002, 0xf4);
        transcript.push('\n');
        let (mut console, _history, _script) = scripted_console(&transcript);
        let cfg = config(&image);
        let mut oracle = Oracle::new(&cfg, &mut console).unwrap();
        assert!(matches!(
            oracle.run(),
            Err(Error::Protocol(ProtocolViolation::TraceMismatch { .. }))
        ));
    }

    #[test]
    fn missing_trace_line_times_out() {
        let image = [0xb0, 0x2a, 0x90, 0xf4];
        let (mut console, _history, _script) = scripted_console("");
        let mut cfg = config(&image);
        cfg.timeout = Duration::from_secs(1);
        let mut oracle = Oracle::new(&cfg, &mut console).unwrap();
        assert!(matches!(
            oracle.run(),
            Err(Error::WaitTimeout { .. })
        ));
    }

    #[test]
    fn pio_hawk_round_trip() {
        // mov dl, 0xaa; mov al, 7; out dx, al; in al, dx; hlt
        let image = [0xb2, 0xaa, 0xb0, 0x07, 0xee, 0xec, 0xf4];
        let transcript = transcript_for(&image, &[2, 2, 1, 1, 1]);
        let (mut console, _history, _script) = scripted_console(&transcript);
        let cfg = config(&image);
        let mut oracle = Oracle::new(&cfg, &mut console).unwrap();
        oracle.run().unwrap();
        assert_eq!(oracle.pio.latched(), Some(7));
        // Fixed profile: in al, dx answers the sentinel.
        assert_eq!(oracle.cpu.regs.al(), 2);
    }

    #[test]
    fn pio_to_unmonitored_port_is_a_protocol_violation() {
        // mov dl, 0xbb; out dx, al; hlt
        let image = [0xb2, 0xbb, 0xee, 0xf4];
        let transcript = transcript_for(&image, &[2, 1, 1]);
        let (mut console, _history, _script) = scripted_console(&transcript);
        let cfg = config(&image);
        let mut oracle = Oracle::new(&cfg, &mut console).unwrap();
        assert!(matches!(
            oracle.run(),
            Err(Error::Protocol(ProtocolViolation::UnexpectedPort {
                expected: 0xaa,
                observed: 0xbb,
            }))
        ));
    }

    #[test]
    fn mmio_hawk_round_trip() {
        // mov al, 5; mov edx, 0; mov [edx], al; mov al, [edx]; hlt
        let image = [
            0xb0, 0x05, // 0x2000
            0x66, 0xba, 0x00, 0x00, 0x00, 0x00, // 0x2002
            0x67, 0x88, 0x02, // 0x2008
            0x67, 0x8a, 0x02, // 0x200b
            0xf4, // 0x200e
        ];
        let transcript = transcript_for(&image, &[2, 6, 3, 3, 1]);
        let (mut console, _history, _script) = scripted_console(&transcript);
        let cfg = config(&image);
        let mut oracle = Oracle::new(&cfg, &mut console).unwrap();
        oracle.run().unwrap();
        // Decrement profile: the read answers the latched value minus one.
        assert_eq!(oracle.cpu.regs.al(), 4);
        assert_eq!(oracle.cpu.ip(), 0x200f);
    }

    #[test]
    fn mmio_at_unmonitored_address_is_a_protocol_violation() {
        // The mapped region starts at 0x1000, so 0x800 faults but is not
        // the monitored address 0x0.
        let image = [
            0x66, 0xba, 0x00, 0x08, 0x00, 0x00, // mov edx, 0x800
            0x67, 0x88, 0x02, // mov [edx], al
            0xf4,
        ];
        let transcript = transcript_for(&image, &[6, 3, 1]);
        let (mut console, _history, _script) = scripted_console(&transcript);
        let cfg = config(&image);
        let mut oracle = Oracle::new(&cfg, &mut console).unwrap();
        assert!(matches!(
            oracle.run(),
            Err(Error::Protocol(ProtocolViolation::UnexpectedMmio {
                expected: 0,
                observed: 0x800,
                width: 1,
            }))
        ));
    }

    #[test]
    fn mmio_double_read_is_a_protocol_violation() {
        let image = [
            0xb0, 0x05, // mov al, 5
            0x66, 0xba, 0x00, 0x00, 0x00, 0x00, // mov edx, 0
            0x67, 0x88, 0x02, // mov [edx], al
            0x67, 0x8a, 0x02, // mov al, [edx]
            0x67, 0x8a, 0x02, // mov al, [edx] again
            0xf4,
        ];
        let transcript = transcript_for(&image, &[2, 6, 3, 3, 3, 1]);
        let (mut console, _history, _script) = scripted_console(&transcript);
        let cfg = config(&image);
        let mut oracle = Oracle::new(&cfg, &mut console).unwrap();
        assert!(matches!(
            oracle.run(),
            Err(Error::Protocol(ProtocolViolation::DeviceReadBeforeWrite {
                device: "MMIO_HAWK"
            }))
        ));
    }

    #[test]
    fn config_validation() {
        let mut cfg = config(&[0xf4]);
        cfg.mmio_addr = 0x10;
        assert!(matches!(
            cfg.validate(),
            Err(Error::InvalidConfig(_))
        ));

        let mut cfg = config(&[0xf4]);
        cfg.mmio_addr = 0x2000;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        let mut cfg = config(&[0xf4]);
        cfg.memory_size = 0x1000;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        assert!(config(&[0xf4]).validate().is_ok());
    }

    #[test]
    fn trace_line_round_trips_through_the_parser() {
        let line = trace_line(0x2002, 0xf4);
        let rest = line.strip_prefix(TRACE_PREFIX).unwrap();
        assert_eq!(parse_trace(rest), Ok((0x2002, 0xf4)));
        assert!(parse_trace("garbage").is_err());
    }
}
