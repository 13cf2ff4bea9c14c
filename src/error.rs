// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Harness-wide error taxonomy.
//!
//! Nothing in this crate retries: every failure is either a real divergence
//! between the module under test and the oracle, or an environment failure,
//! and both must surface to the orchestrator.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use remain::sorted;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    /// The console child exited while a marker was still pending.
    #[error("console process exited while waiting for {0:?}")]
    ChildTerminated(String),
    #[error("console i/o failed: {0}")]
    ConsoleIo(#[source] io::Error),
    #[error("oracle cpu: {0}")]
    Cpu(#[from] crate::cpu::Error),
    #[error("history file {path}: {source}")]
    History {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("oracle memory: {0}")]
    Memory(#[from] crate::mem::Error),
    #[error("oracle run budget of {budget:?} exhausted at {addr:#x}")]
    OracleBudget { budget: Duration, addr: u64 },
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("failed to spawn console command {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out after {timeout:?} waiting for {marker:?}")]
    WaitTimeout { marker: String, timeout: Duration },
}

/// An internal consistency check failed. This class of error points at a
/// defect in either the module under test or the oracle's assumptions, so
/// each variant carries the expected and observed values.
#[sorted]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("{device} read with no value latched by a prior write")]
    DeviceReadBeforeWrite { device: &'static str },
    #[error("malformed trace event {text:?}")]
    MalformedTrace { text: String },
    #[error("mmio fault at {addr:#x} decoded {found:02x?}, expected encoding {expected:02x?}")]
    MmioEncoding {
        addr: u64,
        expected: [u8; 3],
        found: [u8; 3],
    },
    #[error(
        "module reports instruction {observed_addr:#x}/{observed_opcode:02x}, \
         oracle expects {expected_addr:#x}/{expected_opcode:02x}"
    )]
    TraceMismatch {
        expected_addr: u64,
        expected_opcode: u8,
        observed_addr: u64,
        observed_opcode: u8,
    },
    #[error("device access at {observed:#x} (width {width}), monitored mmio address is {expected:#x}")]
    UnexpectedMmio {
        expected: u64,
        observed: u64,
        width: u8,
    },
    #[error("guest accessed port {observed:#x}, monitored port is {expected:#x}")]
    UnexpectedPort { expected: u16, observed: u16 },
}
