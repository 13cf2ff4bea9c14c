// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lockstep validation harness for the yakvm hypervisor module.
//!
//! The harness boots a system image carrying the yakvm kernel module inside
//! qemu, scripts its serial console, and replays the same guest binary in a
//! software oracle CPU. The module under test reports every executed guest
//! instruction as a console trace line; the oracle is only allowed to retire
//! an instruction once the matching trace line has been observed. Any
//! divergence between the two executions is a test failure.

pub mod console;
pub mod cpu;
pub mod devices;
pub mod error;
pub mod lockstep;
pub mod mem;
pub mod scenario;

pub use error::Error;
pub use error::ProtocolViolation;
pub use error::Result;
