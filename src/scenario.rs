// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end co-execution scenario.
//!
//! Boots the system image, logs in, loads the yakvm module, launches the
//! real guest, replays the same guest in the oracle in lockstep, and tears
//! the module back down. Each milestone is a console marker with its own
//! budget; the scenario succeeds only if every marker is observed in order.

use log::error;
use log::info;

use crate::console::Console;
use crate::error::Result;
use crate::lockstep::Oracle;
use crate::lockstep::OracleConfig;

const LOGIN_PROMPT: &str = "login:";
const LOGIN_USER: &str = "root";

const INSMOD_CMD: &str = "insmod /mnt/shares/yakvm.ko";
const MODULE_INITIALIZED: &str = "initialize yakvm";

const EMULATOR_CMD: &str = "/mnt/shares/emulator /mnt/shares/guest.bin";
const VM_CREATED: &str = "yakvm_create_vm() creates the kvm";
const VCPU_CREATED: &str = "vcpu has been created for kvm";
const VM_DESTROYED: &str = "yakvm_destroy_vm() destroys the kvm kvm-";

const RMMOD_CMD: &str = "rmmod yakvm";
const MODULE_CLEANED_UP: &str = "cleanup yakvm";

/// Orchestrator states, in the order a successful run passes through them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Booting,
    Authenticated,
    ModuleLoaded,
    VmCreated,
    SteppingGuest,
    VmDestroyed,
    ModuleUnloaded,
    Done,
    Failed,
}

pub struct Scenario {
    console: Console,
    cfg: OracleConfig,
    state: State,
}

impl Scenario {
    pub fn new(console: Console, cfg: OracleConfig) -> Scenario {
        Scenario {
            console,
            cfg,
            state: State::Booting,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Drives the scenario to completion and tears the console down exactly
    /// once, on success and failure alike.
    pub fn run(&mut self) -> Result<()> {
        let result = self.drive();
        if let Err(e) = &result {
            error!("scenario failed in state {:?}: {}", self.state, e);
            self.state = State::Failed;
        }
        self.console.kill();
        result
    }

    fn advance(&mut self, next: State) {
        info!("scenario: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn await_marker(&mut self, marker: &str) -> Result<()> {
        self.console.wait_for(marker, self.cfg.timeout)?;
        Ok(())
    }

    fn drive(&mut self) -> Result<()> {
        self.cfg.validate()?;

        self.await_marker(LOGIN_PROMPT)?;
        self.console.write_line(LOGIN_USER)?;
        self.advance(State::Authenticated);

        self.console.send(INSMOD_CMD)?;
        self.await_marker(MODULE_INITIALIZED)?;
        self.advance(State::ModuleLoaded);

        self.console.send(EMULATOR_CMD)?;
        self.await_marker(VM_CREATED)?;
        self.await_marker(VCPU_CREATED)?;
        self.advance(State::VmCreated);

        self.advance(State::SteppingGuest);
        Oracle::new(&self.cfg, &mut self.console)?.run()?;

        self.await_marker(VM_DESTROYED)?;
        self.advance(State::VmDestroyed);

        self.console.send(RMMOD_CMD)?;
        self.await_marker(MODULE_CLEANED_UP)?;
        self.advance(State::ModuleUnloaded);

        self.advance(State::Done);
        Ok(())
    }
}
