// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs the yakvm lockstep validation scenario against a booted system
//! image and exits non-zero on any divergence.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use argh::FromArgs;
use yakvm_cosim::console::Console;
use yakvm_cosim::devices::DeviceProfile;
use yakvm_cosim::lockstep::OracleConfig;
use yakvm_cosim::scenario::Scenario;

fn default_timeout() -> u64 {
    10
}

fn default_memory() -> u64 {
    2 * 1024 * 1024
}

fn default_pio_profile() -> DeviceProfile {
    DeviceProfile::Fixed(2)
}

fn default_mmio_profile() -> DeviceProfile {
    DeviceProfile::Decrement
}

fn parse_u64(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("bad number {:?}: {}", value, e))
}

fn parse_u16(value: &str) -> Result<u16, String> {
    let parsed = parse_u64(value)?;
    u16::try_from(parsed).map_err(|_| format!("{:#x} does not fit in a port number", parsed))
}

fn parse_profile(value: &str) -> Result<DeviceProfile, String> {
    value.parse()
}

#[derive(FromArgs)]
/// yakvm lockstep validation harness
struct Args {
    /// command to boot up qemu
    #[argh(option)]
    command: String,
    /// path to store executed commands
    #[argh(option)]
    history: PathBuf,
    /// guest binary path
    #[argh(option)]
    bin: PathBuf,
    /// max timeout in seconds for receiving from the guest (default: 10)
    #[argh(option, default = "default_timeout()", from_str_fn(parse_u64))]
    timeout: u64,
    /// vm entry address
    #[argh(option, default = "0", from_str_fn(parse_u64))]
    entry: u64,
    /// vm stack address
    #[argh(option, default = "0", from_str_fn(parse_u64))]
    stack: u64,
    /// guest memory size in bytes (default: 2 MiB)
    #[argh(option, default = "default_memory()", from_str_fn(parse_u64))]
    memory: u64,
    /// port for device PIO_HAWK
    #[argh(option, default = "0", from_str_fn(parse_u16))]
    pio: u16,
    /// memory address for device MMIO_HAWK
    #[argh(option, default = "0", from_str_fn(parse_u64))]
    mmio: u64,
    /// PIO_HAWK response profile, "decrement" or "fixed:<byte>"
    /// (default: fixed:2)
    #[argh(option, default = "default_pio_profile()", from_str_fn(parse_profile))]
    pio_profile: DeviceProfile,
    /// MMIO_HAWK response profile, "decrement" or "fixed:<byte>"
    /// (default: decrement)
    #[argh(option, default = "default_mmio_profile()", from_str_fn(parse_profile))]
    mmio_profile: DeviceProfile,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter(None, log::LevelFilter::Info)
        .init();

    let args: Args = argh::from_env();

    let image = fs::read(&args.bin)
        .with_context(|| format!("failed to read guest binary {}", args.bin.display()))?;
    let cfg = OracleConfig {
        image,
        entry: args.entry,
        stack: args.stack,
        memory_size: args.memory,
        pio_port: args.pio,
        mmio_addr: args.mmio,
        pio_profile: args.pio_profile,
        mmio_profile: args.mmio_profile,
        timeout: Duration::from_secs(args.timeout),
    };
    cfg.validate()?;

    let console = Console::new(&args.command, &args.history)?;
    Scenario::new(console, cfg)
        .run()
        .context("lockstep scenario failed")?;
    Ok(())
}
