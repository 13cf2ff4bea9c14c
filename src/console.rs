// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Serial console session with the booted system under test.
//!
//! The session owns the console child process and an incrementally decoded
//! text buffer of everything the child has printed. Callers interact with it
//! through two primitives: wait for a literal marker to appear, and send a
//! shell command once the prompt is back. Markers are consumed exactly once
//! and strictly in arrival order; everything scanned past is echoed to
//! stdout so an operator can follow the boot.

use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::ChildStdin;
use std::process::ChildStdout;
use std::process::Command;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use log::info;
use log::warn;

use crate::error::Error;
use crate::error::Result;

/// Bounded-wait quantum for a single poll of the console descriptor.
const POLL_QUANTUM: Duration = Duration::from_secs(1);

/// The shell-ready marker preceding every command send.
pub const SHELL_PROMPT: &str = ":~#";

/// Budget for the shell prompt to come back before a send.
const SEND_TIMEOUT: Duration = Duration::from_secs(60);

const READ_CHUNK: usize = 4096;

pub struct Console {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    /// Decoded console text not yet consumed by a marker.
    decoded: String,
    /// Raw tail: bytes read but not yet decodable as UTF-8.
    raw: Vec<u8>,
    history: File,
    history_path: PathBuf,
    killed: bool,
}

impl Console {
    /// Spawns `command` under a shell and starts a fresh command history at
    /// `history`.
    pub fn new(command: &str, history: &Path) -> Result<Console> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(format!("exec {}", command))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Spawn {
                command: command.to_string(),
                source: e,
            })?;
        let stdin = child.stdin.take().expect("console stdin was piped");
        let stdout = child.stdout.take().expect("console stdout was piped");

        let mut history_file = File::create(history).map_err(|e| Error::History {
            path: history.to_path_buf(),
            source: e,
        })?;
        history_file
            .write_all(b"#!/bin/bash\n")
            .map_err(|e| Error::History {
                path: history.to_path_buf(),
                source: e,
            })?;

        info!("console session started: {}", command);
        Ok(Console {
            child,
            stdin,
            stdout,
            decoded: String::new(),
            raw: Vec::new(),
            history: history_file,
            history_path: history.to_path_buf(),
            killed: false,
        })
    }

    /// One bounded-wait read quantum. Appends whatever arrived to the raw
    /// tail and decodes as much of it as possible. `marker` is only used to
    /// give a child-exit error its context.
    fn fill(&mut self, marker: &str) -> Result<()> {
        let mut pfd = libc::pollfd {
            fd: self.stdout.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid, initialized pollfd for the duration of the
        // call and the descriptor outlives it.
        let ret = unsafe { libc::poll(&mut pfd, 1, POLL_QUANTUM.as_millis() as libc::c_int) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::ConsoleIo(err));
        }
        if ret == 0 {
            // Idle quantum: fatal if the child died with the marker pending.
            if self.child.try_wait().map_err(Error::ConsoleIo)?.is_some() {
                return Err(Error::ChildTerminated(marker.to_string()));
            }
            return Ok(());
        }

        let mut buf = [0u8; READ_CHUNK];
        let count = self.stdout.read(&mut buf).map_err(Error::ConsoleIo)?;
        if count == 0 {
            // EOF on stdout; the child is gone or about to be.
            if self.child.try_wait().map_err(Error::ConsoleIo)?.is_some() {
                return Err(Error::ChildTerminated(marker.to_string()));
            }
            return Ok(());
        }
        self.raw.extend_from_slice(&buf[..count]);
        self.decode_pending();
        Ok(())
    }

    /// Moves every decodable prefix of the raw tail into the text buffer.
    /// Invalid sequences are dropped; an incomplete trailing sequence stays
    /// in the tail so a multi-byte character split across reads survives.
    fn decode_pending(&mut self) {
        loop {
            match std::str::from_utf8(&self.raw) {
                Ok(text) => {
                    self.decoded.push_str(text);
                    self.raw.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    self.decoded
                        .push_str(std::str::from_utf8(&self.raw[..valid]).unwrap_or(""));
                    match err.error_len() {
                        Some(bad) => {
                            self.raw.drain(..valid + bad);
                        }
                        None => {
                            self.raw.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Blocks until the first occurrence of `marker` shows up in the console
    /// stream, echoing all intervening text. On success the returned string
    /// is everything consumed, up to and including the marker, and the
    /// buffer is truncated past it: a marker is never matched twice.
    pub fn wait_for(&mut self, marker: &str, timeout: Duration) -> Result<String> {
        let start = Instant::now();
        let mut echoed = 0;
        loop {
            if let Some(idx) = self.decoded.find(marker) {
                let end = idx + marker.len();
                if end > echoed {
                    print!("{}", &self.decoded[echoed..end]);
                    let _ = io::stdout().flush();
                }
                let chunk: String = self.decoded.drain(..end).collect();
                return Ok(chunk);
            }
            if self.decoded.len() > echoed {
                print!("{}", &self.decoded[echoed..]);
                let _ = io::stdout().flush();
                echoed = self.decoded.len();
            }
            if start.elapsed() > timeout {
                return Err(Error::WaitTimeout {
                    marker: marker.to_string(),
                    timeout,
                });
            }
            self.fill(marker)?;
        }
    }

    /// Writes one line straight to the child's stdin, bypassing the prompt
    /// wait and the history log (used for the login answer).
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.write_all(b"\n"))
            .and_then(|_| self.stdin.flush())
            .map_err(Error::ConsoleIo)
    }

    /// Waits for the shell prompt, records `command` in the history log and
    /// sends it.
    pub fn send(&mut self, command: &str) -> Result<()> {
        self.wait_for(SHELL_PROMPT, SEND_TIMEOUT)?;
        self.history
            .write_all(command.as_bytes())
            .and_then(|_| self.history.write_all(b"\n"))
            .and_then(|_| self.history.flush())
            .map_err(|e| Error::History {
                path: self.history_path.clone(),
                source: e,
            })?;
        self.write_line(command)
    }

    /// Terminates the console child. Idempotent; failures are logged and
    /// never mask whatever error caused the teardown.
    pub fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        if let Err(e) = self.child.kill() {
            warn!("failed to kill console child: {}", e);
        }
        match self.child.wait() {
            Ok(status) => info!("console child exited: {}", status),
            Err(e) => warn!("failed to reap console child: {}", e),
        }
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tempfile::NamedTempFile;

    use super::*;

    const LONG: Duration = Duration::from_secs(10);

    /// Spawns a console whose "system under test" is the given shell script.
    fn console(script: &str) -> (Console, NamedTempFile, NamedTempFile) {
        let mut script_file = NamedTempFile::new().unwrap();
        script_file.write_all(script.as_bytes()).unwrap();
        script_file.flush().unwrap();
        let history = NamedTempFile::new().unwrap();
        let command = format!("sh {}", script_file.path().display());
        let console = Console::new(&command, history.path()).unwrap();
        (console, history, script_file)
    }

    #[test]
    fn marker_consumed_exactly_once() {
        let (mut console, _history, _script) = console("printf 'one MARK two MARK three'; sleep 30");
        let chunk = console.wait_for("MARK", LONG).unwrap();
        assert_eq!(chunk, "one MARK");
        // The second occurrence is still pending, the first is gone.
        let chunk = console.wait_for("MARK", LONG).unwrap();
        assert_eq!(chunk, " two MARK");
        assert!(matches!(
            console.wait_for("MARK", Duration::from_secs(2)),
            Err(Error::WaitTimeout { .. })
        ));
    }

    #[test]
    fn multibyte_character_split_across_reads() {
        // "你" is e4 bd a0; emit the first two bytes, stall past one poll
        // quantum, then finish the sequence.
        let (mut console, _history, _script) =
            console("printf '\\344\\275'; sleep 2; printf '\\240 ok\\n'; sleep 30");
        let chunk = console.wait_for("ok", LONG).unwrap();
        assert_eq!(chunk, "\u{4f60} ok");
    }

    #[test]
    fn child_exit_is_fatal() {
        let (mut console, _history, _script) = console("true");
        match console.wait_for("never", LONG) {
            Err(Error::ChildTerminated(marker)) => assert_eq!(marker, "never"),
            other => panic!("expected ChildTerminated, got {:?}", other),
        }
    }

    #[test]
    fn timeout_is_never_early() {
        let (mut console, _history, _script) = console("sleep 30");
        let timeout = Duration::from_secs(1);
        let start = Instant::now();
        assert!(matches!(
            console.wait_for("never", timeout),
            Err(Error::WaitTimeout { .. })
        ));
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout, "failed {:?} early", timeout - elapsed);
        // Liveness margin: at most 1.5 poll quanta past the deadline.
        assert!(elapsed <= timeout + POLL_QUANTUM + POLL_QUANTUM / 2);
    }

    #[test]
    fn send_waits_for_prompt_and_logs_history() {
        // The child echoes its stdin back after the prompt, so the sent
        // command becomes observable on the console.
        let (mut console, history, _script) = console("printf ':~# '; cat; sleep 30");
        console.send("echo hello").unwrap();
        console.wait_for("echo hello", LONG).unwrap();

        let logged = std::fs::read_to_string(history.path()).unwrap();
        assert_eq!(logged, "#!/bin/bash\necho hello\n");
    }

    #[test]
    fn kill_is_idempotent() {
        let (mut console, _history, _script) = console("sleep 30");
        console.kill();
        console.kill();
    }
}
