//! Port pre-flight checks
//!
//! Before binding the streaming port we probe it with a plain bind
//! attempt and, when something squats on it, try to identify the owner
//! with `lsof`. Killing squatters is opt-in and only ever targets
//! processes that look like leftover mirroring agents.

use crate::core::error::{MirrorError, Result};
use crate::{log_info, log_verbose, log_warn};
use std::net::TcpListener;
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    Free,
    InUse,
}

/// A process found listening on the probed port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSquatter {
    pub pid: u32,
    pub command: String,
}

impl PortSquatter {
    /// Whether the squatter looks like a leftover agent connection owner
    /// (adb forward or an agent host process) rather than an unrelated
    /// service.
    pub fn is_agent_like(&self) -> bool {
        let lower = self.command.to_ascii_lowercase();
        lower.contains("adb") || lower.contains("scrcpy") || lower.contains("app_process")
    }
}

pub struct PortProbe;

impl PortProbe {
    /// Bind-attempt probe. Address reuse is left off so a lingering owner
    /// is reported rather than silently shared.
    pub fn status(port: u16) -> PortStatus {
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(_) => PortStatus::Free,
            Err(_) => PortStatus::InUse,
        }
    }

    /// Fail with `PortInUse` when the port is taken.
    pub fn ensure_free(port: u16) -> Result<()> {
        if port == 0 {
            return Err(MirrorError::InvalidPort(port));
        }
        match Self::status(port) {
            PortStatus::Free => Ok(()),
            PortStatus::InUse => Err(MirrorError::PortInUse(port)),
        }
    }

    /// List processes holding the port, via `lsof -nP -iTCP:<port>`.
    /// Returns an empty list when lsof is unavailable.
    pub fn find_squatters(port: u16) -> Vec<PortSquatter> {
        let output = match Command::new("lsof")
            .args(["-nP", &format!("-iTCP:{}", port)])
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                log_verbose!("PORT", "lsof unavailable: {}", e);
                return Vec::new();
            }
        };
        parse_lsof_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// Kill leftover agent processes squatting on the port. Requires the
    /// caller to have enabled the safety switch; unrelated processes are
    /// never touched.
    pub fn free_port(port: u16, allow_kill: bool) -> Result<()> {
        if !allow_kill {
            return Err(MirrorError::PortInUse(port));
        }
        let squatters = Self::find_squatters(port);
        if squatters.is_empty() {
            return Err(MirrorError::PortInUse(port));
        }
        for squatter in &squatters {
            if !squatter.is_agent_like() {
                log_warn!(
                    "PORT",
                    "Port {} is held by unrelated process {} ({}), not killing",
                    port,
                    squatter.pid,
                    squatter.command
                );
                return Err(MirrorError::PortInUse(port));
            }
        }
        for squatter in squatters {
            log_info!(
                "PORT",
                "Killing leftover agent process {} ({})",
                squatter.pid,
                squatter.command
            );
            let _ = Command::new("kill")
                .arg(squatter.pid.to_string())
                .status();
        }
        Ok(())
    }
}

fn parse_lsof_output(stdout: &str) -> Vec<PortSquatter> {
    let mut squatters = Vec::new();
    for line in stdout.lines().skip(1) {
        let mut parts = line.split_whitespace();
        let command = match parts.next() {
            Some(c) => c.to_string(),
            None => continue,
        };
        let pid = match parts.next().and_then(|p| p.parse::<u32>().ok()) {
            Some(pid) => pid,
            None => continue,
        };
        if !squatters
            .iter()
            .any(|s: &PortSquatter| s.pid == pid)
        {
            squatters.push(PortSquatter { pid, command });
        }
    }
    squatters
}
