//! System idle-sleep suppression
//!
//! While any session is capturing, the coordinator holds a "prevent idle
//! sleep" assertion. On macOS this is a spawned `caffeinate -dims` child
//! that lives as long as the hold count is non-zero; on other platforms
//! the hold is tracked but has no system effect.

#[cfg(target_os = "macos")]
use crate::log_warn;
use crate::log_verbose;
use std::process::Child;
use std::sync::{Arc, Mutex};

struct PowerInner {
    holds: u32,
    assertion: Option<Child>,
}

#[derive(Clone)]
pub struct PowerCoordinator {
    inner: Arc<Mutex<PowerInner>>,
}

impl PowerCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PowerInner {
                holds: 0,
                assertion: None,
            })),
        }
    }

    /// Acquire a hold; released when the returned guard drops.
    pub fn acquire(&self) -> PowerHold {
        let mut inner = self.inner.lock().unwrap();
        inner.holds += 1;
        if inner.holds == 1 {
            inner.assertion = spawn_assertion();
            log_verbose!("POWER", "Idle-sleep hold asserted");
        }
        PowerHold {
            coordinator: self.clone(),
        }
    }

    pub fn active_holds(&self) -> u32 {
        self.inner.lock().unwrap().holds
    }

    fn release(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.holds = inner.holds.saturating_sub(1);
        if inner.holds == 0 {
            if let Some(mut child) = inner.assertion.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
            log_verbose!("POWER", "Idle-sleep hold released");
        }
    }
}

impl Default for PowerCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "macos")]
fn spawn_assertion() -> Option<Child> {
    use std::process::{Command, Stdio};

    match Command::new("caffeinate")
        .arg("-dims")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => Some(child),
        Err(e) => {
            log_warn!("POWER", "Failed to spawn caffeinate: {}", e);
            None
        }
    }
}

#[cfg(not(target_os = "macos"))]
fn spawn_assertion() -> Option<Child> {
    None
}

/// RAII guard for one idle-sleep hold.
pub struct PowerHold {
    coordinator: PowerCoordinator,
}

impl Drop for PowerHold {
    fn drop(&mut self) {
        self.coordinator.release();
    }
}
