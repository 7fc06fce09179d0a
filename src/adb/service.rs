//! Device-management channel
//!
//! Everything that goes through the adb binary: device listing, artifact
//! push, port mappings, and shell execution. The trait exists so the
//! launcher and session can be driven by a test double.

use crate::core::error::{MirrorError, Result};
use crate::log_verbose;
use serde::{Deserialize, Serialize};
use std::process::{Child, Command, Stdio};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub serial: String,
    pub state: String,
    pub model: String,
}

impl Device {
    pub fn is_ready(&self) -> bool {
        self.state == "device"
    }
}

pub trait AdbService: Send + Sync {
    fn devices(&self) -> Result<Vec<Device>>;

    fn push(&self, serial: &str, local: &str, remote: &str) -> Result<()>;

    fn forward(&self, serial: &str, local_port: u16, remote: &str) -> Result<()>;

    fn remove_forward(&self, serial: &str, local_port: u16) -> Result<()>;

    fn reverse(&self, serial: &str, remote: &str, local_port: u16) -> Result<()>;

    fn remove_reverse(&self, serial: &str, remote: &str) -> Result<()>;

    /// Run a shell command on the device and collect its output.
    fn shell(&self, serial: &str, args: &[&str]) -> Result<String>;

    /// Spawn a long-running device shell command; the caller owns the
    /// child process.
    fn spawn_shell(&self, serial: &str, command: &[String]) -> Result<Child>;

    /// Fail with `DeviceNotReady` unless the serial is attached and ready.
    fn ensure_device_ready(&self, serial: &str) -> Result<()> {
        let devices = self.devices()?;
        match devices.iter().find(|d| d.serial == serial) {
            Some(device) if device.is_ready() => Ok(()),
            Some(device) => Err(MirrorError::DeviceNotReady(format!(
                "{} is {}",
                serial, device.state
            ))),
            None => Err(MirrorError::DeviceNotReady(format!(
                "{} is not attached",
                serial
            ))),
        }
    }
}

/// AdbService backed by the adb binary.
pub struct ExecAdbService {
    adb: String,
}

impl ExecAdbService {
    pub fn new(adb_binary: impl Into<String>) -> Self {
        Self {
            adb: adb_binary.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        log_verbose!("ADB", "adb {}", args.join(" "));
        let output = Command::new(&self.adb)
            .args(args)
            .output()
            .map_err(|e| MirrorError::DeviceNotReady(format!("failed to run adb: {}", e)))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            // Recognized diagnoses keep their own variant; the rest is
            // carried raw for the caller to wrap.
            Err(MirrorError::classify_agent_output(&stderr).unwrap_or_else(|| {
                MirrorError::Io(std::io::Error::new(std::io::ErrorKind::Other, stderr))
            }))
        }
    }
}

/// Wrap an unclassified adb failure; classified errors pass through.
fn wrap_unclassified(
    error: MirrorError,
    wrap: impl FnOnce(String) -> MirrorError,
) -> MirrorError {
    match error {
        MirrorError::Io(err) => wrap(err.to_string()),
        other => other,
    }
}

impl AdbService for ExecAdbService {
    fn devices(&self) -> Result<Vec<Device>> {
        let stdout = self
            .run(&["devices", "-l"])
            .map_err(|e| wrap_unclassified(e, MirrorError::DeviceNotReady))?;
        Ok(parse_device_list(&stdout))
    }

    fn push(&self, serial: &str, local: &str, remote: &str) -> Result<()> {
        self.run(&["-s", serial, "push", local, remote])
            .map(|_| ())
            .map_err(|e| {
                wrap_unclassified(e, |m| {
                    MirrorError::AgentStartFailed(format!("push failed: {}", m))
                })
            })
    }

    fn forward(&self, serial: &str, local_port: u16, remote: &str) -> Result<()> {
        self.run(&["-s", serial, "forward", &format!("tcp:{}", local_port), remote])
            .map(|_| ())
            .map_err(|e| wrap_unclassified(e, MirrorError::PortForwardingFailed))
    }

    fn remove_forward(&self, serial: &str, local_port: u16) -> Result<()> {
        self.run(&[
            "-s",
            serial,
            "forward",
            "--remove",
            &format!("tcp:{}", local_port),
        ])
        .map(|_| ())
        .map_err(|e| wrap_unclassified(e, MirrorError::PortForwardingFailed))
    }

    fn reverse(&self, serial: &str, remote: &str, local_port: u16) -> Result<()> {
        self.run(&[
            "-s",
            serial,
            "reverse",
            remote,
            &format!("tcp:{}", local_port),
        ])
        .map(|_| ())
        .map_err(|e| wrap_unclassified(e, MirrorError::PortForwardingFailed))
    }

    fn remove_reverse(&self, serial: &str, remote: &str) -> Result<()> {
        self.run(&["-s", serial, "reverse", "--remove", remote])
            .map(|_| ())
            .map_err(|e| wrap_unclassified(e, MirrorError::PortForwardingFailed))
    }

    fn shell(&self, serial: &str, args: &[&str]) -> Result<String> {
        let mut full = vec!["-s", serial, "shell"];
        full.extend_from_slice(args);
        self.run(&full)
            .map_err(|e| wrap_unclassified(e, MirrorError::DeviceNotReady))
    }

    fn spawn_shell(&self, serial: &str, command: &[String]) -> Result<Child> {
        log_verbose!("ADB", "adb -s {} shell {}", serial, command.join(" "));
        Command::new(&self.adb)
            .arg("-s")
            .arg(serial)
            .arg("shell")
            .args(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MirrorError::AgentStartFailed(format!("failed to spawn adb: {}", e)))
    }
}

/// Parse `adb devices -l` output. Model is pulled from the `model:` field
/// when present.
fn parse_device_list(stdout: &str) -> Vec<Device> {
    let mut devices = Vec::new();
    for line in stdout.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        let serial = parts[0].to_string();
        let state = parts[1].to_string();

        let mut model = "Unknown".to_string();
        for part in &parts {
            if let Some(value) = part.strip_prefix("model:") {
                model = value.replace('_', " ");
            }
        }
        devices.push(Device {
            serial,
            state,
            model,
        });
    }
    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_list_parsing() {
        let out = "\
List of devices attached
emulator-5554          device product:sdk_gphone64 model:sdk_gphone64_arm64 device:emu64a
R58M12ABCDE            unauthorized usb:337641472X
192.168.1.20:5555      offline
";
        let devices = parse_device_list(out);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].serial, "emulator-5554");
        assert_eq!(devices[0].model, "sdk gphone64 arm64");
        assert!(devices[0].is_ready());
        assert_eq!(devices[1].state, "unauthorized");
        assert!(!devices[1].is_ready());
        assert_eq!(devices[2].model, "Unknown");
    }

    #[test]
    fn empty_device_list() {
        assert!(parse_device_list("List of devices attached\n\n").is_empty());
    }

    struct OneDeviceAdb;

    impl AdbService for OneDeviceAdb {
        fn devices(&self) -> Result<Vec<Device>> {
            Ok(vec![
                Device {
                    serial: "good".into(),
                    state: "device".into(),
                    model: "Pixel".into(),
                },
                Device {
                    serial: "bad".into(),
                    state: "offline".into(),
                    model: "Pixel".into(),
                },
            ])
        }
        fn push(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn forward(&self, _: &str, _: u16, _: &str) -> Result<()> {
            Ok(())
        }
        fn remove_forward(&self, _: &str, _: u16) -> Result<()> {
            Ok(())
        }
        fn reverse(&self, _: &str, _: &str, _: u16) -> Result<()> {
            Ok(())
        }
        fn remove_reverse(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn shell(&self, _: &str, _: &[&str]) -> Result<String> {
            Ok(String::new())
        }
        fn spawn_shell(&self, _: &str, _: &[String]) -> Result<Child> {
            unreachable!("not spawned in this test")
        }
    }

    #[test]
    fn ensure_device_ready_distinguishes_states() {
        let adb = OneDeviceAdb;
        assert!(adb.ensure_device_ready("good").is_ok());
        assert!(matches!(
            adb.ensure_device_ready("bad"),
            Err(MirrorError::DeviceNotReady(_))
        ));
        assert!(matches!(
            adb.ensure_device_ready("missing"),
            Err(MirrorError::DeviceNotReady(_))
        ));
    }
}
