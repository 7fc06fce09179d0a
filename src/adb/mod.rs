//! ADB module - device management channel and agent lifecycle

pub mod launcher;
pub mod service;

pub use launcher::{build_agent_command, ServerLauncher};
pub use service::{AdbService, Device, ExecAdbService};
