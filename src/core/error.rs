//! Error taxonomy for sc-host
//!
//! Low-level OS and agent failures are mapped onto a small set of
//! user-facing variants. Transport and launcher errors terminate the
//! session; parser errors never surface (malformed bytes are skipped);
//! audio decode errors are logged and swallowed.

use std::io;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, MirrorError>;

#[derive(Error, Debug)]
pub enum MirrorError {
    /// The configured port is invalid (e.g. zero).
    #[error("invalid port: {0}")]
    InvalidPort(u16),

    /// Another process already owns the port.
    #[error("port {0} is already in use")]
    PortInUse(u16),

    /// The device is missing, offline, or unauthorized.
    #[error("device not ready: {0}")]
    DeviceNotReady(String),

    /// adb could not establish the forward/reverse mapping.
    #[error("port forwarding failed: {0}")]
    PortForwardingFailed(String),

    /// The agent process could not be launched.
    #[error("agent start failed: {0}")]
    AgentStartFailed(String),

    /// The agent reported an encoder failure consistent with another
    /// mirroring instance already owning the device.
    #[error("device is occupied by another mirroring session")]
    DeviceOccupied,

    /// Binding the TCP listener failed.
    #[error("listener creation failed: {0}")]
    ListenerCreationFailed(String),

    /// The listener failed after it was established.
    #[error("listener failed: {0}")]
    ListenerFailed(String),

    /// Dialing the agent failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Waiting for the video connection exceeded its bound.
    #[error("timed out waiting for the video connection")]
    ConnectionTimeout,

    /// The connection was cancelled by a stop request.
    #[error("connection cancelled")]
    ConnectionCancelled,

    /// A socket read failed mid-stream.
    #[error("receive error: {0}")]
    ReceiveError(String),

    /// The agent exited abnormally (code != 0 and != 15).
    #[error("agent terminated abnormally with code {0}")]
    ProcessTerminated(i32),

    /// Capture could not be started.
    #[error("capture start failed: {0}")]
    CaptureStartFailed(String),

    /// Decoder initialization failed.
    #[error("decoder initialization failed: {0}")]
    InitializationFailed(String),

    /// A decode call failed.
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl MirrorError {
    /// Process exit code for the surrounding CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            MirrorError::DeviceNotReady(_) => 2,
            MirrorError::PortInUse(_) | MirrorError::InvalidPort(_) => 3,
            MirrorError::ConnectionTimeout => 4,
            MirrorError::AgentStartFailed(_)
            | MirrorError::PortForwardingFailed(_)
            | MirrorError::DeviceOccupied => 5,
            MirrorError::ProcessTerminated(_) => 6,
            _ => 1,
        }
    }

    /// Map an io error from a bind/connect attempt to the taxonomy.
    pub fn from_bind_error(err: io::Error, port: u16) -> Self {
        // EADDRINUSE is 48 on macOS and 98 on Linux; ErrorKind covers both.
        if err.kind() == io::ErrorKind::AddrInUse || matches!(err.raw_os_error(), Some(48 | 98)) {
            MirrorError::PortInUse(port)
        } else {
            MirrorError::ListenerCreationFailed(err.to_string())
        }
    }

    /// Map an io error from an outgoing dial to the taxonomy.
    pub fn from_connect_error(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => MirrorError::ConnectionTimeout,
            io::ErrorKind::Interrupted => MirrorError::ConnectionCancelled,
            _ => MirrorError::ConnectionFailed(err.to_string()),
        }
    }

    /// Classify a line of agent stderr output. Returns None when the line
    /// carries no diagnosis we recognize.
    pub fn classify_agent_output(line: &str) -> Option<Self> {
        let lower = line.to_ascii_lowercase();
        if lower.contains("codecexception")
            || lower.contains("encoder") && lower.contains("fail")
            || lower.contains("configure") && lower.contains("codec")
        {
            Some(MirrorError::DeviceOccupied)
        } else if lower.contains("device offline")
            || lower.contains("device unauthorized")
            || lower.contains("device") && lower.contains("not found")
        {
            Some(MirrorError::DeviceNotReady(line.trim().to_string()))
        } else if lower.contains("address already in use") {
            Some(MirrorError::PortInUse(0))
        } else {
            None
        }
    }

    /// Whether the error might succeed on retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MirrorError::PortInUse(_)
                | MirrorError::PortForwardingFailed(_)
                | MirrorError::ConnectionTimeout
                | MirrorError::ConnectionFailed(_)
                | MirrorError::Io(_)
        )
    }
}
