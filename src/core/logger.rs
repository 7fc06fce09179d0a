//! Logging for sc-host
//!
//! Tag-targeted wrappers over the `log` facade. Lifecycle messages go
//! out at info, recoverable anomalies at warn, failures at error.
//! Per-event stream tracing maps to debug and the periodic statistics
//! to trace, and both stay behind the global VERBOSE/DEBUG switches so
//! a disabled level costs one relaxed atomic load on the hot paths
//! (socket reads, decode loops) no matter how the logger itself is
//! filtered.
//!
//! The tag names the subsystem (NET, SESSION, AUDIO, ...) and becomes
//! the log target, so `RUST_LOG=NET=debug` isolates one stream.

/// Periodic stream statistics; compiled in, emitted only with --debug.
#[macro_export]
macro_rules! log_debug {
    ($tag:expr, $($arg:tt)*) => {
        if $crate::core::is_debug() {
            ::log::trace!(target: $tag, $($arg)*);
        }
    };
}

/// Per-event stream tracing (connects, packets, drops); emitted with -v.
#[macro_export]
macro_rules! log_verbose {
    ($tag:expr, $($arg:tt)*) => {
        if $crate::core::is_verbose() {
            ::log::debug!(target: $tag, $($arg)*);
        }
    };
}

/// Lifecycle transitions and other always-relevant events.
#[macro_export]
macro_rules! log_info {
    ($tag:expr, $($arg:tt)*) => {
        { ::log::info!(target: $tag, $($arg)*); }
    };
}

/// Recoverable anomalies: overflow, transient decode failures.
#[macro_export]
macro_rules! log_warn {
    ($tag:expr, $($arg:tt)*) => {
        { ::log::warn!(target: $tag, $($arg)*); }
    };
}

/// Failures that move a component to an error state.
#[macro_export]
macro_rules! log_error {
    ($tag:expr, $($arg:tt)*) => {
        { ::log::error!(target: $tag, $($arg)*); }
    };
}
