//! Network module - TCP transport to the agent

pub mod acceptor;
pub mod ports;

pub use acceptor::{AcceptorConfig, AcceptorState, SocketAcceptor};
pub use ports::PortProbe;
