//! HDCP 1.x link authentication.
//!
//! This crate implements:
//! - The authentication session state machine and its worker
//! - The handshake with a downstream receiver (and repeater topology checks)
//! - The periodic Ri link verification loop
//! - Derived-value packet exchange for a cooperating re-encryption peer
//! - A bounded output registry with client admission control
//!
//! Hardware is reached only through the traits of `hdcp-transport`.

#![forbid(unsafe_code)]

// State machine and protocol
pub mod session;
pub mod handshake;
pub mod verify;
pub mod exchange;

// Hardware access
pub mod link;
pub mod receiver;
pub mod cipher;
pub mod keytable;

// Supporting modules
pub mod config;
pub mod errors;
pub mod ksv;
pub mod registry;
pub mod harness;

pub use config::{HdcpConfig, InvalidConfig, ReadFormat};
pub use errors::{ErrorKind, HdcpError, KsvSource, RegistryError};
pub use exchange::{ExchangePacket, PacketResult, ValueFlags};
pub use link::{LinkAdapters, LinkId, LinkSnapshot, RepeaterTopology};
pub use registry::{ClientId, OutputId, SessionRegistry};
pub use session::{HdcpSession, HotplugSignal, Policy, SessionState, SessionStatus};
pub use verify::RiSample;
