//! Error types for the HDCP core.
//!
//! Handshake and verification errors never leave the session worker: they
//! are logged and folded into the session state. Packet exchange and
//! registry operations return them to the caller.

use hdcp_transport::{BusError, EngineError, KeySourceError};
use thiserror::Error;

use crate::exchange::ValueFlags;
use crate::session::SessionState;

// ============================================================================
// Core Error Types
// ============================================================================

/// Which side a key-selection vector came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KsvSource {
    /// Our own Aksv, read from the cipher engine.
    Local,
    /// The receiver's Bksv.
    Receiver,
    /// An entry of a repeater's KSV list.
    Downstream,
}

impl std::fmt::Display for KsvSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KsvSource::Local => write!(f, "local"),
            KsvSource::Receiver => write!(f, "receiver"),
            KsvSource::Downstream => write!(f, "downstream"),
        }
    }
}

/// Errors produced while authenticating or servicing a link.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HdcpError {
    /// Bus transaction failed after the retry budget was spent
    #[error("transport error: {0}")]
    Transport(#[from] BusError),

    /// Cipher engine adapter failure
    #[error("cipher engine error: {0}")]
    Engine(EngineError),

    /// A hardware condition did not occur within its bounded wait
    #[error("timed out waiting for {condition}")]
    ProtocolTimeout { condition: &'static str },

    /// A key-selection vector failed the 20-of-40 check
    #[error("malformed {origin} key-selection vector {ksv:#012x}")]
    MalformedKeyVector { origin: KsvSource, ksv: u64 },

    /// Receiver unplugged at a checkpoint
    #[error("link lost: receiver unplugged")]
    LinkLost,

    #[error("link verification mismatch: local Ri {local:#06x}, receiver Ri' {remote:#06x}")]
    VerificationMismatch { local: u16, remote: u16 },

    /// Either the local Ri or the receiver's Ri' read back as zero.
    #[error("link verification read an all-zero Ri or Ri'")]
    ZeroVerification,

    /// Key fuse could not be read
    #[error("key table error: {0}")]
    KeyTable(#[from] KeySourceError),

    /// Cipher engine rejected the loaded key table
    #[error("key table integrity error reported by cipher engine")]
    KeyTableIntegrity,

    #[error("key-selection vector {ksv:#012x} is revoked")]
    Revoked { ksv: u64 },

    #[error("repeater topology exceeded (bstatus {bstatus:#06x})")]
    TopologyExceeded { bstatus: u16 },

    /// Packet request lacks required input values
    #[error("request is missing required values {missing:?}")]
    MissingValues { missing: ValueFlags },

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// Session worker has exited
    #[error("session worker is gone")]
    WorkerGone,
}

/// Coarse error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    ProtocolTimeout,
    MalformedKeyVector,
    LinkLost,
    VerificationMismatch,
    Request,
    Internal,
}

impl HdcpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HdcpError::Transport(_)
            | HdcpError::Engine(_)
            | HdcpError::KeyTable(_)
            | HdcpError::KeyTableIntegrity => ErrorKind::Transport,
            HdcpError::ProtocolTimeout { .. } => ErrorKind::ProtocolTimeout,
            HdcpError::MalformedKeyVector { .. }
            | HdcpError::Revoked { .. }
            | HdcpError::TopologyExceeded { .. } => ErrorKind::MalformedKeyVector,
            HdcpError::LinkLost => ErrorKind::LinkLost,
            HdcpError::VerificationMismatch { .. } | HdcpError::ZeroVerification => {
                ErrorKind::VerificationMismatch
            }
            HdcpError::MissingValues { .. } => ErrorKind::Request,
            HdcpError::InvalidTransition { .. } | HdcpError::WorkerGone => ErrorKind::Internal,
        }
    }

    /// Failures reported to packet callers as I/O errors.
    pub fn is_io(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport
                | ErrorKind::ProtocolTimeout
                | ErrorKind::MalformedKeyVector
                | ErrorKind::LinkLost
        )
    }
}

impl From<EngineError> for HdcpError {
    fn from(e: EngineError) -> Self {
        HdcpError::Engine(e)
    }
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Admission-control errors on the client binding surface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Output already bound to another client
    #[error("permission denied: output {0} is bound to another client")]
    PermissionDenied(u32),

    #[error("registry full ({capacity} outputs)")]
    ResourceExhausted { capacity: usize },

    #[error("unknown output {0}")]
    UnknownOutput(u32),

    #[error("output {0} is already registered")]
    AlreadyRegistered(u32),

    #[error("unknown client {0}")]
    UnknownClient(u64),
}
