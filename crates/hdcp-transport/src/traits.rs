//! Collaborator traits: DDC bus, cipher engine, key source, revocation list.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::regs::EngineReg;

/// Poll interval used by the default [`CipherEngine::wait_for`].
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Errors reported by a DDC bus adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("receiver did not acknowledge offset {offset:#04x}")]
    Nak { offset: u8 },

    #[error("bus arbitration lost")]
    ArbitrationLost,

    #[error("bus transaction timed out")]
    Timeout,

    #[error("short transfer: expected {expected} bytes, got {got}")]
    ShortTransfer { expected: usize, got: usize },

    #[error("transfer format not supported by adapter")]
    Unsupported,

    #[error("bus error: {0}")]
    Other(String),
}

impl BusError {
    /// Whether retrying the same transaction may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Nak { .. } | BusError::ArbitrationLost | BusError::Timeout
        )
    }
}

/// Transfer formats an adapter supports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BusCapabilities {
    /// Adapter can read from the receiver's current offset without
    /// addressing a register first.
    pub short_read: bool,
}

/// Addressed byte transactions against the receiver's HDCP port.
#[async_trait]
pub trait DdcBus: Send + Sync {
    /// Read `buf.len()` bytes starting at `offset`.
    async fn read(&self, offset: u8, buf: &mut [u8]) -> Result<(), BusError>;

    /// Write `data` starting at `offset`.
    async fn write(&self, offset: u8, data: &[u8]) -> Result<(), BusError>;

    /// Read from the receiver's current offset (short read format).
    async fn read_current(&self, buf: &mut [u8]) -> Result<(), BusError> {
        let _ = buf;
        Err(BusError::Unsupported)
    }

    fn capabilities(&self) -> BusCapabilities {
        BusCapabilities::default()
    }
}

/// Errors reported by a cipher engine adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("timed out waiting for {reg:?} & {mask:#x} (last value {last:#x})")]
    Timeout { reg: EngineReg, mask: u32, last: u32 },

    #[error("cipher engine unavailable: {0}")]
    Unavailable(String),
}

/// The host's HDCP cipher block, seen as word registers.
#[async_trait]
pub trait CipherEngine: Send + Sync {
    fn read(&self, reg: EngineReg) -> u32;

    fn write(&self, reg: EngineReg, value: u32);

    /// Wait until any bit of `mask` is set in `reg`, returning the register value.
    async fn wait_for(
        &self,
        reg: EngineReg,
        mask: u32,
        timeout: Duration,
    ) -> Result<u32, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            let value = self.read(reg);
            if value & mask != 0 {
                return Ok(value);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout {
                    reg,
                    mask,
                    last: value,
                });
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Read-modify-write helper.
    fn modify(&self, reg: EngineReg, clear: u32, set: u32) {
        let value = self.read(reg);
        self.write(reg, (value & !clear) | set);
    }
}

/// Number of 32-bit words in a device key table (144 bytes).
pub const KEY_TABLE_WORDS: usize = 36;

/// A device key table. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyTable([u32; KEY_TABLE_WORDS]);

impl KeyTable {
    pub fn new(words: [u32; KEY_TABLE_WORDS]) -> Self {
        Self(words)
    }

    pub fn words(&self) -> &[u32; KEY_TABLE_WORDS] {
        &self.0
    }
}

impl std::fmt::Debug for KeyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyTable(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeySourceError {
    #[error("key fuse read failed: {0}")]
    ReadFailed(String),

    #[error("key fuse contents failed integrity check")]
    Corrupt,
}

/// Source of the per-device secret key table ("kfuse").
pub trait KeySource: Send + Sync {
    fn read_key_table(&self) -> Result<KeyTable, KeySourceError>;
}

/// Revoked key-selection vectors, maintained outside this crate.
pub trait RevocationList: Send + Sync {
    fn is_revoked(&self, ksv: u64) -> bool;
}

/// Revocation list that revokes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRevocation;

impl RevocationList for NoRevocation {
    fn is_revoked(&self, _ksv: u64) -> bool {
        false
    }
}
