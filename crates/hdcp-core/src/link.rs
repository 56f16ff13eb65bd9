//! Link identity, hardware bundle and the published authentication snapshot.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use hdcp_transport::{ddc, Bcaps, CipherEngine, DdcBus, KeySource, NoRevocation, RevocationList};
use serde::Serialize;
use tokio::time::Instant;

use crate::cipher::Cipher;
use crate::config::HdcpConfig;
use crate::keytable::KeyTableLoader;
use crate::receiver::ReceiverPort;

/// Identity of a physical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link{}", self.0)
    }
}

/// Platform adapters for one link.
#[derive(Clone)]
pub struct LinkAdapters {
    pub bus: Arc<dyn DdcBus>,
    pub engine: Arc<dyn CipherEngine>,
    pub keys: Arc<dyn KeySource>,
    pub revocation: Arc<dyn RevocationList>,
}

impl LinkAdapters {
    pub fn new(
        bus: Arc<dyn DdcBus>,
        engine: Arc<dyn CipherEngine>,
        keys: Arc<dyn KeySource>,
    ) -> Self {
        Self {
            bus,
            engine,
            keys,
            revocation: Arc::new(NoRevocation),
        }
    }

    pub fn with_revocation(mut self, revocation: Arc<dyn RevocationList>) -> Self {
        self.revocation = revocation;
        self
    }
}

/// The adapters wired up with the session's retry policy and plug state.
/// Owned by the session behind an async mutex.
pub struct LinkHardware {
    pub(crate) port: ReceiverPort,
    pub(crate) cipher: Cipher,
    pub(crate) keys: KeyTableLoader,
    pub(crate) revocation: Arc<dyn RevocationList>,
}

impl LinkHardware {
    pub(crate) fn attach(
        adapters: LinkAdapters,
        plugged: Arc<AtomicBool>,
        config: &HdcpConfig,
    ) -> Self {
        Self {
            port: ReceiverPort::new(
                adapters.bus,
                config.bus_retry(),
                plugged,
                config.read_format,
            ),
            cipher: Cipher::new(adapters.engine),
            keys: KeyTableLoader::new(
                adapters.keys,
                config.key_timeout(),
                config.sram_clear_attempts,
            ),
            revocation: adapters.revocation,
        }
    }
}

/// Downstream topology reported by a repeater.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeaterTopology {
    pub bstatus: u16,
    pub device_count: u8,
    pub depth: u8,
    pub ksv_list: Vec<u64>,
    /// Repeater's V' (H0..H4). Checked by the cooperating peer, which holds M0.
    pub v_prime: [u8; ddc::V_PRIME_LEN],
}

/// Values fixed by a successful handshake. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub a_n: u64,
    pub a_ksv: u64,
    pub b_ksv: u64,
    pub bcaps: Bcaps,
    pub repeater: Option<RepeaterTopology>,
    pub authenticated_at: Instant,
}
