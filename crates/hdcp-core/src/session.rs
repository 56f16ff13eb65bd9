//! Authentication session: state machine, control surface and worker.
//!
//! Each session owns one worker task fed by a bounded command channel. The
//! handshake and the verification loop run only on that worker, so at most
//! one of them is in flight per link. Control calls flip shared flags and
//! enqueue work; the ones that must not return while hardware work is in
//! flight (`disable`, unplug) wait for the worker to drain.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::config::{HdcpConfig, InvalidConfig};
use crate::errors::{ErrorKind, HdcpError};
use crate::exchange::{self, ExchangePacket};
use crate::handshake;
use crate::ksv;
use crate::link::{LinkAdapters, LinkHardware, LinkId, LinkSnapshot};
use crate::verify::{self, RiSample};

// ============================================================================
// States and Policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No activity. Left only through `enable()` or `renegotiate()`.
    Off,
    /// No shared secret with the receiver.
    Unauthenticated,
    /// Authenticated; periodic Ri checks running.
    LinkVerify,
    /// A fresh handshake has been requested.
    Renegotiate,
}

impl SessionState {
    /// Whether `self -> to` is an edge of the session state machine.
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (Unauthenticated, _) => true,
            (_, LinkVerify) => false,
            (Off | LinkVerify | Renegotiate, _) => true,
        }
    }
}

/// When a plugged receiver is authenticated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Only after an explicit `enable()`.
    #[default]
    OnDemand,
    /// As soon as a receiver is plugged.
    AlwaysOn,
}

// ============================================================================
// Hotplug Signal
// ============================================================================

/// The session's plug state.
///
/// `assert`/`deassert` are synchronous so a hotplug interrupt path can flip
/// the flag directly: deasserting stops in-flight hardware work at its next
/// checkpoint and wakes the worker from any sleep. The state bookkeeping
/// still goes through [`HdcpSession::set_plugged`].
#[derive(Clone)]
pub struct HotplugSignal {
    plugged: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl HotplugSignal {
    fn new() -> Self {
        Self {
            plugged: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn is_plugged(&self) -> bool {
        self.plugged.load(Ordering::SeqCst)
    }

    pub fn assert(&self) {
        self.plugged.store(true, Ordering::SeqCst);
    }

    pub fn deassert(&self) {
        self.plugged.store(false, Ordering::SeqCst);
        self.wake();
    }

    fn wake(&self) {
        self.wake.notify_waiters();
    }

    /// Sleep for `period`, returning early when woken. Returns at once if
    /// `keep_going` is already false once the wake-up is armed.
    async fn pause(&self, period: Duration, keep_going: impl Fn() -> bool) {
        let notified = self.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !keep_going() {
            return;
        }
        tokio::select! {
            _ = sleep(period) => {}
            _ = notified => {}
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// Point-in-time view of a session, for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub link: LinkId,
    pub state: SessionState,
    pub policy: Policy,
    pub plugged: bool,
    pub a_ksv: Option<String>,
    pub b_ksv: Option<String>,
    pub repeater: bool,
    pub downstream_devices: Option<u8>,
    pub attempts: u64,
    pub failures: u64,
    pub verifications: u64,
    pub last_error: Option<String>,
}

// ============================================================================
// Worker
// ============================================================================

enum WorkerCommand {
    /// Run authentication attempts (and the verification loop on success).
    Authenticate,
    /// Acknowledge once everything queued before it has finished.
    Drain(oneshot::Sender<()>),
    Shutdown,
}

struct Shared {
    link_id: LinkId,
    config: HdcpConfig,
    state: watch::Sender<SessionState>,
    policy: Mutex<Policy>,
    hotplug: HotplugSignal,
    /// An `Authenticate` command is queued.
    pending: AtomicBool,
    /// The worker is running attempts or the verification loop.
    busy: AtomicBool,
    retries_left: AtomicU32,
    snapshot: RwLock<Option<Arc<LinkSnapshot>>>,
    hardware: AsyncMutex<LinkHardware>,
    attempts: AtomicU64,
    failures: AtomicU64,
    verifications: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn transition(&self, to: SessionState) -> Result<(), HdcpError> {
        self.advance(to, |_| true).map(|_| ())
    }

    /// Move to `to` if `when` accepts the current state. Illegal edges are
    /// rejected; returns whether the transition happened.
    fn advance(
        &self,
        to: SessionState,
        when: impl FnOnce(SessionState) -> bool,
    ) -> Result<bool, HdcpError> {
        let mut outcome = Ok(false);
        let mut from = to;
        self.state.send_if_modified(|current| {
            from = *current;
            if !when(from) {
                return false;
            }
            if !from.can_transition_to(to) {
                outcome = Err(HdcpError::InvalidTransition { from, to });
                return false;
            }
            *current = to;
            outcome = Ok(true);
            from != to
        });
        match &outcome {
            Ok(true) if from != to => {
                info!(link = %self.link_id, ?from, ?to, "session state changed")
            }
            Err(e) => warn!(link = %self.link_id, error = %e, "rejected state change"),
            _ => {}
        }
        outcome
    }

    fn snapshot(&self) -> Option<Arc<LinkSnapshot>> {
        self.snapshot.read().clone()
    }

    /// The snapshot, but only while the link is verified.
    fn authenticated_snapshot(&self) -> Option<Arc<LinkSnapshot>> {
        if self.state() == SessionState::LinkVerify {
            self.snapshot()
        } else {
            None
        }
    }

    fn clear_snapshot(&self) {
        *self.snapshot.write() = None;
    }

    fn take_retry(&self) -> bool {
        self.retries_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn wants_attempt(&self) -> bool {
        self.hotplug.is_plugged() && self.state() == SessionState::Renegotiate
    }

    async fn run_attempts(&self) {
        loop {
            if !self.hotplug.is_plugged() {
                return;
            }
            match self.state() {
                SessionState::Off | SessionState::LinkVerify => return,
                SessionState::Renegotiate => {
                    let entered = self.advance(SessionState::Unauthenticated, |s| {
                        s == SessionState::Renegotiate
                    });
                    if !matches!(entered, Ok(true)) {
                        return;
                    }
                }
                SessionState::Unauthenticated => {}
            }

            match self.attempt().await {
                Ok(()) => {
                    if self.state() == SessionState::Renegotiate {
                        continue;
                    }
                    return;
                }
                Err(e) => {
                    if self.state() == SessionState::Renegotiate {
                        continue;
                    }
                    self.fail(&e);
                    if e == HdcpError::LinkLost || !self.take_retry() {
                        return;
                    }
                    let delay = self.config.renegotiate_delay();
                    info!(link = %self.link_id, ?delay, "retrying authentication");
                    self.hotplug
                        .pause(delay, || {
                            self.hotplug.is_plugged()
                                && self.state() == SessionState::Unauthenticated
                        })
                        .await;
                }
            }
        }
    }

    /// One handshake, then the verification loop if it succeeded.
    async fn attempt(&self) -> Result<(), HdcpError> {
        self.clear_snapshot();
        self.attempts.fetch_add(1, Ordering::SeqCst);
        debug!(link = %self.link_id, "authentication attempt");

        let snapshot = {
            let hw = self.hardware.lock().await;
            let result = handshake::authenticate(&hw, &self.config).await;
            if result.is_err() {
                hw.cipher.stop(self.config.fail_closed);
            }
            result?
        };

        let repeater = snapshot.repeater.as_ref().map(|t| t.device_count);
        let (a_ksv, b_ksv) = (snapshot.a_ksv, snapshot.b_ksv);
        *self.snapshot.write() = Some(Arc::new(snapshot));
        if !self.advance(SessionState::LinkVerify, |s| s == SessionState::Unauthenticated)? {
            debug!(link = %self.link_id, "handshake superseded");
            self.clear_snapshot();
            return Ok(());
        }
        info!(
            link = %self.link_id,
            aksv = %ksv::to_hex(a_ksv),
            bksv = %ksv::to_hex(b_ksv),
            downstream = ?repeater,
            "link authenticated"
        );
        self.verification_loop().await
    }

    fn verifying(&self) -> bool {
        self.hotplug.is_plugged() && self.state() == SessionState::LinkVerify
    }

    /// Returns `Ok` when the loop stops for unplug, disable or renegotiate.
    async fn verification_loop(&self) -> Result<(), HdcpError> {
        loop {
            if !self.verifying() {
                return Ok(());
            }
            {
                let hw = self.hardware.lock().await;
                if !self.verifying() {
                    return Ok(());
                }
                match verify::verify_link(&hw, &self.config, true).await {
                    Ok(ri) => {
                        self.verifications.fetch_add(1, Ordering::SeqCst);
                        trace!(link = %self.link_id, ri, "link verified");
                    }
                    Err(HdcpError::LinkLost) => return Ok(()),
                    Err(e) => {
                        hw.cipher.stop(self.config.fail_closed);
                        return Err(e);
                    }
                }
            }
            self.hotplug
                .pause(self.config.verify_period(), || self.verifying())
                .await;
        }
    }

    fn fail(&self, e: &HdcpError) {
        self.clear_snapshot();
        if *e == HdcpError::LinkLost {
            info!(link = %self.link_id, "authentication aborted: receiver unplugged");
        } else {
            self.failures.fetch_add(1, Ordering::SeqCst);
            *self.last_error.lock() = Some(e.to_string());
            match e.kind() {
                ErrorKind::VerificationMismatch => {
                    error!(link = %self.link_id, error = %e, "link verification failed")
                }
                _ => warn!(link = %self.link_id, error = %e, "authentication failed"),
            }
        }
        let dropped = self.advance(SessionState::Unauthenticated, |s| {
            s != SessionState::Off && s != SessionState::Renegotiate
        });
        debug_assert!(dropped.is_ok(), "every state may drop to Unauthenticated");
    }
}

async fn run_worker(shared: Arc<Shared>, mut commands: mpsc::Receiver<WorkerCommand>) {
    debug!(link = %shared.link_id, "session worker started");
    while let Some(command) = commands.recv().await {
        match command {
            WorkerCommand::Authenticate => {
                shared.busy.store(true, Ordering::SeqCst);
                shared.pending.store(false, Ordering::SeqCst);
                loop {
                    shared.run_attempts().await;
                    shared.busy.store(false, Ordering::SeqCst);
                    // a renegotiate that raced with the end of the run
                    if !shared.wants_attempt() || shared.busy.swap(true, Ordering::SeqCst) {
                        break;
                    }
                }
            }
            WorkerCommand::Drain(ack) => {
                let _ = ack.send(());
            }
            WorkerCommand::Shutdown => break,
        }
    }
    debug!(link = %shared.link_id, "session worker stopped");
}

// ============================================================================
// Session
// ============================================================================

/// The HDCP authentication session of one display output.
pub struct HdcpSession {
    shared: Arc<Shared>,
    commands: mpsc::Sender<WorkerCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HdcpSession {
    /// Create the session in `Off` and start its worker. Must be called from
    /// within a tokio runtime.
    pub fn spawn(
        link_id: LinkId,
        adapters: LinkAdapters,
        config: HdcpConfig,
    ) -> Result<Self, InvalidConfig> {
        config.validate()?;
        let hotplug = HotplugSignal::new();
        let hardware = LinkHardware::attach(adapters, hotplug.plugged.clone(), &config);
        let (state, _) = watch::channel(SessionState::Off);
        let (commands, receiver) = mpsc::channel(config.command_queue);

        let shared = Arc::new(Shared {
            link_id,
            policy: Mutex::new(config.policy),
            retries_left: AtomicU32::new(config.retry_budget),
            config,
            state,
            hotplug,
            pending: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            snapshot: RwLock::new(None),
            hardware: AsyncMutex::new(hardware),
            attempts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            verifications: AtomicU64::new(0),
            last_error: Mutex::new(None),
        });
        let worker = tokio::spawn(run_worker(shared.clone(), receiver));
        info!(link = %link_id, policy = ?shared.config.policy, "session created");

        Ok(Self {
            shared,
            commands,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn link_id(&self) -> LinkId {
        self.shared.link_id
    }

    pub fn config(&self) -> &HdcpConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn policy(&self) -> Policy {
        *self.shared.policy.lock()
    }

    pub fn is_plugged(&self) -> bool {
        self.shared.hotplug.is_plugged()
    }

    /// Values from the last successful handshake, while they are current.
    pub fn snapshot(&self) -> Option<Arc<LinkSnapshot>> {
        self.shared.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn hotplug_signal(&self) -> HotplugSignal {
        self.shared.hotplug.clone()
    }

    pub fn status(&self) -> SessionStatus {
        let snapshot = self.snapshot();
        let topology = snapshot.as_ref().and_then(|s| s.repeater.as_ref());
        SessionStatus {
            link: self.link_id(),
            state: self.state(),
            policy: self.policy(),
            plugged: self.is_plugged(),
            a_ksv: snapshot.as_ref().map(|s| ksv::to_hex(s.a_ksv)),
            b_ksv: snapshot.as_ref().map(|s| ksv::to_hex(s.b_ksv)),
            repeater: topology.is_some(),
            downstream_devices: topology.map(|t| t.device_count),
            attempts: self.shared.attempts.load(Ordering::SeqCst),
            failures: self.shared.failures.load(Ordering::SeqCst),
            verifications: self.shared.verifications.load(Ordering::SeqCst),
            last_error: self.shared.last_error.lock().clone(),
        }
    }

    /// `Off` -> `Unauthenticated`, then an attempt if a receiver is plugged.
    /// No-op while the link is verified.
    pub async fn enable(&self) -> Result<(), HdcpError> {
        let shared = &self.shared;
        shared
            .retries_left
            .store(shared.config.retry_budget, Ordering::SeqCst);
        if shared.state() == SessionState::LinkVerify {
            return Ok(());
        }
        shared.advance(SessionState::Unauthenticated, |s| s == SessionState::Off)?;
        if self.is_plugged() {
            self.schedule().await?;
        }
        Ok(())
    }

    /// Stop all work and move to `Off`. Returns once the worker has drained;
    /// no handshake step runs after this returns.
    pub async fn disable(&self) -> Result<(), HdcpError> {
        self.shared.hotplug.deassert();
        self.drain().await?;
        self.quiesce().await;
        self.shared.transition(SessionState::Off)
    }

    pub async fn set_policy(&self, policy: Policy) -> Result<(), HdcpError> {
        let old = std::mem::replace(&mut *self.shared.policy.lock(), policy);
        if old != policy {
            info!(link = %self.link_id(), ?old, new = ?policy, "policy changed");
        }
        if old == Policy::OnDemand && policy == Policy::AlwaysOn && self.is_plugged() {
            self.enable().await?;
        }
        Ok(())
    }

    /// Force a fresh handshake from any state.
    pub async fn renegotiate(&self) -> Result<(), HdcpError> {
        self.shared.transition(SessionState::Renegotiate)?;
        self.shared.hotplug.wake();
        self.shared
            .retries_left
            .store(self.shared.config.retry_budget, Ordering::SeqCst);
        if self.is_plugged() {
            self.schedule().await?;
        }
        Ok(())
    }

    /// Hotplug notification. Asserting authenticates when the session is
    /// enabled or the policy is `AlwaysOn`; deasserting drains the worker and
    /// drops back to `Unauthenticated` (or stays `Off`).
    pub async fn set_plugged(&self, plugged: bool) -> Result<(), HdcpError> {
        info!(link = %self.link_id(), plugged, "hotplug");
        if plugged {
            self.shared.hotplug.assert();
            if self.state() != SessionState::Off || self.policy() == Policy::AlwaysOn {
                self.enable().await?;
            }
            return Ok(());
        }
        self.shared.hotplug.deassert();
        self.drain().await?;
        self.quiesce().await;
        self.shared
            .advance(SessionState::Unauthenticated, |s| s != SessionState::Off)?;
        Ok(())
    }

    /// `count` Ri pairs read back to back, for link diagnostics.
    pub async fn read_verification_stream(&self, count: usize) -> Result<Vec<RiSample>, HdcpError> {
        let hw = self.shared.hardware.lock().await;
        verify::sample_stream(&hw, count).await
    }

    pub async fn get_derived_status(&self, packet: &mut ExchangePacket) -> Result<(), HdcpError> {
        let hw = self.shared.hardware.lock().await;
        let snapshot = self.shared.snapshot();
        exchange::derived_status(&hw, &self.shared.config, snapshot.as_deref(), packet).await
    }

    pub async fn get_derived_secret(&self, packet: &mut ExchangePacket) -> Result<(), HdcpError> {
        let hw = self.shared.hardware.lock().await;
        let snapshot = self.shared.authenticated_snapshot();
        exchange::derived_secret(&hw, &self.shared.config, snapshot.as_deref(), packet).await
    }

    /// Disable, then stop and join the worker.
    pub async fn shutdown(&self) {
        if let Err(e) = self.disable().await {
            debug!(link = %self.link_id(), error = %e, "disable during shutdown");
        }
        let _ = self.commands.send(WorkerCommand::Shutdown).await;
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(link = %self.link_id(), error = %e, "session worker panicked");
            }
        }
        info!(link = %self.link_id(), "session shut down");
    }

    async fn schedule(&self) -> Result<(), HdcpError> {
        let shared = &self.shared;
        if shared.busy.load(Ordering::SeqCst) || shared.pending.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(link = %self.link_id(), "authentication scheduled");
        if self.commands.send(WorkerCommand::Authenticate).await.is_err() {
            shared.pending.store(false, Ordering::SeqCst);
            return Err(HdcpError::WorkerGone);
        }
        Ok(())
    }

    async fn drain(&self) -> Result<(), HdcpError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(WorkerCommand::Drain(ack))
            .await
            .map_err(|_| HdcpError::WorkerGone)?;
        done.await.map_err(|_| HdcpError::WorkerGone)
    }

    /// After a drain: forget the link values and stop the engine.
    async fn quiesce(&self) {
        self.shared.clear_snapshot();
        let hw = self.shared.hardware.lock().await;
        hw.cipher.stop(self.shared.config.fail_closed);
    }
}

impl Drop for HdcpSession {
    fn drop(&mut self) {
        // lets a worker stuck in the verification loop notice the closed channel
        self.shared.hotplug.deassert();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL: [SessionState; 4] = [Off, Unauthenticated, LinkVerify, Renegotiate];

    #[test]
    fn test_link_verify_only_from_unauthenticated() {
        for from in ALL {
            assert_eq!(from.can_transition_to(LinkVerify), from == Unauthenticated);
        }
    }

    #[test]
    fn test_every_state_can_be_disabled_and_renegotiated() {
        for from in ALL {
            assert!(from.can_transition_to(Off));
            assert!(from.can_transition_to(Renegotiate));
            assert!(from.can_transition_to(Unauthenticated));
        }
    }

    #[test]
    fn test_default_policy_is_on_demand() {
        assert_eq!(Policy::default(), Policy::OnDemand);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_wakes_on_deassert() {
        let signal = HotplugSignal::new();
        signal.assert();
        let waiter = signal.clone();
        let start = tokio::time::Instant::now();
        let task = tokio::spawn(async move {
            waiter
                .pause(Duration::from_secs(10), || waiter.is_plugged())
                .await
        });
        tokio::task::yield_now().await;
        sleep(Duration::from_millis(5)).await;
        signal.deassert();
        task.await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_pause_returns_when_stopped() {
        let signal = HotplugSignal::new();
        signal.pause(Duration::from_secs(3600), || false).await;
    }
}
