//! Helpers for driving sessions against the simulated hardware.

use std::sync::Arc;
use std::time::Duration;

use hdcp_transport::testing::SimulatedLink;

use crate::config::HdcpConfig;
use crate::link::{LinkAdapters, LinkId};
use crate::session::{HdcpSession, SessionState};

/// Adapters backed by a simulated link.
pub fn simulated_adapters(link: &SimulatedLink) -> LinkAdapters {
    LinkAdapters::new(link.receiver.clone(), link.engine.clone(), link.keys.clone())
        .with_revocation(link.revocation.clone())
}

/// A session on `link`, in `Off`, with the receiver unplugged.
pub fn spawn_simulated(
    id: u32,
    link: &SimulatedLink,
    config: HdcpConfig,
) -> Arc<HdcpSession> {
    match HdcpSession::spawn(LinkId(id), simulated_adapters(link), config) {
        Ok(session) => Arc::new(session),
        Err(e) => panic!("simulated session config rejected: {e}"),
    }
}

/// Enable the session and plug the receiver in.
pub async fn plug_and_enable(session: &HdcpSession) {
    session.enable().await.expect("enable");
    session.set_plugged(true).await.expect("hotplug");
}

/// Wait until the session reaches `target`, up to `timeout`.
pub async fn wait_for_state(
    session: &HdcpSession,
    target: SessionState,
    timeout: Duration,
) -> bool {
    let mut rx = session.subscribe();
    tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

/// Poll `condition` every 10 ms until it holds, up to `timeout`.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(timeout, poll).await.is_ok()
}

/// Wait until `session` has recorded `count` failed attempts.
pub async fn wait_for_failures(session: &HdcpSession, count: u64, timeout: Duration) -> bool {
    wait_until(timeout, || session.status().failures >= count).await
}
