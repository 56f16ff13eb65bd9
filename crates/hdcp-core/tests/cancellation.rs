//! Unplugging at each handshake checkpoint never yields an authenticated link.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use hdcp_core::harness::{plug_and_enable, spawn_simulated, wait_until};
use hdcp_core::{HdcpConfig, SessionState};
use hdcp_transport::testing::{HwEvent, SimulatedLink};
use hdcp_transport::{ddc, EngineReg, HdcpCtrl};

async fn unplug_on_access(seed: u64, offset: u8) {
    let link = SimulatedLink::new(seed);
    let session = spawn_simulated(0, &link, HdcpConfig::default());
    let signal = session.hotplug_signal();
    link.receiver.on_access(offset, move || signal.deassert());

    plug_and_enable(&session).await;
    assert!(
        wait_until(Duration::from_secs(30), || session.status().attempts == 1).await,
        "offset {offset:#04x}: no attempt"
    );
    session.set_plugged(false).await.unwrap();

    let status = session.status();
    assert_eq!(status.state, SessionState::Unauthenticated, "offset {offset:#04x}");
    assert_eq!(status.failures, 0, "unplug is not a failure");
    assert_eq!(status.verifications, 0);
    assert!(session.snapshot().is_none());
    // encryption was never switched on
    assert_eq!(
        link.log.position(|e| matches!(
            e,
            HwEvent::EngineWrite { reg: EngineReg::Ctrl, value }
                if value & HdcpCtrl::CRYPT_ENABLED.bits() != 0
        )),
        None,
        "offset {offset:#04x}"
    );
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unplug_after_bcaps() {
    unplug_on_access(1, ddc::BCAPS).await;
}

#[tokio::test(start_paused = true)]
async fn test_unplug_at_ainfo_write() {
    unplug_on_access(2, ddc::AINFO).await;
}

#[tokio::test(start_paused = true)]
async fn test_unplug_at_an_write() {
    unplug_on_access(3, ddc::AN).await;
}

#[tokio::test(start_paused = true)]
async fn test_unplug_at_aksv_write() {
    unplug_on_access(4, ddc::AKSV).await;
}

#[tokio::test(start_paused = true)]
async fn test_unplug_at_bksv_read() {
    unplug_on_access(5, ddc::BKSV).await;
}

#[tokio::test(start_paused = true)]
async fn test_unplug_at_first_ri_read() {
    unplug_on_access(6, ddc::RI).await;
}

#[tokio::test(start_paused = true)]
async fn test_disable_mid_handshake_returns_after_drain() {
    let link = SimulatedLink::new(7);
    let session = spawn_simulated(0, &link, HdcpConfig::default());
    let disabling = Arc::new(Mutex::new(None));

    // disable from another task while the worker is writing Aksv
    let slot = disabling.clone();
    let target = session.clone();
    link.receiver.on_access(ddc::AKSV, move || {
        let task = tokio::spawn(async move { target.disable().await });
        *slot.lock() = Some(task);
    });

    plug_and_enable(&session).await;
    assert!(wait_until(Duration::from_secs(30), || disabling.lock().is_some()).await);
    let task = disabling.lock().take().unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(session.state(), SessionState::Off);
    assert!(session.snapshot().is_none());
    assert_eq!(session.status().failures, 0);
    // the handshake stopped at the first checkpoint after disable ran
    assert_eq!(link.log.bus_reads(ddc::RI), 0);
    assert!(!link.engine.ctrl().contains(HdcpCtrl::RUN));

    let events = link.log.events().len();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(link.log.events().len(), events);
    session.shutdown().await;
}
