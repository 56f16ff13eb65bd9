//! Register write ordering across receiver kinds and capability bits.

use std::time::Duration;

use hdcp_core::harness::{plug_and_enable, spawn_simulated, wait_for_state};
use hdcp_core::{ExchangePacket, HdcpConfig, SessionState};
use hdcp_transport::testing::{ksv_from_seed, EngineProfile, HwEvent, ReceiverProfile, SimulatedLink};
use hdcp_transport::{ddc, Bcaps, EngineReg};
use proptest::prelude::*;

fn bus_write_at(events: &[HwEvent], offset: u8) -> Option<usize> {
    events
        .iter()
        .position(|e| matches!(e, HwEvent::BusWrite { offset: o, .. } if *o == offset))
}

fn engine_write_at(events: &[HwEvent], reg: EngineReg) -> Option<usize> {
    events
        .iter()
        .position(|e| matches!(e, HwEvent::EngineWrite { reg: r, .. } if *r == reg))
}

fn run_handshake(seed: u64, devices: Option<u8>, features_1_1: bool) -> Vec<HwEvent> {
    let mut receiver = match devices {
        Some(n) => ReceiverProfile::repeater(seed, n),
        None => ReceiverProfile::sink(seed),
    };
    receiver.bcaps.set(Bcaps::FEATURES_1_1, features_1_1);
    let link = SimulatedLink::with_profiles(seed, receiver, EngineProfile::healthy(seed));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("runtime");
    runtime.block_on(async {
        let session = spawn_simulated(0, &link, HdcpConfig::default());
        plug_and_enable(&session).await;
        assert!(wait_for_state(&session, SessionState::LinkVerify, Duration::from_secs(30)).await);

        let mut packet = ExchangePacket::request(seed | 1, ksv_from_seed(seed ^ 0xface));
        session.get_derived_status(&mut packet).await.expect("derived status");
        session.shutdown().await;
    });
    link.log.events()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn handshake_writes_are_ordered(
        seed in any::<u64>(),
        devices in proptest::option::of(0u8..6),
        features_1_1 in any::<bool>(),
    ) {
        let events = run_handshake(seed, devices, features_1_1);

        let ainfo = bus_write_at(&events, ddc::AINFO).expect("Ainfo written");
        let an = bus_write_at(&events, ddc::AN).expect("An written");
        let aksv = bus_write_at(&events, ddc::AKSV).expect("Aksv written");
        prop_assert!(ainfo < an && an < aksv);

        for (lsb, msb) in [
            (EngineReg::BksvLsb, EngineReg::BksvMsb),
            (EngineReg::CnLsb, EngineReg::CnMsb),
            (EngineReg::CksvLsb, EngineReg::CksvMsb),
        ] {
            let lsb_at = engine_write_at(&events, lsb).expect("lsb written");
            let msb_at = engine_write_at(&events, msb).expect("msb written");
            prop_assert!(lsb_at < msb_at, "{:?} after {:?}", lsb, msb);
        }

        // Bksv is read from the receiver before it is handed to the engine
        let bksv_read = events
            .iter()
            .position(|e| matches!(e, HwEvent::BusRead { offset: ddc::BKSV, .. }))
            .expect("Bksv read");
        prop_assert!(aksv < bksv_read);
        prop_assert!(bksv_read < engine_write_at(&events, EngineReg::BksvLsb).unwrap());
    }
}
