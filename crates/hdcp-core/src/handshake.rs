//! The authentication handshake.
//!
//! Runs on the session worker with the link hardware locked. Every step
//! either completes or aborts the attempt; nothing is published until the
//! last step succeeds. The receiver being unplugged is checked before and
//! after each blocking step, and on every bus retry.

use hdcp_transport::{bstatus, ddc, Bcaps, HdcpCtrl, AINFO_ENABLE_1_1_FEATURES};
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::HdcpConfig;
use crate::errors::{HdcpError, KsvSource};
use crate::ksv;
use crate::link::{LinkHardware, LinkSnapshot, RepeaterTopology};
use crate::verify::verify_link;

/// Run one authentication attempt. On error the caller stops the engine.
pub(crate) async fn authenticate(
    hw: &LinkHardware,
    config: &HdcpConfig,
) -> Result<LinkSnapshot, HdcpError> {
    hw.port.ensure_plugged()?;

    let bcaps = read_bcaps(hw, config).await?;
    let repeater = bcaps.contains(Bcaps::REPEATER);
    let features_1_1 = bcaps.contains(Bcaps::FEATURES_1_1);
    debug!(bcaps = bcaps.bits(), repeater, "receiver capabilities");

    // a previous attempt may have left the engine running
    hw.cipher.stop(true);
    hw.keys.load(&hw.cipher, repeater).await?;
    hw.port.ensure_plugged()?;

    hw.cipher.set_ctrl(HdcpCtrl::RUN);
    let ctrl = hw
        .cipher
        .wait_ctrl(
            HdcpCtrl::AN_VALID | HdcpCtrl::SROM_ERR,
            config.engine_timeout(),
            "An/Aksv valid",
        )
        .await?;
    if ctrl.contains(HdcpCtrl::SROM_ERR) {
        return Err(HdcpError::KeyTableIntegrity);
    }
    sleep(config.an_settle()).await;
    hw.port.ensure_plugged()?;

    let a_n = hw.cipher.an();
    let a_ksv = ksv::check(hw.cipher.aksv(), KsvSource::Local)?;
    debug!(an = %hex::encode(a_n.to_be_bytes()), aksv = %ksv::to_hex(a_ksv), "local values");

    let ainfo = if features_1_1 {
        AINFO_ENABLE_1_1_FEATURES
    } else {
        0
    };
    hw.port.write(ddc::AINFO, &[ainfo]).await?;
    hw.port.write(ddc::AN, &a_n.to_le_bytes()).await?;
    hw.port.write(ddc::AKSV, &ksv::to_le_bytes(a_ksv)).await?;

    hw.port.ensure_plugged()?;

    let b_ksv = ksv::check_not_revoked(
        hw.port.read_ksv(ddc::BKSV).await?,
        KsvSource::Receiver,
        hw.revocation.as_ref(),
    )?;
    debug!(bksv = %ksv::to_hex(b_ksv), "receiver key-selection vector");

    hw.cipher.write_bksv(b_ksv, repeater);
    hw.cipher
        .wait_ctrl(HdcpCtrl::R0_VALID, config.engine_timeout(), "R0 valid")
        .await?;

    // Ri' is undefined until the receiver has had time to compute R0'
    sleep(config.r0_settle()).await;
    hw.port.ensure_plugged()?;

    verify_link(hw, config, false).await?;

    let mut crypt = HdcpCtrl::CRYPT_ENABLED;
    if features_1_1 {
        crypt |= HdcpCtrl::ONEONE_ENABLED;
    }
    hw.cipher.set_ctrl(crypt);

    let topology = if repeater {
        Some(read_topology(hw, config).await?)
    } else {
        None
    };
    hw.port.ensure_plugged()?;

    Ok(LinkSnapshot {
        a_n,
        a_ksv,
        b_ksv,
        bcaps,
        repeater: topology,
        authenticated_at: Instant::now(),
    })
}

async fn read_bcaps(hw: &LinkHardware, config: &HdcpConfig) -> Result<Bcaps, HdcpError> {
    let raw = config
        .bcaps_retry()
        .run(
            move || async move { hw.port.read_u8(ddc::BCAPS).await },
            |e: &HdcpError| !matches!(e, HdcpError::LinkLost),
        )
        .await?;
    Ok(Bcaps::from_bits_retain(raw))
}

/// Wait for the repeater to assemble its KSV list, then read and check it.
async fn read_topology(
    hw: &LinkHardware,
    config: &HdcpConfig,
) -> Result<RepeaterTopology, HdcpError> {
    let deadline = Instant::now() + config.repeater_ready_timeout();
    loop {
        hw.port.ensure_plugged()?;
        let bcaps = Bcaps::from_bits_retain(hw.port.read_u8(ddc::BCAPS).await?);
        if bcaps.contains(Bcaps::READY) {
            break;
        }
        if Instant::now() >= deadline {
            return Err(HdcpError::ProtocolTimeout {
                condition: "repeater ready",
            });
        }
        sleep(config.ready_poll()).await;
    }

    let status = hw.port.read_u16(ddc::BSTATUS).await?;
    let device_count = bstatus::device_count(status);
    let depth = bstatus::depth(status);
    debug!(bstatus = status, device_count, depth, "repeater status");
    if status & (bstatus::MAX_DEVS_EXCEEDED | bstatus::MAX_CASCADE_EXCEEDED) != 0
        || device_count > config.max_downstream_devices
    {
        return Err(HdcpError::TopologyExceeded { bstatus: status });
    }

    let ksv_list = if device_count > 0 {
        let bytes = hw
            .port
            .read(ddc::KSV_FIFO, usize::from(device_count) * ddc::KSV_LEN)
            .await?;
        ksv::parse_list(&bytes)
    } else {
        Vec::new()
    };
    for downstream in &ksv_list {
        ksv::check_not_revoked(*downstream, KsvSource::Downstream, hw.revocation.as_ref())?;
    }

    let mut v_prime = [0u8; ddc::V_PRIME_LEN];
    v_prime.copy_from_slice(&hw.port.read(ddc::V_PRIME, ddc::V_PRIME_LEN).await?);

    Ok(RepeaterTopology {
        bstatus: status,
        device_count,
        depth,
        ksv_list,
        v_prime,
    })
}
