//! Ri / Ri' link verification.

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::config::HdcpConfig;
use crate::errors::HdcpError;
use crate::link::LinkHardware;

/// One local/receiver Ri pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RiSample {
    pub local: u16,
    pub remote: u16,
}

/// Compare the local Ri with the receiver's Ri'.
///
/// With `wait_ri`, up to `ri_attempts` rounds are made while the local Ri
/// rolls over between reads or the Ri' read fails on the bus. If the last
/// round could not read Ri', its transport error is returned. Without
/// `wait_ri`, exactly one round. A zero Ri' or local Ri fails at once.
pub(crate) async fn verify_link(
    hw: &LinkHardware,
    config: &HdcpConfig,
    wait_ri: bool,
) -> Result<u16, HdcpError> {
    let attempts = if wait_ri { config.ri_attempts.max(1) } else { 1 };
    let mut round = 0;
    let mut tx: u16 = 0;
    let mut rx: u16 = 0;
    let mut read_error: Option<HdcpError> = None;
    loop {
        round += 1;
        let old = hw.cipher.ri();
        match hw.port.read_ri().await {
            Ok(0) => return Err(HdcpError::ZeroVerification),
            Ok(remote) => {
                rx = remote;
                tx = hw.cipher.ri();
                read_error = None;
                if tx == 0 {
                    return Err(HdcpError::ZeroVerification);
                }
            }
            Err(HdcpError::LinkLost) => return Err(HdcpError::LinkLost),
            Err(e) => {
                debug!(error = %e, round, "Ri' read failed");
                tx = hw.cipher.ri();
                read_error = Some(e);
            }
        }
        trace!(round, old, tx, rx, failed = read_error.is_some(), "ri round");
        let retry = read_error.is_some() || old != tx;
        if !(wait_ri && round < attempts && retry) {
            break;
        }
        if read_error.is_some() {
            sleep(config.ri_retry_delay()).await;
        }
    }

    hw.port.ensure_plugged()?;
    if let Some(e) = read_error {
        return Err(e);
    }
    if rx != tx {
        return Err(HdcpError::VerificationMismatch {
            local: tx,
            remote: rx,
        });
    }
    Ok(tx)
}

/// Read `count` Ri pairs back to back.
pub(crate) async fn sample_stream(
    hw: &LinkHardware,
    count: usize,
) -> Result<Vec<RiSample>, HdcpError> {
    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        hw.port.ensure_plugged()?;
        let local = hw.cipher.ri();
        let remote = hw.port.read_ri().await?;
        samples.push(RiSample { local, remote });
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use hdcp_transport::ddc;
    use hdcp_transport::testing::SimulatedLink;

    use super::*;
    use crate::harness::simulated_adapters;

    fn hardware(link: &SimulatedLink, config: &HdcpConfig) -> LinkHardware {
        LinkHardware::attach(
            simulated_adapters(link),
            Arc::new(AtomicBool::new(true)),
            config,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollover_is_read_again() {
        let link = SimulatedLink::new(40);
        let config = HdcpConfig::default();
        let hw = hardware(&link, &config);
        // local Ri moves from A to B while Ri' is on the bus
        link.engine.set_ri_sequence([0x1111, 0x2222, 0x2222, 0x2222]);
        link.receiver.set_ri_sequence([0x1111, 0x2222]);

        assert_eq!(verify_link(&hw, &config, true).await.unwrap(), 0x2222);
        assert_eq!(link.log.bus_reads(ddc::RI), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_shot_does_not_retry() {
        let link = SimulatedLink::new(41);
        let config = HdcpConfig::default();
        let hw = hardware(&link, &config);
        link.engine.set_ri_sequence([0x1111, 0x2222, 0x2222, 0x2222]);
        link.receiver.set_ri_sequence([0x1111, 0x2222]);

        let err = verify_link(&hw, &config, false).await.unwrap_err();
        assert!(matches!(
            err,
            HdcpError::VerificationMismatch {
                local: 0x2222,
                remote: 0x1111
            }
        ));
        assert_eq!(link.log.bus_reads(ddc::RI), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_read_recovers_next_round() {
        let link = SimulatedLink::new(42);
        let config = HdcpConfig::default();
        let hw = hardware(&link, &config);
        link.engine.set_ri_override(Some(0x3333));
        link.receiver.set_ri_override(Some(0x3333));
        link.receiver.fail_reads(ddc::RI, config.bus_attempts);

        assert_eq!(verify_link(&hw, &config, true).await.unwrap(), 0x3333);
        assert_eq!(
            link.log.bus_reads(ddc::RI),
            config.bus_attempts as usize + 1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_receiver_is_a_transport_error() {
        let link = SimulatedLink::new(43);
        let config = HdcpConfig::default();
        let hw = hardware(&link, &config);
        link.engine.set_ri_override(Some(0x151f));
        link.receiver.set_connected(false);

        let err = verify_link(&hw, &config, true).await.unwrap_err();
        assert!(matches!(err, HdcpError::Transport(_)), "{err}");
        assert!(err.to_string().starts_with("transport error"));
        assert_eq!(
            link.log.bus_reads(ddc::RI),
            (config.bus_attempts * config.ri_attempts) as usize
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_shot_read_failure_is_not_retried() {
        let link = SimulatedLink::new(44);
        let config = HdcpConfig::default();
        let hw = hardware(&link, &config);
        link.engine.set_ri_override(Some(0x3333));
        link.receiver.set_ri_override(Some(0x3333));
        link.receiver.fail_reads(ddc::RI, config.bus_attempts);

        let err = verify_link(&hw, &config, false).await.unwrap_err();
        assert!(matches!(err, HdcpError::Transport(_)));
        assert_eq!(link.log.bus_reads(ddc::RI), config.bus_attempts as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_local_ri_fails_at_once() {
        let link = SimulatedLink::new(45);
        let config = HdcpConfig::default();
        let hw = hardware(&link, &config);
        link.engine.set_ri_override(Some(0));
        link.receiver.set_ri_override(Some(0x3333));

        let err = verify_link(&hw, &config, true).await.unwrap_err();
        assert!(matches!(err, HdcpError::ZeroVerification));
        assert!(err.to_string().contains("all-zero"));
        assert_eq!(link.log.bus_reads(ddc::RI), 1);
    }
}
