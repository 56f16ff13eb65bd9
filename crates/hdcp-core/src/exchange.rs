//! Derived-value packet exchange with a cooperating peer.
//!
//! The peer supplies its Cn and Cksv; the engine derives S' (with the link
//! status) or M' from them. The caller's packet carries inputs and outputs.

use bitflags::bitflags;
use hdcp_transport::{ddc, CipherMode, HdcpCtrl};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::HdcpConfig;
use crate::errors::{HdcpError, KsvSource};
use crate::ksv;
use crate::link::{LinkHardware, LinkSnapshot};

/// Link mode used for both derived-value requests.
pub const EXCHANGE_MODE: CipherMode = CipherMode::Tmds0Link0;

bitflags! {
    /// Which packet fields are populated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ValueFlags: u32 {
        const CN = 1 << 0;
        const CKSV = 1 << 1;
        const AN = 1 << 2;
        const AKSV = 1 << 3;
        const BKSV = 1 << 4;
        const BSTATUS = 1 << 5;
        const BKSV_LIST = 1 << 6;
        const V_PRIME = 1 << 7;
        const CACHED_AKSV = 1 << 8;
        const STATUS = 1 << 9;
        const CS = 1 << 10;
        const M_PRIME = 1 << 11;
    }
}

impl ValueFlags {
    /// Inputs every request must carry.
    pub const REQUIRED_INPUTS: ValueFlags = ValueFlags::CN.union(ValueFlags::CKSV);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum PacketResult {
    Success = 0,
    Unsuccessful = 1,
    #[default]
    Pending = 0x103,
    LinkFailed = 0xc000_0013,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExchangePacket {
    pub value_flags: ValueFlags,
    pub result: PacketResult,

    // Inputs
    pub c_n: u64,
    pub c_ksv: u64,

    // Outputs
    pub a_n: u64,
    pub a_ksv: u64,
    pub b_ksv: u64,
    pub cached_a_ksv: u64,
    pub hdcp_status: u16,
    pub s_prime: u64,
    pub cs: u64,
    pub m_prime: u64,
    pub bstatus: u16,
    pub bksv_list: Vec<u64>,
    pub v_prime: [u8; ddc::V_PRIME_LEN],
}

impl ExchangePacket {
    /// A request carrying the peer's Cn and Cksv.
    pub fn request(c_n: u64, c_ksv: u64) -> Self {
        Self {
            value_flags: ValueFlags::REQUIRED_INPUTS,
            c_n,
            c_ksv,
            ..Default::default()
        }
    }

    fn clear_outputs(&mut self) {
        *self = Self {
            value_flags: self.value_flags & ValueFlags::REQUIRED_INPUTS,
            result: self.result,
            c_n: self.c_n,
            c_ksv: self.c_ksv,
            ..Default::default()
        };
    }

    fn require_inputs(&self) -> Result<(), HdcpError> {
        let missing = ValueFlags::REQUIRED_INPUTS.difference(self.value_flags);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(HdcpError::MissingValues { missing })
        }
    }

    fn finish(&mut self, outcome: Result<(), HdcpError>) -> Result<(), HdcpError> {
        match outcome {
            Ok(()) => {
                self.result = PacketResult::Success;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "derived value request failed");
                self.clear_outputs();
                self.result = PacketResult::Unsuccessful;
                Err(e)
            }
        }
    }
}

fn write_inputs(hw: &LinkHardware, packet: &ExchangePacket) {
    hw.cipher.write_cn(packet.c_n);
    hw.cipher.set_mode(EXCHANGE_MODE);
    hw.cipher.write_cksv(packet.c_ksv);
}

fn committed_bksv(hw: &LinkHardware) -> Result<u64, HdcpError> {
    ksv::check(hw.cipher.bksv(), KsvSource::Receiver)
}

/// S' and link status for the current link.
pub(crate) async fn derived_status(
    hw: &LinkHardware,
    config: &HdcpConfig,
    snapshot: Option<&LinkSnapshot>,
    packet: &mut ExchangePacket,
) -> Result<(), HdcpError> {
    packet.result = PacketResult::Pending;
    let outcome = fill_status(hw, config, snapshot, packet).await;
    packet.finish(outcome)
}

async fn fill_status(
    hw: &LinkHardware,
    config: &HdcpConfig,
    snapshot: Option<&LinkSnapshot>,
    packet: &mut ExchangePacket,
) -> Result<(), HdcpError> {
    packet.require_inputs()?;
    write_inputs(hw, packet);
    let ctrl = hw
        .cipher
        .wait_ctrl(HdcpCtrl::SPRIME_VALID, config.exchange_timeout(), "S' valid")
        .await?;
    sleep(config.sprime_settle()).await;

    let (status, s_prime) = hw.cipher.sprime();
    packet.hdcp_status = status;
    packet.s_prime = s_prime;
    packet.value_flags |= ValueFlags::STATUS;
    if ctrl.contains(HdcpCtrl::CS_SUPPORTED) {
        packet.cs = hw.cipher.cs();
        packet.value_flags |= ValueFlags::CS;
    }

    packet.a_n = hw.cipher.an();
    packet.a_ksv = hw.cipher.aksv();
    packet.b_ksv = committed_bksv(hw)?;
    packet.value_flags |= ValueFlags::AN | ValueFlags::AKSV | ValueFlags::BKSV;

    if let Some(snapshot) = snapshot {
        packet.cached_a_ksv = snapshot.a_ksv;
        packet.value_flags |= ValueFlags::CACHED_AKSV;
    }
    debug!(status, "derived status ready");
    Ok(())
}

/// M' for an authenticated link. `snapshot` is `None` when the link is not
/// in `LinkVerify`, which yields [`PacketResult::LinkFailed`] without
/// touching the engine.
pub(crate) async fn derived_secret(
    hw: &LinkHardware,
    config: &HdcpConfig,
    snapshot: Option<&LinkSnapshot>,
    packet: &mut ExchangePacket,
) -> Result<(), HdcpError> {
    let Some(snapshot) = snapshot else {
        packet.clear_outputs();
        packet.result = PacketResult::LinkFailed;
        return Ok(());
    };
    packet.result = PacketResult::Pending;
    let outcome = fill_secret(hw, config, snapshot, packet).await;
    packet.finish(outcome)
}

async fn fill_secret(
    hw: &LinkHardware,
    config: &HdcpConfig,
    snapshot: &LinkSnapshot,
    packet: &mut ExchangePacket,
) -> Result<(), HdcpError> {
    packet.require_inputs()?;
    write_inputs(hw, packet);
    hw.cipher
        .wait_ctrl(HdcpCtrl::MPRIME_VALID, config.exchange_timeout(), "M' valid")
        .await?;

    packet.m_prime = hw.cipher.mprime();
    packet.b_ksv = committed_bksv(hw)?;
    packet.a_n = hw.cipher.an();
    packet.a_ksv = hw.cipher.aksv();
    packet.value_flags |=
        ValueFlags::AN | ValueFlags::AKSV | ValueFlags::BKSV | ValueFlags::M_PRIME;

    if let Some(topology) = &snapshot.repeater {
        packet.bstatus = topology.bstatus;
        packet.bksv_list = topology.ksv_list.clone();
        packet.v_prime = topology.v_prime;
        packet.value_flags |= ValueFlags::BSTATUS | ValueFlags::BKSV_LIST | ValueFlags::V_PRIME;
    }
    Ok(())
}
