//! Typed access to the cipher engine registers.

use std::sync::Arc;
use std::time::Duration;

use hdcp_transport::{CipherEngine, CipherMode, EngineError, EngineReg, HdcpCtrl, BKSV_MSB_REPEATER};
use tracing::debug;

use crate::errors::HdcpError;
use crate::ksv::KSV_MASK;

/// Cipher engine with the HDCP register conventions applied: 64-bit values
/// split into MSB/LSB words, LSB written first, the MSB write being the
/// hardware trigger.
#[derive(Clone)]
pub struct Cipher {
    engine: Arc<dyn CipherEngine>,
}

impl Cipher {
    pub fn new(engine: Arc<dyn CipherEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &dyn CipherEngine {
        self.engine.as_ref()
    }

    pub fn ctrl(&self) -> HdcpCtrl {
        HdcpCtrl::from_bits_truncate(self.engine.read(EngineReg::Ctrl))
    }

    pub fn set_ctrl(&self, bits: HdcpCtrl) {
        self.engine.modify(EngineReg::Ctrl, 0, bits.bits());
    }

    pub fn clear_ctrl(&self, bits: HdcpCtrl) {
        self.engine.modify(EngineReg::Ctrl, bits.bits(), 0);
    }

    /// Wait for any of `bits`; a timeout becomes [`HdcpError::ProtocolTimeout`].
    pub async fn wait_ctrl(
        &self,
        bits: HdcpCtrl,
        timeout: Duration,
        condition: &'static str,
    ) -> Result<HdcpCtrl, HdcpError> {
        match self
            .engine
            .wait_for(EngineReg::Ctrl, bits.bits(), timeout)
            .await
        {
            Ok(value) => Ok(HdcpCtrl::from_bits_truncate(value)),
            Err(EngineError::Timeout { last, .. }) => {
                debug!(condition, ctrl = last, "engine wait timed out");
                Err(HdcpError::ProtocolTimeout { condition })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stop the engine. With `fail_closed`, encryption is switched off too.
    pub fn stop(&self, fail_closed: bool) {
        let mut clear = HdcpCtrl::RUN;
        if fail_closed {
            clear |= HdcpCtrl::CRYPT_ENABLED | HdcpCtrl::ONEONE_ENABLED;
        }
        self.clear_ctrl(clear);
    }

    fn read_pair(&self, msb: EngineReg, lsb: EngineReg) -> u64 {
        (u64::from(self.engine.read(msb)) << 32) | u64::from(self.engine.read(lsb))
    }

    fn write_pair(&self, msb: EngineReg, lsb: EngineReg, value: u64, msb_extra: u32) {
        self.engine.write(lsb, value as u32);
        self.engine.write(msb, ((value >> 32) as u32) | msb_extra);
    }

    pub fn an(&self) -> u64 {
        self.read_pair(EngineReg::AnMsb, EngineReg::AnLsb)
    }

    pub fn aksv(&self) -> u64 {
        self.read_pair(EngineReg::AksvMsb, EngineReg::AksvLsb) & KSV_MASK
    }

    /// The Bksv last committed to the engine.
    pub fn bksv(&self) -> u64 {
        self.read_pair(EngineReg::BksvMsb, EngineReg::BksvLsb) & KSV_MASK
    }

    pub fn write_bksv(&self, bksv: u64, repeater: bool) {
        let extra = if repeater { BKSV_MSB_REPEATER } else { 0 };
        self.write_pair(EngineReg::BksvMsb, EngineReg::BksvLsb, bksv & KSV_MASK, extra);
    }

    pub fn write_cn(&self, cn: u64) {
        self.write_pair(EngineReg::CnMsb, EngineReg::CnLsb, cn, 0);
    }

    /// Writing the Cksv MSB starts the S'/M' derivation.
    pub fn write_cksv(&self, cksv: u64) {
        self.write_pair(EngineReg::CksvMsb, EngineReg::CksvLsb, cksv & KSV_MASK, 0);
    }

    pub fn set_mode(&self, mode: CipherMode) {
        self.engine.write(EngineReg::Cmode, mode.bits());
    }

    pub fn ri(&self) -> u16 {
        self.engine.read(EngineReg::Ri) as u16
    }

    /// Packed link status and the 56-bit S'.
    pub fn sprime(&self) -> (u16, u64) {
        let msb = self.engine.read(EngineReg::SprimeMsb);
        let lsb2 = self.engine.read(EngineReg::SprimeLsb2);
        let lsb1 = self.engine.read(EngineReg::SprimeLsb1);
        let status = (((msb & 0xff) << 8) | (lsb2 >> 24)) as u16;
        let s_prime = (u64::from(lsb2 & 0x00ff_ffff) << 32) | u64::from(lsb1);
        (status, s_prime)
    }

    pub fn mprime(&self) -> u64 {
        self.read_pair(EngineReg::MprimeMsb, EngineReg::MprimeLsb)
    }

    pub fn cs(&self) -> u64 {
        self.read_pair(EngineReg::CsMsb, EngineReg::CsLsb)
    }
}
