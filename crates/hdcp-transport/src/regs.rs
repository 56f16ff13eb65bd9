//! Register vocabulary shared by the bus and cipher engine adapters.
//!
//! Receiver offsets follow the HDCP 1.x DDC port map. Cipher engine
//! registers are named, not addressed: the adapter owns the SoC layout.

use bitflags::bitflags;

/// Receiver (DDC) register offsets.
pub mod ddc {
    /// 7-bit I2C address of the HDCP receiver port.
    pub const HDCP_RX_ADDR: u16 = 0x3a;

    pub const BKSV: u8 = 0x00;
    pub const RI: u8 = 0x08;
    pub const PJ: u8 = 0x0a;
    pub const AKSV: u8 = 0x10;
    pub const AINFO: u8 = 0x15;
    pub const AN: u8 = 0x18;
    pub const V_PRIME: u8 = 0x20;
    pub const BCAPS: u8 = 0x40;
    pub const BSTATUS: u8 = 0x41;
    pub const KSV_FIFO: u8 = 0x43;

    /// Size of a key-selection vector on the wire.
    pub const KSV_LEN: usize = 5;
    /// Size of the V' hash (H0..H4).
    pub const V_PRIME_LEN: usize = 20;
}

bitflags! {
    /// Receiver capability byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Bcaps: u8 {
        const HDMI_RESERVED = 0x80;
        const REPEATER = 0x40;
        const READY = 0x20;
        const FAST = 0x10;
        const FEATURES_1_1 = 0x02;
        const FAST_REAUTH = 0x01;
    }
}

/// Ainfo bit enabling 1.1 features on the receiver.
pub const AINFO_ENABLE_1_1_FEATURES: u8 = 0x02;

/// Bstatus field helpers.
pub mod bstatus {
    pub const DEVICE_COUNT_MASK: u16 = 0x7f;
    pub const MAX_DEVS_EXCEEDED: u16 = 1 << 7;
    pub const DEPTH_SHIFT: u16 = 8;
    pub const DEPTH_MASK: u16 = 0x7;
    pub const MAX_CASCADE_EXCEEDED: u16 = 1 << 11;
    pub const HDMI_MODE: u16 = 1 << 12;

    pub fn device_count(bstatus: u16) -> u8 {
        (bstatus & DEVICE_COUNT_MASK) as u8
    }

    pub fn depth(bstatus: u16) -> u8 {
        ((bstatus >> DEPTH_SHIFT) & DEPTH_MASK) as u8
    }
}

/// Named cipher engine registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineReg {
    Ctrl,
    Cmode,
    AnMsb,
    AnLsb,
    AksvMsb,
    AksvLsb,
    BksvMsb,
    BksvLsb,
    CnMsb,
    CnLsb,
    CksvMsb,
    CksvLsb,
    Ri,
    CsMsb,
    CsLsb,
    SprimeMsb,
    SprimeLsb1,
    SprimeLsb2,
    MprimeMsb,
    MprimeLsb,
    KeyCtrl,
    KeyDebug0,
    KeySkeyIndex,
    KeyHdcpKey0,
    KeyHdcpKey1,
    KeyHdcpKey2,
    KeyHdcpKey3,
    KeyHdcpKeyTrig,
}

bitflags! {
    /// Cipher engine control/status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HdcpCtrl: u32 {
        const RUN = 1 << 0;
        const CRYPT_ENABLED = 1 << 1;
        const ONEONE_ENABLED = 1 << 3;
        const AN_VALID = 1 << 8;
        const R0_VALID = 1 << 9;
        const SPRIME_VALID = 1 << 10;
        const MPRIME_VALID = 1 << 11;
        const CS_SUPPORTED = 1 << 12;
        const SROM_ERR = 1 << 13;
    }
}

impl HdcpCtrl {
    /// Bits software may set; the rest are reported by the engine.
    pub const WRITABLE: HdcpCtrl = HdcpCtrl::RUN
        .union(HdcpCtrl::CRYPT_ENABLED)
        .union(HdcpCtrl::ONEONE_ENABLED);
}

bitflags! {
    /// Key table control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KeyCtrl: u32 {
        const LOCAL_KEYS = 1 << 0;
        const AUTOINC = 1 << 1;
        const WRITE16 = 1 << 4;
        const PKEY_RELOAD_TRIGGER = 1 << 5;
        const PKEY_LOADED = 1 << 6;
    }
}

/// Key debug register bit that stays set while key SRAM is being cleared.
pub const KEY_DEBUG0_SRAM_BUSY: u32 = 1 << 0;

/// Value written to the key trigger register to latch 128 key bits.
pub const KEY_TRIG_LOAD_HDCP_KEY: u32 = 0x100;

/// Bit in the Bksv MSB word telling the engine the receiver is a repeater.
pub const BKSV_MSB_REPEATER: u32 = 1 << 31;

/// Link selection for the cipher mode register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherMode {
    Tmds0Link0,
    Tmds0Link1,
}

impl CipherMode {
    const CUSTOMER_BIT: u32 = 1 << 8;

    /// Register value for this mode with the customer (downstream re-key) bit set.
    pub fn bits(self) -> u32 {
        let link = match self {
            CipherMode::Tmds0Link0 => 1 << 4,
            CipherMode::Tmds0Link1 => 2 << 4,
        };
        Self::CUSTOMER_BIT | link
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bstatus_fields() {
        let status = 0x0305u16;
        assert_eq!(bstatus::device_count(status), 5);
        assert_eq!(bstatus::depth(status), 3);
        assert_eq!(status & bstatus::MAX_DEVS_EXCEEDED, 0);
    }

    #[test]
    fn test_writable_ctrl_bits() {
        assert!(HdcpCtrl::WRITABLE.contains(HdcpCtrl::RUN));
        assert!(!HdcpCtrl::WRITABLE.contains(HdcpCtrl::AN_VALID));
    }

    #[test]
    fn test_cipher_modes_differ() {
        assert_ne!(CipherMode::Tmds0Link0.bits(), CipherMode::Tmds0Link1.bits());
    }
}
