//! Key-selection vector (KSV) checks.
//!
//! A KSV is a 40-bit value with exactly 20 bits set. Anything else is a
//! protocol violation by whichever side produced it.

use crate::errors::{HdcpError, KsvSource};
use hdcp_transport::{ddc, RevocationList};

pub const KSV_BITS: u32 = 40;
pub const KSV_MASK: u64 = (1 << KSV_BITS) - 1;
pub const KSV_WEIGHT: u32 = 20;

/// Exactly 20 of the low 40 bits set, nothing above.
pub fn is_well_formed(ksv: u64) -> bool {
    ksv & !KSV_MASK == 0 && ksv.count_ones() == KSV_WEIGHT
}

/// Check well-formedness, returning the KSV unchanged.
pub fn check(ksv: u64, origin: KsvSource) -> Result<u64, HdcpError> {
    if is_well_formed(ksv) {
        Ok(ksv)
    } else {
        Err(HdcpError::MalformedKeyVector { origin, ksv })
    }
}

/// Structural check followed by the revocation lookup.
pub fn check_not_revoked(
    ksv: u64,
    origin: KsvSource,
    revocation: &dyn RevocationList,
) -> Result<u64, HdcpError> {
    check(ksv, origin)?;
    if revocation.is_revoked(ksv) {
        return Err(HdcpError::Revoked { ksv });
    }
    Ok(ksv)
}

pub fn from_le_bytes(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(ddc::KSV_LEN)
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (8 * i)))
}

pub fn to_le_bytes(ksv: u64) -> [u8; ddc::KSV_LEN] {
    let mut out = [0u8; ddc::KSV_LEN];
    out.copy_from_slice(&ksv.to_le_bytes()[..ddc::KSV_LEN]);
    out
}

/// Big-endian hex, as KSVs are usually printed.
pub fn to_hex(ksv: u64) -> String {
    hex::encode(&ksv.to_be_bytes()[3..])
}

/// Split a packed KSV list into individual vectors.
pub fn parse_list(bytes: &[u8]) -> Vec<u64> {
    bytes.chunks_exact(ddc::KSV_LEN).map(from_le_bytes).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdcp_transport::testing::RevocationSet;
    use proptest::prelude::*;

    #[test]
    fn test_concrete_cases() {
        assert!(!is_well_formed(0x00_0000_0000));
        assert!(!is_well_formed(0xff_ffff_ffff));
        assert!(is_well_formed(0x00_000f_ffff));
        assert!(is_well_formed(0xaa_aaaa_aaaa));
        // 20 bits set, but one of them above bit 39
        assert!(!is_well_formed((1 << 40) | 0x00_0007_ffff));
    }

    #[test]
    fn test_byte_order() {
        let ksv = 0x12_3456_789a;
        assert_eq!(to_le_bytes(ksv), [0x9a, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(from_le_bytes(&to_le_bytes(ksv)), ksv);
        assert_eq!(to_hex(ksv), "123456789a");
    }

    #[test]
    fn test_parse_list() {
        let mut bytes = to_le_bytes(0x00_000f_ffff).to_vec();
        bytes.extend_from_slice(&to_le_bytes(0xaa_aaaa_aaaa));
        assert_eq!(parse_list(&bytes), vec![0x00_000f_ffff, 0xaa_aaaa_aaaa]);
    }

    #[test]
    fn test_revoked_after_structural_check() {
        let revoked = RevocationSet::new();
        revoked.revoke(0xaa_aaaa_aaaa);
        assert_eq!(
            check_not_revoked(0xaa_aaaa_aaaa, KsvSource::Downstream, &revoked),
            Err(HdcpError::Revoked { ksv: 0xaa_aaaa_aaaa })
        );
        assert!(matches!(
            check_not_revoked(0, KsvSource::Downstream, &revoked),
            Err(HdcpError::MalformedKeyVector { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_well_formed_iff_twenty_of_forty(ksv in any::<u64>()) {
            let expected = ksv >> 40 == 0 && ksv.count_ones() == 20;
            prop_assert_eq!(is_well_formed(ksv), expected);
        }

        #[test]
        fn prop_forty_bit_values(ksv in 0u64..(1 << 40)) {
            prop_assert_eq!(is_well_formed(ksv), ksv.count_ones() == 20);
        }
    }
}
