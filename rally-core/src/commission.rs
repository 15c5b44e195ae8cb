use serde::{Deserialize, Serialize};

use crate::booking::BookingKind;
use crate::{CoreError, CoreResult};

const BASIS_POINTS: i128 = 10_000;

/// Platform take for one booking kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommissionRate {
    /// Percentage of gross, in basis points (1500 = 15%).
    pub rate_bps: u32,

    /// Flat fee added on top of the percentage, in minor units.
    #[serde(default)]
    pub fixed_fee_minor: i64,
}

impl CommissionRate {
    pub const fn percent_bps(rate_bps: u32) -> Self {
        Self { rate_bps, fixed_fee_minor: 0 }
    }
}

/// Commission policy per booking kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommissionPolicy {
    pub single_session: CommissionRate,
    pub package: CommissionRate,
}

impl Default for CommissionPolicy {
    fn default() -> Self {
        Self {
            single_session: CommissionRate::percent_bps(1500),
            package: CommissionRate::percent_bps(1500),
        }
    }
}

/// Decomposition of a gross amount. `commission + provider_net == gross`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Commission {
    pub commission_minor: i64,
    pub provider_net_minor: i64,
}

impl Commission {
    pub fn gross_minor(&self) -> i64 {
        self.commission_minor + self.provider_net_minor
    }
}

impl CommissionPolicy {
    pub fn rate_for(&self, kind: BookingKind) -> CommissionRate {
        match kind {
            BookingKind::SingleSession => self.single_session,
            BookingKind::PackageInstallment => self.package,
        }
    }

    /// Splits `gross_minor` into platform commission and provider net.
    ///
    /// The percentage is rounded up, so the fractional remainder always lands
    /// on the commission and the provider's quoted net is the floor of its
    /// share. Commission is capped at gross.
    pub fn compute(&self, gross_minor: i64, kind: BookingKind) -> CoreResult<Commission> {
        if gross_minor < 0 {
            return Err(CoreError::ValidationError(format!(
                "gross amount must not be negative, got {}",
                gross_minor
            )));
        }

        let rate = self.rate_for(kind);
        let gross = gross_minor as i128;
        let percentage = (gross * rate.rate_bps as i128 + BASIS_POINTS - 1) / BASIS_POINTS;
        let fee = if gross == 0 { 0 } else { rate.fixed_fee_minor.max(0) as i128 };
        let commission = (percentage + fee).min(gross) as i64;

        Ok(Commission {
            commission_minor: commission,
            provider_net_minor: gross_minor - commission,
        })
    }
}

/// Splits `amount` into `parts` integer slices that sum to `amount`.
/// Earlier slices absorb the remainder one unit each.
pub fn split_evenly(amount: i64, parts: usize) -> Vec<i64> {
    if parts == 0 {
        return Vec::new();
    }
    let base = amount / parts as i64;
    let remainder = (amount % parts as i64) as usize;
    (0..parts)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifteen_percent_single_session() {
        let policy = CommissionPolicy::default();
        let split = policy.compute(12000, BookingKind::SingleSession).unwrap();
        assert_eq!(split.commission_minor, 1800);
        assert_eq!(split.provider_net_minor, 10200);
    }

    #[test]
    fn test_zero_gross() {
        let policy = CommissionPolicy {
            single_session: CommissionRate { rate_bps: 1500, fixed_fee_minor: 50 },
            package: CommissionRate::percent_bps(1000),
        };
        let split = policy.compute(0, BookingKind::SingleSession).unwrap();
        assert_eq!(split, Commission { commission_minor: 0, provider_net_minor: 0 });
    }

    #[test]
    fn test_split_is_exact_for_awkward_amounts() {
        let policy = CommissionPolicy {
            single_session: CommissionRate { rate_bps: 1250, fixed_fee_minor: 30 },
            package: CommissionRate::percent_bps(999),
        };

        for gross in [1, 7, 333, 9_999, 12_345, 1_000_000_007, i64::MAX / 2] {
            for kind in [BookingKind::SingleSession, BookingKind::PackageInstallment] {
                let split = policy.compute(gross, kind).unwrap();
                assert_eq!(split.commission_minor + split.provider_net_minor, gross);
                assert!(split.commission_minor >= 0);
                assert!(split.provider_net_minor >= 0);
            }
        }
    }

    #[test]
    fn test_remainder_goes_to_commission() {
        let policy = CommissionPolicy::default();
        // 15% of 1 is 0.15; the provider keeps the floor of 0.85.
        let split = policy.compute(1, BookingKind::SingleSession).unwrap();
        assert_eq!(split.commission_minor, 1);
        assert_eq!(split.provider_net_minor, 0);

        // 15% of 101 = 15.15
        let split = policy.compute(101, BookingKind::SingleSession).unwrap();
        assert_eq!(split.commission_minor, 16);
        assert_eq!(split.provider_net_minor, 85);
    }

    #[test]
    fn test_kind_selects_rate() {
        let policy = CommissionPolicy {
            single_session: CommissionRate::percent_bps(1500),
            package: CommissionRate::percent_bps(1000),
        };
        assert_eq!(policy.compute(10000, BookingKind::PackageInstallment).unwrap().commission_minor, 1000);
        assert_eq!(policy.compute(10000, BookingKind::SingleSession).unwrap().commission_minor, 1500);
    }

    #[test]
    fn test_fixed_fee_is_capped_at_gross() {
        let policy = CommissionPolicy {
            single_session: CommissionRate { rate_bps: 0, fixed_fee_minor: 500 },
            package: CommissionRate::percent_bps(0),
        };
        let split = policy.compute(300, BookingKind::SingleSession).unwrap();
        assert_eq!(split.commission_minor, 300);
        assert_eq!(split.provider_net_minor, 0);
    }

    #[test]
    fn test_negative_gross_rejected() {
        assert!(CommissionPolicy::default().compute(-1, BookingKind::SingleSession).is_err());
    }

    #[test]
    fn test_split_evenly() {
        assert_eq!(split_evenly(8500, 10), vec![850; 10]);
        assert_eq!(split_evenly(10, 3), vec![4, 3, 3]);
        assert_eq!(split_evenly(10, 3).iter().sum::<i64>(), 10);
        assert!(split_evenly(10, 0).is_empty());
    }
}
