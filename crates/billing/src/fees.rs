//! Fee and commission calculation
//!
//! Pure functions over integer cents. Every output value is rounded exactly
//! once, half-to-even, from the exact rational product; intermediate steps are
//! never rounded.

use coachpay_shared::{PaymentMethod, PaymentType};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Basis points in 100%
pub const BPS_DENOMINATOR: i64 = 10_000;

/// Processing fee charged by one payment rail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodFee {
    /// Percentage of the amount, in basis points
    pub percent_bps: i64,
    /// Flat fee per transaction
    pub fixed_cents: i64,
}

impl MethodFee {
    pub const fn new(percent_bps: i64, fixed_cents: i64) -> Self {
        Self {
            percent_bps,
            fixed_cents,
        }
    }
}

/// Per-rail processing fees plus the platform service fee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub apple_iap: MethodFee,
    pub google_play: MethodFee,
    pub card: MethodFee,
    pub paypal: MethodFee,
    pub service_fee_bps: i64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            apple_iap: MethodFee::new(3000, 0),
            google_play: MethodFee::new(1500, 0),
            card: MethodFee::new(290, 30),
            paypal: MethodFee::new(349, 49),
            service_fee_bps: 200,
        }
    }
}

impl FeeSchedule {
    /// Load from environment, falling back to defaults per value.
    ///
    /// Variables: `FEE_APPLE_BPS`, `FEE_GOOGLE_BPS`, `FEE_CARD_BPS`,
    /// `FEE_CARD_FIXED_CENTS`, `FEE_PAYPAL_BPS`, `FEE_PAYPAL_FIXED_CENTS`,
    /// `SERVICE_FEE_BPS`.
    pub fn from_env() -> BillingResult<Self> {
        let d = Self::default();
        let schedule = Self {
            apple_iap: MethodFee::new(env_i64("FEE_APPLE_BPS", d.apple_iap.percent_bps)?, 0),
            google_play: MethodFee::new(env_i64("FEE_GOOGLE_BPS", d.google_play.percent_bps)?, 0),
            card: MethodFee::new(
                env_i64("FEE_CARD_BPS", d.card.percent_bps)?,
                env_i64("FEE_CARD_FIXED_CENTS", d.card.fixed_cents)?,
            ),
            paypal: MethodFee::new(
                env_i64("FEE_PAYPAL_BPS", d.paypal.percent_bps)?,
                env_i64("FEE_PAYPAL_FIXED_CENTS", d.paypal.fixed_cents)?,
            ),
            service_fee_bps: env_i64("SERVICE_FEE_BPS", d.service_fee_bps)?,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn fee_for(&self, method: PaymentMethod) -> MethodFee {
        match method {
            PaymentMethod::AppleIap => self.apple_iap,
            PaymentMethod::GooglePlay => self.google_play,
            PaymentMethod::Card => self.card,
            PaymentMethod::Paypal => self.paypal,
        }
    }

    fn validate(&self) -> BillingResult<()> {
        let rates = [
            self.apple_iap,
            self.google_play,
            self.card,
            self.paypal,
            MethodFee::new(self.service_fee_bps, 0),
        ];
        for fee in rates {
            if !(0..=BPS_DENOMINATOR).contains(&fee.percent_bps) || fee.fixed_cents < 0 {
                return Err(BillingError::Config(format!(
                    "Fee out of range: {} bps + {} cents",
                    fee.percent_bps, fee.fixed_cents
                )));
            }
        }
        Ok(())
    }
}

fn env_i64(key: &str, default: i64) -> BillingResult<i64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} must be an integer, got {:?}", key, raw))),
        Err(_) => Ok(default),
    }
}

/// Computed split for one payment, stored denormalized on the payment row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub platform_fee_cents: i64,
    pub service_fee_cents: i64,
    pub net_amount_cents: i64,
    pub platform_commission_cents: i64,
    pub payee_earnings_cents: i64,
}

/// Calculate fees, net and (optionally) the commission split.
///
/// `commission_rate_bps` is the platform's share of a client payment to a
/// coach, in basis points of a percent rate in [0, 100]; `None` means the
/// platform itself is the payee and no split applies.
pub fn calculate(
    schedule: &FeeSchedule,
    amount_cents: i64,
    method: PaymentMethod,
    payment_type: PaymentType,
    commission_rate_bps: Option<i64>,
) -> BillingResult<FeeBreakdown> {
    if amount_cents < 0 {
        return Err(BillingError::InvalidInput(format!(
            "Amount must not be negative: {}",
            amount_cents
        )));
    }
    if let Some(rate) = commission_rate_bps {
        if !(0..=BPS_DENOMINATOR).contains(&rate) {
            return Err(BillingError::InvalidInput(format!(
                "Commission rate must be between 0 and 100%: {} bps",
                rate
            )));
        }
    }

    let (platform_fee, service_fee) = match payment_type {
        PaymentType::Payout | PaymentType::Refund => (0, 0),
        PaymentType::Subscription | PaymentType::OneTime => {
            let fee = schedule.fee_for(method);
            let amount = i128::from(amount_cents);
            let platform = round_half_even(
                amount * i128::from(fee.percent_bps)
                    + i128::from(fee.fixed_cents) * i128::from(BPS_DENOMINATOR),
                i128::from(BPS_DENOMINATOR),
            );
            let service = round_half_even(
                amount * i128::from(schedule.service_fee_bps),
                i128::from(BPS_DENOMINATOR),
            );
            // Clamp so the net never goes negative on tiny amounts
            let platform = platform.min(amount_cents);
            let service = service.min(amount_cents - platform);
            (platform, service)
        }
    };

    let (commission, earnings) = match commission_rate_bps {
        Some(rate) => {
            let commission = round_half_even(
                i128::from(amount_cents) * i128::from(rate),
                i128::from(BPS_DENOMINATOR),
            );
            (commission, amount_cents - commission)
        }
        None => (0, 0),
    };

    Ok(FeeBreakdown {
        platform_fee_cents: platform_fee,
        service_fee_cents: service_fee,
        net_amount_cents: amount_cents - platform_fee - service_fee,
        platform_commission_cents: commission,
        payee_earnings_cents: earnings,
    })
}

/// Round `numerator / denominator` to the nearest integer, ties to even.
/// Both operands must be non-negative and the denominator non-zero.
pub(crate) fn round_half_even(numerator: i128, denominator: i128) -> i64 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    let rounded = match (2 * remainder).cmp(&denominator) {
        std::cmp::Ordering::Less => quotient,
        std::cmp::Ordering::Greater => quotient + 1,
        std::cmp::Ordering::Equal => quotient + (quotient & 1),
    };
    i64::try_from(rounded).unwrap_or(i64::MAX)
}

/// Convert a percent rate with up to two decimals (e.g. `20.0`) to basis points
pub fn percent_to_bps(percent: f64) -> BillingResult<i64> {
    if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
        return Err(BillingError::InvalidInput(format!(
            "Commission rate must be between 0 and 100, got {}",
            percent
        )));
    }
    Ok((percent * 100.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> FeeSchedule {
        FeeSchedule::default()
    }

    #[test]
    fn test_client_commission_split_89_at_20_percent() {
        let b = calculate(
            &schedule(),
            8900,
            PaymentMethod::Card,
            PaymentType::Subscription,
            Some(2000),
        )
        .unwrap();
        assert_eq!(b.platform_commission_cents, 1780);
        assert_eq!(b.payee_earnings_cents, 7120);
    }

    #[test]
    fn test_card_fee_is_percent_plus_fixed() {
        // 2.9% of 89.00 = 2.581 -> 2.58, + 0.30 = 2.88 (rounded once on 2.881)
        let b = calculate(&schedule(), 8900, PaymentMethod::Card, PaymentType::Subscription, None)
            .unwrap();
        assert_eq!(b.platform_fee_cents, 288);
        assert_eq!(b.service_fee_cents, 178);
        assert_eq!(b.net_amount_cents, 8900 - 288 - 178);
    }

    #[test]
    fn test_app_store_fees_are_flat_percent() {
        let apple = calculate(&schedule(), 999, PaymentMethod::AppleIap, PaymentType::OneTime, None)
            .unwrap();
        // 30% of 9.99 = 2.997 -> 3.00
        assert_eq!(apple.platform_fee_cents, 300);
        let google =
            calculate(&schedule(), 999, PaymentMethod::GooglePlay, PaymentType::OneTime, None)
                .unwrap();
        // 15% of 9.99 = 1.4985 -> 1.50
        assert_eq!(google.platform_fee_cents, 150);
    }

    #[test]
    fn test_sum_invariant_holds_across_amounts_and_methods() {
        for method in PaymentMethod::ALL {
            for amount in [0, 1, 29, 30, 31, 49, 50, 99, 100, 1234, 8900, 999_999] {
                let b = calculate(&schedule(), amount, method, PaymentType::Subscription, Some(1500))
                    .unwrap();
                assert!(b.net_amount_cents >= 0, "{method} {amount}");
                assert_eq!(
                    b.platform_fee_cents + b.service_fee_cents + b.net_amount_cents,
                    amount
                );
                assert_eq!(b.platform_commission_cents + b.payee_earnings_cents, amount);
            }
        }
    }

    #[test]
    fn test_fixed_fee_clamped_for_tiny_amounts() {
        let b = calculate(&schedule(), 20, PaymentMethod::Paypal, PaymentType::OneTime, None)
            .unwrap();
        assert_eq!(b.platform_fee_cents, 20);
        assert_eq!(b.service_fee_cents, 0);
        assert_eq!(b.net_amount_cents, 0);
    }

    #[test]
    fn test_payouts_and_refunds_carry_no_fees() {
        for kind in [PaymentType::Payout, PaymentType::Refund] {
            let b = calculate(&schedule(), 5000, PaymentMethod::Card, kind, None).unwrap();
            assert_eq!(b.platform_fee_cents, 0);
            assert_eq!(b.service_fee_cents, 0);
            assert_eq!(b.net_amount_cents, 5000);
        }
    }

    #[test]
    fn test_half_even_rounding() {
        assert_eq!(round_half_even(25, 10), 2);
        assert_eq!(round_half_even(35, 10), 4);
        assert_eq!(round_half_even(26, 10), 3);
        assert_eq!(round_half_even(24, 10), 2);
        // 0.5% of 1.00 = 0.5 cent -> 0
        let schedule = FeeSchedule {
            service_fee_bps: 50,
            ..FeeSchedule::default()
        };
        let b = calculate(&schedule, 100, PaymentMethod::GooglePlay, PaymentType::OneTime, None)
            .unwrap();
        assert_eq!(b.service_fee_cents, 0);
    }

    #[test]
    fn test_rejects_out_of_range_inputs() {
        assert!(calculate(&schedule(), -1, PaymentMethod::Card, PaymentType::OneTime, None).is_err());
        assert!(
            calculate(&schedule(), 100, PaymentMethod::Card, PaymentType::OneTime, Some(10_001))
                .is_err()
        );
        assert!(percent_to_bps(120.0).is_err());
        assert_eq!(percent_to_bps(17.5).unwrap(), 1750);
    }
}
