//! Pure coupon evaluation. No I/O: the caller supplies the coupon row and
//! the clock, so every rule here is testable against literal fixtures.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::commerce::{CouponKind, CouponModel, CouponStatus};
use crate::services::money::round_money;

/// Cart-level figures a coupon is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CartSummary {
    pub subtotal: Decimal,
    /// Sum of line-level discounts, plus the coupon discount once applied
    pub discount: Decimal,
    pub shipping: Decimal,
    pub total_before_shipping: Decimal,
    pub total: Decimal,
}

impl CartSummary {
    /// Subtotal net of line-level discounts, floored at zero.
    pub fn base_before_shipping(&self) -> Decimal {
        (self.subtotal - self.discount).max(Decimal::ZERO)
    }
}

/// Effect of a coupon that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponInfo {
    pub coupon_id: Uuid,
    pub code: String,
    pub title: String,
    pub kind: CouponKind,
    /// Amount taken off the order on top of line discounts
    pub discount: Decimal,
    /// Shipping fee removed by a FREESHIP coupon
    pub shipping_discount: Decimal,
}

/// Why a coupon left the summary untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CouponRejection {
    UnknownCode,
    Inactive,
    NotStarted,
    Expired,
    BelowMinimum,
    UsageExhausted,
}

impl CouponRejection {
    /// Sentence suitable for a flash message.
    pub fn message(&self) -> &'static str {
        match self {
            CouponRejection::UnknownCode => "Coupon code not found",
            CouponRejection::Inactive => "This coupon is no longer active",
            CouponRejection::NotStarted => "This coupon is not valid yet",
            CouponRejection::Expired => "This coupon has expired",
            CouponRejection::BelowMinimum => "Order total is below the coupon minimum",
            CouponRejection::UsageExhausted => "This coupon has reached its usage limit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouponEffect {
    Applied(CouponInfo),
    NoEffect(CouponRejection),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponOutcome {
    pub summary: CartSummary,
    pub effect: CouponEffect,
}

impl CouponOutcome {
    pub fn no_effect(summary: CartSummary, reason: CouponRejection) -> Self {
        Self {
            summary,
            effect: CouponEffect::NoEffect(reason),
        }
    }

    pub fn coupon_info(&self) -> Option<&CouponInfo> {
        match &self.effect {
            CouponEffect::Applied(info) => Some(info),
            CouponEffect::NoEffect(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<CouponRejection> {
        match self.effect {
            CouponEffect::Applied(_) => None,
            CouponEffect::NoEffect(reason) => Some(reason),
        }
    }
}

/// First validation rule `coupon` fails at `now`, if any.
pub fn validate_coupon(
    summary: &CartSummary,
    coupon: &CouponModel,
    now: DateTime<Utc>,
) -> Option<CouponRejection> {
    if coupon.status != CouponStatus::Active {
        return Some(CouponRejection::Inactive);
    }
    if coupon.start_date.is_some_and(|start| now < start) {
        return Some(CouponRejection::NotStarted);
    }
    if coupon.end_date.is_some_and(|end| now > end) {
        return Some(CouponRejection::Expired);
    }
    if coupon
        .min_order_value
        .is_some_and(|min| summary.base_before_shipping() < min)
    {
        return Some(CouponRejection::BelowMinimum);
    }
    if coupon
        .usage_limit
        .is_some_and(|limit| coupon.used_count >= limit)
    {
        return Some(CouponRejection::UsageExhausted);
    }
    None
}

/// Applies `coupon` to `summary`.
///
/// PERCENT takes a rounded percentage of the base, capped at `max_discount`.
/// FREESHIP zeroes shipping and stacks `value` as an amount when positive.
/// Every other kind subtracts `value` as is.
pub fn apply_coupon(summary: &CartSummary, coupon: &CouponModel, now: DateTime<Utc>) -> CouponOutcome {
    if let Some(reason) = validate_coupon(summary, coupon, now) {
        return CouponOutcome::no_effect(*summary, reason);
    }

    let base = summary.base_before_shipping();
    let mut shipping = summary.shipping;

    let extra = match coupon.kind {
        CouponKind::Percent => {
            let raw = round_money(base * coupon.value / Decimal::ONE_HUNDRED);
            match coupon.max_discount {
                Some(cap) => raw.min(cap),
                None => raw,
            }
        }
        CouponKind::Freeship => {
            shipping = Decimal::ZERO;
            if coupon.value > Decimal::ZERO {
                coupon.value
            } else {
                Decimal::ZERO
            }
        }
        CouponKind::Amount => coupon.value,
    }
    .max(Decimal::ZERO);

    let discount = summary.discount + extra;
    let total_before_shipping = (summary.subtotal - discount).max(Decimal::ZERO);

    CouponOutcome {
        summary: CartSummary {
            subtotal: summary.subtotal,
            discount,
            shipping,
            total_before_shipping,
            total: total_before_shipping + shipping,
        },
        effect: CouponEffect::Applied(CouponInfo {
            coupon_id: coupon.id,
            code: coupon.code.clone(),
            title: coupon.title.clone(),
            kind: coupon.kind,
            discount: extra,
            shipping_discount: summary.shipping - shipping,
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    pub(crate) fn coupon(kind: CouponKind, value: Decimal) -> CouponModel {
        let now = Utc::now();
        CouponModel {
            id: Uuid::new_v4(),
            code: "TEST".to_string(),
            title: "Test coupon".to_string(),
            kind,
            value,
            min_order_value: None,
            max_discount: None,
            usage_limit: None,
            used_count: 0,
            status: CouponStatus::Active,
            start_date: None,
            end_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn summary(subtotal: Decimal, discount: Decimal, shipping: Decimal) -> CartSummary {
        let total_before_shipping = (subtotal - discount).max(Decimal::ZERO);
        CartSummary {
            subtotal,
            discount,
            shipping,
            total_before_shipping,
            total: total_before_shipping + shipping,
        }
    }

    #[test]
    fn percent_discount_is_capped() {
        let mut c = coupon(CouponKind::Percent, dec!(50));
        c.max_discount = Some(dec!(20000));
        let base = summary(dec!(1000000), dec!(0), dec!(0));

        let outcome = apply_coupon(&base, &c, Utc::now());
        let info = outcome.coupon_info().expect("applied");
        assert_eq!(info.discount, dec!(20000));
        assert_eq!(outcome.summary.total, dec!(980000));
    }

    #[test]
    fn percent_discount_rounds_to_whole_units() {
        let c = coupon(CouponKind::Percent, dec!(15));
        let base = summary(dec!(333333), dec!(0), dec!(30000));

        let outcome = apply_coupon(&base, &c, Utc::now());
        // 333333 * 15% = 49999.95
        assert_eq!(outcome.coupon_info().map(|i| i.discount), Some(dec!(50000)));
        assert_eq!(outcome.summary.total_before_shipping, dec!(283333));
        assert_eq!(outcome.summary.total, dec!(313333));
    }

    #[test]
    fn percent_applies_to_base_net_of_line_discounts() {
        let c = coupon(CouponKind::Percent, dec!(10));
        let base = summary(dec!(200000), dec!(50000), dec!(30000));

        let outcome = apply_coupon(&base, &c, Utc::now());
        assert_eq!(outcome.coupon_info().map(|i| i.discount), Some(dec!(15000)));
        assert_eq!(outcome.summary.discount, dec!(65000));
        assert_eq!(outcome.summary.total, dec!(165000));
    }

    #[test]
    fn freeship_zeroes_shipping_and_stacks_amount() {
        let c = coupon(CouponKind::Freeship, dec!(10000));
        let base = summary(dec!(400000), dec!(0), dec!(30000));

        let outcome = apply_coupon(&base, &c, Utc::now());
        let info = outcome.coupon_info().expect("applied");
        assert_eq!(info.shipping_discount, dec!(30000));
        assert_eq!(info.discount, dec!(10000));
        assert_eq!(outcome.summary.shipping, dec!(0));
        assert_eq!(outcome.summary.total, dec!(390000));
    }

    #[test]
    fn freeship_without_value_only_waives_shipping() {
        let c = coupon(CouponKind::Freeship, dec!(0));
        let base = summary(dec!(400000), dec!(0), dec!(30000));

        let outcome = apply_coupon(&base, &c, Utc::now());
        assert_eq!(outcome.summary.total, dec!(400000));
        assert_eq!(outcome.coupon_info().map(|i| i.discount), Some(dec!(0)));
    }

    #[test]
    fn amount_is_used_verbatim_and_total_floors_at_zero() {
        let c = coupon(CouponKind::Amount, dec!(500000));
        let base = summary(dec!(100000), dec!(0), dec!(30000));

        let outcome = apply_coupon(&base, &c, Utc::now());
        assert_eq!(outcome.coupon_info().map(|i| i.discount), Some(dec!(500000)));
        assert_eq!(outcome.summary.total_before_shipping, dec!(0));
        assert_eq!(outcome.summary.total, dec!(30000));
    }

    #[test]
    fn negative_amount_is_floored() {
        let c = coupon(CouponKind::Amount, dec!(-5000));
        let base = summary(dec!(100000), dec!(0), dec!(30000));

        let outcome = apply_coupon(&base, &c, Utc::now());
        assert_eq!(outcome.coupon_info().map(|i| i.discount), Some(dec!(0)));
        assert_eq!(outcome.summary, base);
    }

    #[rstest]
    #[case::inactive(CouponRejection::Inactive)]
    #[case::not_started(CouponRejection::NotStarted)]
    #[case::expired(CouponRejection::Expired)]
    #[case::below_minimum(CouponRejection::BelowMinimum)]
    #[case::usage_exhausted(CouponRejection::UsageExhausted)]
    fn rejected_coupon_leaves_summary_unchanged(#[case] reason: CouponRejection) {
        let now = Utc::now();
        let mut c = coupon(CouponKind::Amount, dec!(10000));
        match reason {
            CouponRejection::Inactive => c.status = CouponStatus::Inactive,
            CouponRejection::NotStarted => c.start_date = Some(now + Duration::days(1)),
            CouponRejection::Expired => c.end_date = Some(now - Duration::days(1)),
            CouponRejection::BelowMinimum => c.min_order_value = Some(dec!(1000000)),
            CouponRejection::UsageExhausted => {
                c.usage_limit = Some(3);
                c.used_count = 3;
            }
            CouponRejection::UnknownCode => unreachable!(),
        }
        let base = summary(dec!(300000), dec!(0), dec!(30000));

        let outcome = apply_coupon(&base, &c, now);
        assert_eq!(outcome.summary, base);
        assert!(outcome.coupon_info().is_none());
        assert_matches!(outcome.effect, CouponEffect::NoEffect(r) if r == reason);
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let now = Utc::now();
        let mut c = coupon(CouponKind::Amount, dec!(1000));
        c.start_date = Some(now);
        c.end_date = Some(now);

        let outcome = apply_coupon(&summary(dec!(5000), dec!(0), dec!(0)), &c, now);
        assert!(outcome.coupon_info().is_some());
    }

    #[test]
    fn minimum_is_checked_against_base_before_shipping() {
        let mut c = coupon(CouponKind::Amount, dec!(1000));
        c.min_order_value = Some(dec!(200000));

        // subtotal meets the minimum but line discounts push the base below it
        let base = summary(dec!(210000), dec!(20000), dec!(30000));
        let outcome = apply_coupon(&base, &c, Utc::now());
        assert_eq!(outcome.rejection(), Some(CouponRejection::BelowMinimum));
    }
}
