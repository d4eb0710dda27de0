//! Cart pricing engine.
//!
//! `build_cart_data` is the only place cart totals are derived. Cart mutations
//! run it as their last step and persist what it returns.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::coupon_evaluator::CartSummary;
use super::session::{SessionCart, SessionCartItem};
use crate::config::PricingConfig;
use crate::entities::commerce::CartItemModel;
use crate::services::money::{as_number, round_money};

/// Shipping fee rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingRules {
    pub free_ship_threshold: Decimal,
    pub shipping_fee: Decimal,
}

impl Default for PricingRules {
    fn default() -> Self {
        Self {
            free_ship_threshold: Decimal::from(500_000),
            shipping_fee: Decimal::from(30_000),
        }
    }
}

impl From<&PricingConfig> for PricingRules {
    fn from(cfg: &PricingConfig) -> Self {
        Self {
            free_ship_threshold: Decimal::from(cfg.free_ship_threshold),
            shipping_fee: Decimal::from(cfg.shipping_fee),
        }
    }
}

impl PricingRules {
    /// Flat fee below the threshold, free at or above it or for an empty cart.
    pub fn shipping_for(&self, quantity: i64, total_before_shipping: Decimal) -> Decimal {
        if quantity == 0 || total_before_shipping >= self.free_ship_threshold {
            Decimal::ZERO
        } else {
            self.shipping_fee
        }
    }

    pub fn free_ship_progress(&self, quantity: i64, total_before_shipping: Decimal) -> FreeShipProgress {
        let remaining = (self.free_ship_threshold - total_before_shipping).max(Decimal::ZERO);
        let percent = if self.free_ship_threshold > Decimal::ZERO {
            round_money(total_before_shipping / self.free_ship_threshold * Decimal::ONE_HUNDRED)
                .min(Decimal::ONE_HUNDRED)
                .max(Decimal::ZERO)
        } else {
            Decimal::ONE_HUNDRED
        };

        FreeShipProgress {
            threshold: self.free_ship_threshold,
            remaining,
            percent,
            reached: quantity > 0 && remaining.is_zero(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeShipProgress {
    pub threshold: Decimal,
    pub remaining: Decimal,
    /// 0-100
    pub percent: Decimal,
    pub reached: bool,
}

/// Line as the cart page renders it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartViewItem {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Uuid,
    pub title: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub line_total: Decimal,
    pub size: Option<String>,
    pub color: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartTotals {
    pub quantity: i64,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total_before_shipping: Decimal,
    pub shipping: Decimal,
    pub total: Decimal,
    pub free_ship: FreeShipProgress,
}

impl CartTotals {
    pub fn summary(&self) -> CartSummary {
        CartSummary {
            subtotal: self.subtotal,
            discount: self.discount,
            shipping: self.shipping,
            total_before_shipping: self.total_before_shipping,
            total: self.total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartData {
    pub items: Vec<CartViewItem>,
    pub totals: CartTotals,
    pub session: SessionCart,
}

/// Per-line figures from the stored price snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinePricing {
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub line_total: Decimal,
}

/// Stored subtotal wins over `unit_price * quantity`.
///
/// The discount is clamped to the subtotal so that cart totals always equal
/// the sum of line totals.
pub fn price_line(line: &CartItemModel) -> LinePricing {
    let unit_price = as_number(&line.unit_price);
    let subtotal = match line.subtotal {
        Some(stored) => stored,
        None => unit_price * Decimal::from(line.quantity),
    }
    .max(Decimal::ZERO);
    let discount = as_number(&line.discount).max(Decimal::ZERO).min(subtotal);

    LinePricing {
        unit_price,
        subtotal,
        discount,
        line_total: (subtotal - discount).max(Decimal::ZERO),
    }
}

/// Builds view lines, totals and the session snapshot for `lines`.
pub fn build_cart_data(lines: &[CartItemModel], rules: &PricingRules) -> CartData {
    let mut items = Vec::with_capacity(lines.len());
    let mut session_items = Vec::with_capacity(lines.len());
    let mut subtotal = Decimal::ZERO;
    let mut discount = Decimal::ZERO;
    let mut quantity: i64 = 0;

    for line in lines {
        let priced = price_line(line);
        subtotal += priced.subtotal;
        discount += priced.discount;
        quantity += i64::from(line.quantity);

        session_items.push(SessionCartItem {
            item_id: line.id,
            variant_id: line.variant_id,
            quantity: line.quantity,
            line_total: priced.line_total,
        });
        items.push(CartViewItem {
            id: line.id,
            product_id: line.product_id,
            variant_id: line.variant_id,
            title: line.title.clone(),
            quantity: line.quantity,
            unit_price: priced.unit_price,
            subtotal: priced.subtotal,
            discount: priced.discount,
            line_total: priced.line_total,
            size: line.size.clone(),
            color: line.color.clone(),
            image: line.image.clone(),
        });
    }

    let total_before_shipping = (subtotal - discount).max(Decimal::ZERO);
    let shipping = rules.shipping_for(quantity, total_before_shipping);
    let total = total_before_shipping + shipping;

    CartData {
        items,
        totals: CartTotals {
            quantity,
            subtotal,
            discount,
            total_before_shipping,
            shipping,
            total,
            free_ship: rules.free_ship_progress(quantity, total_before_shipping),
        },
        session: SessionCart {
            items: session_items,
            quantity,
            total,
        },
    }
}
