//! Numeric coercion and currency formatting shared by the pricing engine,
//! the coupon evaluator and the inventory CSV readers.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

use crate::config::CurrencyConfig;

/// Anything a stored or submitted amount may arrive as.
pub trait NumericLike {
    /// Finite decimal value, or `None` when the input is missing or unparseable.
    fn try_decimal(&self) -> Option<Decimal>;
}

impl NumericLike for Decimal {
    fn try_decimal(&self) -> Option<Decimal> {
        Some(*self)
    }
}

impl NumericLike for i32 {
    fn try_decimal(&self) -> Option<Decimal> {
        Some(Decimal::from(*self))
    }
}

impl NumericLike for i64 {
    fn try_decimal(&self) -> Option<Decimal> {
        Some(Decimal::from(*self))
    }
}

impl NumericLike for f64 {
    fn try_decimal(&self) -> Option<Decimal> {
        if self.is_finite() {
            Decimal::from_f64(*self)
        } else {
            None
        }
    }
}

impl NumericLike for str {
    fn try_decimal(&self) -> Option<Decimal> {
        let trimmed = self.trim();
        if trimmed.is_empty() {
            return None;
        }
        Decimal::from_str(trimmed)
            .or_else(|_| Decimal::from_scientific(trimmed))
            .ok()
            .or_else(|| trimmed.parse::<f64>().ok().and_then(|f| f.try_decimal()))
    }
}

impl NumericLike for String {
    fn try_decimal(&self) -> Option<Decimal> {
        self.as_str().try_decimal()
    }
}

impl NumericLike for serde_json::Value {
    fn try_decimal(&self) -> Option<Decimal> {
        match self {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Decimal::from)
                .or_else(|| n.as_f64().and_then(|f| f.try_decimal())),
            serde_json::Value::String(s) => s.try_decimal(),
            _ => None,
        }
    }
}

impl<T: NumericLike + ?Sized> NumericLike for &T {
    fn try_decimal(&self) -> Option<Decimal> {
        (**self).try_decimal()
    }
}

impl<T: NumericLike> NumericLike for Option<T> {
    fn try_decimal(&self) -> Option<Decimal> {
        self.as_ref().and_then(NumericLike::try_decimal)
    }
}

/// Lenient coercion: missing or malformed input becomes zero, never an error.
pub fn as_number<T: NumericLike + ?Sized>(value: &T) -> Decimal {
    value.try_decimal().unwrap_or(Decimal::ZERO)
}

/// Strict coercion for inputs where an unparseable value must be rejected.
pub fn parse_number<T: NumericLike + ?Sized>(value: &T) -> Option<Decimal> {
    value.try_decimal()
}

/// Rounds to whole currency units, halves away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

/// Truncates toward zero into an `i32`, saturating at the type bounds.
pub fn truncate_to_i32(value: Decimal) -> i32 {
    let truncated = value.trunc();
    truncated.to_i32().unwrap_or(if truncated.is_sign_negative() {
        i32::MIN
    } else {
        i32::MAX
    })
}

/// How formatted amounts look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrencyFormat {
    pub symbol: String,
    pub group_separator: String,
}

impl Default for CurrencyFormat {
    fn default() -> Self {
        Self {
            symbol: "₫".to_string(),
            group_separator: ".".to_string(),
        }
    }
}

impl From<&CurrencyConfig> for CurrencyFormat {
    fn from(cfg: &CurrencyConfig) -> Self {
        Self {
            symbol: cfg.symbol.clone(),
            group_separator: cfg.group_separator.clone(),
        }
    }
}

/// Formats `amount` as whole units with grouped thousands, e.g. `1.250.000 ₫`.
///
/// Negative amounts render as zero.
pub fn format_currency<T: NumericLike + ?Sized>(amount: &T, format: &CurrencyFormat) -> String {
    let rounded = round_money(as_number(amount)).max(Decimal::ZERO);
    let digits = rounded.trunc().to_string();

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 * 2);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push_str(&format.group_separator);
        }
        grouped.push(ch);
    }

    if format.symbol.is_empty() {
        grouped
    } else {
        format!("{} {}", grouped, format.symbol)
    }
}
