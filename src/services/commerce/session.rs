use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::commerce::CouponKind;

/// Coupon identity mirrored into the shopper's session between page loads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AppliedCoupon {
    #[default]
    None,
    Applied {
        code: String,
        title: String,
        kind: CouponKind,
    },
}

impl AppliedCoupon {
    pub fn code(&self) -> Option<&str> {
        match self {
            AppliedCoupon::None => None,
            AppliedCoupon::Applied { code, .. } => Some(code),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, AppliedCoupon::Applied { .. })
    }
}

/// Compact cart copy kept in the session for the header badge and mini-cart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCart {
    pub items: Vec<SessionCartItem>,
    pub quantity: i64,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCartItem {
    pub item_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub line_total: Decimal,
}

/// Per-visitor state the HTTP layer persists between requests.
///
/// `user_token` is the signed-in identity; `cart_id` mirrors the cart cookie
/// and is rewritten whenever the service re-anchors the visitor to another
/// cart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSession {
    pub user_token: Option<String>,
    pub cart_id: Option<Uuid>,
    #[serde(default)]
    pub applied_coupon: AppliedCoupon,
    #[serde(default)]
    pub cart: Option<SessionCart>,
}

impl CartSession {
    pub fn anonymous(cart_id: Option<Uuid>) -> Self {
        Self {
            cart_id,
            ..Default::default()
        }
    }

    pub fn for_user(user_token: impl Into<String>, cart_id: Option<Uuid>) -> Self {
        Self {
            user_token: Some(user_token.into()),
            cart_id,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applied_coupon_serializes_as_tagged_union() {
        let applied = AppliedCoupon::Applied {
            code: "FREESHIP10".into(),
            title: "Free shipping".into(),
            kind: CouponKind::Freeship,
        };
        let json = serde_json::to_value(&applied).expect("serialize");
        assert_eq!(json["state"], "applied");
        assert_eq!(json["kind"], "FREESHIP");

        let none = serde_json::to_value(AppliedCoupon::None).expect("serialize");
        assert_eq!(none, serde_json::json!({"state": "none"}));
    }

    #[test]
    fn session_without_coupon_field_defaults_to_none() {
        let session: CartSession =
            serde_json::from_str(r#"{"user_token":null,"cart_id":null}"#).expect("deserialize");
        assert_eq!(session.applied_coupon, AppliedCoupon::None);
        assert!(session.cart.is_none());
    }
}
