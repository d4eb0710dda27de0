/// Cart, pricing and coupon logic for the storefront
pub mod cart_service;
pub mod coupon_evaluator;
pub mod coupon_service;
pub mod pricing_service;
pub mod session;

pub use cart_service::{AddItemInput, CartOutcome, CartService, CartUpdate, CouponApplication, QuantityChange};
pub use coupon_evaluator::{apply_coupon, validate_coupon, CartSummary, CouponInfo, CouponOutcome, CouponRejection};
pub use coupon_service::{CouponService, CreateCouponInput};
pub use pricing_service::{build_cart_data, CartData, CartTotals, CartViewItem, FreeShipProgress, PricingRules};
pub use session::{AppliedCoupon, CartSession, SessionCart, SessionCartItem};
