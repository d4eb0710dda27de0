//! sea-orm entities for the catalog, cart, coupon and inventory tables.

pub mod commerce;
pub mod inventory_movement;
pub mod product;
pub mod stocktake_session;

pub use commerce::{cart, cart_item, coupon, product_variant};
pub use inventory_movement::MovementReason;
pub use product::ProductStatus;
pub use stocktake_session::{StocktakeScope, StocktakeStatus};
