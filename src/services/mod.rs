pub mod catalog;
pub mod commerce;
pub mod inventory;
pub mod money;
