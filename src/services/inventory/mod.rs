//! Inventory ledger and stocktake workflow.
//!
//! Stock only changes through [`ledger::append_movement`], which writes the
//! movement row and the new on-hand value in the caller's transaction.

pub mod bulk_adjust;
pub mod csv;
pub mod ledger;
pub mod stocktake;
pub mod stocktake_store;

pub use bulk_adjust::{BulkAdjustService, BulkPreviewCache, BulkPreviewSummary};
pub use ledger::{
    AppliedMovement, BulkAdjustReport, BulkAdjustRow, InventoryLedgerService, MovementFilter,
    OrderStockLine, QuickCountOutcome, RebuildReport, SkippedRow, StockCorrection,
};
pub use stocktake::{PostedSnapshot, StocktakeLine, StocktakeService, StocktakeSession, UploadReport};
pub use stocktake_store::{
    stocktake_repository, JsonFileStocktakeStore, SeaOrmStocktakeStore, StocktakeRepository,
};
