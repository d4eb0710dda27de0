use crate::{
    config::AppConfig,
    db,
    entities::{
        commerce::{product_variant, ProductVariant, ProductVariantModel},
        inventory_movement::{self, Entity as InventoryMovement},
        MovementReason,
    },
    errors::{ErrorKind, ServiceError},
    events::{Event, EventSender},
    services::catalog::{self, VariantRequest},
};
use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, FromQueryResult, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// How a movement changes the variant's on-hand value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockEffect {
    /// `stock += delta`
    Increment,
    /// `stock = counted`; the count is authoritative
    SetTo(i32),
}

#[derive(Debug, Clone)]
pub struct MovementDraft {
    pub delta: i32,
    pub reason: MovementReason,
    pub note: Option<String>,
    pub order_ref: Option<String>,
}

/// A movement that was appended together with its stock update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMovement {
    pub movement_id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Uuid,
    pub delta: i32,
    pub reason: MovementReason,
    pub previous_stock: i32,
    pub new_stock: i32,
}

impl AppliedMovement {
    fn event(&self) -> Event {
        Event::StockAdjusted {
            product_id: self.product_id,
            variant_id: self.variant_id,
            delta: self.delta,
            new_stock: self.new_stock,
            reason: self.reason,
        }
    }
}

/// Appends one ledger row and updates the variant's stock on `conn`.
///
/// Callers pass a transaction so that both writes commit or neither does.
pub async fn append_movement<C: ConnectionTrait>(
    conn: &C,
    variant: &ProductVariantModel,
    draft: MovementDraft,
    effect: StockEffect,
) -> Result<AppliedMovement, ServiceError> {
    let previous_stock = variant.stock;
    let new_stock = match effect {
        StockEffect::Increment => previous_stock.checked_add(draft.delta).ok_or_else(|| {
            ServiceError::InvalidInput(format!(
                "Adjustment of {} overflows stock for variant {}",
                draft.delta, variant.id
            ))
        })?,
        StockEffect::SetTo(counted) => counted,
    };

    let movement = inventory_movement::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_id: Set(variant.product_id),
        variant_id: Set(Some(variant.id)),
        delta: Set(draft.delta),
        reason: Set(draft.reason),
        note: Set(draft.note),
        order_ref: Set(draft.order_ref),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;

    let mut active: product_variant::ActiveModel = variant.clone().into();
    active.stock = Set(new_stock);
    active.updated_at = Set(Utc::now());
    active.update(conn).await?;

    counter!("storefront_inventory.movements_appended", 1, "reason" => draft.reason.to_string());

    Ok(AppliedMovement {
        movement_id: movement.id,
        product_id: variant.product_id,
        variant_id: variant.id,
        delta: movement.delta,
        reason: movement.reason,
        previous_stock,
        new_stock,
    })
}

/// Reads a variant with a row lock where the backend supports one.
pub async fn lock_variant<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
) -> Result<Option<ProductVariantModel>, ServiceError> {
    Ok(db::for_update(
        ProductVariant::find().filter(product_variant::Column::Id.eq(variant_id)),
        conn,
    )
    .one(conn)
    .await?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QuickCountOutcome {
    /// Counted value matched the system; nothing was written
    Unchanged { variant_id: Uuid, stock: i32 },
    Adjusted(AppliedMovement),
}

/// One line of a placed or cancelled order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStockLine {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
}

/// One row of a bulk adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkAdjustRow {
    /// 1-based line in the source file, header included
    pub line: usize,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub delta: i32,
    pub reason: MovementReason,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRow {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkAdjustReport {
    pub applied: Vec<AppliedMovement>,
    pub skipped: Vec<SkippedRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCorrection {
    pub variant_id: Uuid,
    pub previous: i32,
    pub rebuilt: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebuildReport {
    pub variants_scanned: usize,
    pub corrections: Vec<StockCorrection>,
}

/// Filter for [`InventoryLedgerService::list_movements`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MovementFilter {
    pub product_id: Option<Uuid>,
    pub variant_id: Option<Uuid>,
    pub reason: Option<MovementReason>,
    pub limit: Option<u64>,
}

#[derive(Debug, FromQueryResult)]
struct VariantDeltaSum {
    variant_id: Option<Uuid>,
    total: Option<i64>,
}

const DEFAULT_MOVEMENT_LIMIT: u64 = 200;

/// Append-only inventory ledger. Every stock change goes through here.
#[derive(Clone)]
pub struct InventoryLedgerService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl InventoryLedgerService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn publish(&self, applied: &[AppliedMovement]) {
        for movement in applied {
            self.event_sender.send_or_log(movement.event()).await;
        }
    }

    /// Variant for a ledger request: explicit id, else the product's first
    /// variant under the configured fallback policy.
    async fn target_variant(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> Result<ProductVariantModel, ServiceError> {
        let resolved = catalog::resolve_variant(
            txn,
            product_id,
            VariantRequest {
                variant_id,
                color: None,
            },
            self.config.inventory.variant_fallback,
        )
        .await?;

        lock_variant(txn, resolved.variant.id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Variant {} not found", resolved.variant.id)))
    }

    /// Sets one variant's on-hand to `counted` without a stocktake session.
    #[instrument(skip(self))]
    pub async fn quick_count(
        &self,
        product_id: Uuid,
        variant_id: Option<Uuid>,
        counted: i32,
    ) -> Result<QuickCountOutcome, ServiceError> {
        if counted < 0 {
            return Err(ServiceError::InvalidInput(
                "Counted quantity cannot be negative".to_string(),
            ));
        }

        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let variant = match self.target_variant(&txn, product_id, variant_id).await {
            Ok(variant) => variant,
            Err(e) => return Err(log_failure("quick_count", e)),
        };

        let delta = counted - variant.stock;
        if delta == 0 {
            db::rollback(txn, "quick_count_unchanged").await?;
            return Ok(QuickCountOutcome::Unchanged {
                variant_id: variant.id,
                stock: variant.stock,
            });
        }

        let applied = append_movement(
            &txn,
            &variant,
            MovementDraft {
                delta,
                reason: MovementReason::ManualAdjust,
                note: Some("quick count".to_string()),
                order_ref: None,
            },
            StockEffect::SetTo(counted),
        )
        .await
        .map_err(|e| log_failure("quick_count", e))?;
        db::commit(txn, started).await?;

        info!(variant_id = %applied.variant_id, delta, counted, "Quick count posted");
        self.publish(std::slice::from_ref(&applied)).await;
        Ok(QuickCountOutcome::Adjusted(applied))
    }

    /// Applies independent stock deltas in one transaction.
    ///
    /// Rows whose product or variant cannot be found are skipped and reported.
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn bulk_adjust(&self, rows: Vec<BulkAdjustRow>) -> Result<BulkAdjustReport, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let mut report = BulkAdjustReport::default();

        for row in rows {
            if row.delta == 0 {
                report.skipped.push(SkippedRow {
                    line: row.line,
                    reason: "delta is zero".to_string(),
                });
                continue;
            }

            let variant = match self.target_variant(&txn, row.product_id, row.variant_id).await {
                Ok(variant) => variant,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    report.skipped.push(SkippedRow {
                        line: row.line,
                        reason: e.to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(log_failure("bulk_adjust", e)),
            };

            let applied = append_movement(
                &txn,
                &variant,
                MovementDraft {
                    delta: row.delta,
                    reason: row.reason,
                    note: row.note,
                    order_ref: None,
                },
                StockEffect::Increment,
            )
            .await
            .map_err(|e| log_failure("bulk_adjust", e))?;
            report.applied.push(applied);
        }

        db::commit(txn, started).await?;
        info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "Bulk adjustment committed"
        );
        self.publish(&report.applied).await;
        Ok(report)
    }

    /// Takes stock out for a confirmed order.
    #[instrument(skip(self, lines))]
    pub async fn record_order_placed(
        &self,
        order_ref: &str,
        lines: &[OrderStockLine],
    ) -> Result<Vec<AppliedMovement>, ServiceError> {
        self.record_order(order_ref, lines, MovementReason::OrderPlaced, -1)
            .await
    }

    /// Puts stock back for a cancelled order.
    #[instrument(skip(self, lines))]
    pub async fn record_order_cancelled(
        &self,
        order_ref: &str,
        lines: &[OrderStockLine],
    ) -> Result<Vec<AppliedMovement>, ServiceError> {
        self.record_order(order_ref, lines, MovementReason::OrderCancelled, 1)
            .await
    }

    async fn record_order(
        &self,
        order_ref: &str,
        lines: &[OrderStockLine],
        reason: MovementReason,
        sign: i32,
    ) -> Result<Vec<AppliedMovement>, ServiceError> {
        if order_ref.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "Order reference is required".to_string(),
            ));
        }
        if let Some(bad) = lines.iter().find(|l| l.quantity <= 0) {
            return Err(ServiceError::InvalidInput(format!(
                "Order line for product {} has non-positive quantity {}",
                bad.product_id, bad.quantity
            )));
        }

        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let mut applied = Vec::with_capacity(lines.len());

        for line in lines {
            let variant = self
                .target_variant(&txn, line.product_id, line.variant_id)
                .await
                .map_err(|e| log_failure("record_order", e))?;
            let movement = append_movement(
                &txn,
                &variant,
                MovementDraft {
                    delta: sign * line.quantity,
                    reason,
                    note: None,
                    order_ref: Some(order_ref.to_string()),
                },
                StockEffect::Increment,
            )
            .await
            .map_err(|e| log_failure("record_order", e))?;
            applied.push(movement);
        }

        db::commit(txn, started).await?;
        info!(order_ref, %reason, lines = applied.len(), "Order stock movements recorded");
        self.publish(&applied).await;
        Ok(applied)
    }

    /// Overwrites every variant's stock with the sum of its movement deltas.
    ///
    /// Each changed variant is updated in its own transaction. Running it
    /// again without new movements changes nothing.
    #[instrument(skip(self))]
    pub async fn rebuild_on_hand(&self) -> Result<RebuildReport, ServiceError> {
        let sums: HashMap<Uuid, i64> = InventoryMovement::find()
            .select_only()
            .column(inventory_movement::Column::VariantId)
            .column_as(inventory_movement::Column::Delta.sum(), "total")
            .filter(inventory_movement::Column::VariantId.is_not_null())
            .group_by(inventory_movement::Column::VariantId)
            .into_model::<VariantDeltaSum>()
            .all(&*self.db)
            .await?
            .into_iter()
            .filter_map(|row| row.variant_id.map(|id| (id, row.total.unwrap_or(0))))
            .collect();

        let variants = ProductVariant::find().all(&*self.db).await?;
        let mut report = RebuildReport {
            variants_scanned: variants.len(),
            corrections: Vec::new(),
        };

        for variant in variants {
            let total = sums.get(&variant.id).copied().unwrap_or(0);
            let rebuilt = i32::try_from(total).map_err(|_| {
                ServiceError::InternalError(format!(
                    "Ledger sum {} for variant {} does not fit in stock",
                    total, variant.id
                ))
            })?;
            if rebuilt == variant.stock {
                continue;
            }

            let started = Instant::now();
            let txn = db::begin(&*self.db).await?;
            let previous = variant.stock;
            let mut active: product_variant::ActiveModel = variant.into();
            active.stock = Set(rebuilt);
            active.updated_at = Set(Utc::now());
            let updated = active
                .update(&txn)
                .await
                .map_err(|e| log_failure("rebuild_on_hand", e.into()))?;
            db::commit(txn, started).await?;

            warn!(variant_id = %updated.id, previous, rebuilt, "Stock rebuilt from ledger");
            report.corrections.push(StockCorrection {
                variant_id: updated.id,
                previous,
                rebuilt,
            });
        }

        info!(
            scanned = report.variants_scanned,
            changed = report.corrections.len(),
            "On-hand rebuild finished"
        );
        self.event_sender
            .send_or_log(Event::OnHandRebuilt {
                variants_scanned: report.variants_scanned,
                variants_changed: report.corrections.len(),
            })
            .await;
        Ok(report)
    }

    /// Movement history, newest first.
    pub async fn list_movements(
        &self,
        filter: MovementFilter,
    ) -> Result<Vec<inventory_movement::Model>, ServiceError> {
        let mut query = InventoryMovement::find();
        if let Some(product_id) = filter.product_id {
            query = query.filter(inventory_movement::Column::ProductId.eq(product_id));
        }
        if let Some(variant_id) = filter.variant_id {
            query = query.filter(inventory_movement::Column::VariantId.eq(variant_id));
        }
        if let Some(reason) = filter.reason {
            query = query.filter(inventory_movement::Column::Reason.eq(reason));
        }

        Ok(query
            .order_by_desc(inventory_movement::Column::CreatedAt)
            .limit(filter.limit.unwrap_or(DEFAULT_MOVEMENT_LIMIT))
            .all(&*self.db)
            .await?)
    }
}

/// Logs a failure at the transaction boundary and hands the error back.
pub(crate) fn log_failure(operation: &str, e: ServiceError) -> ServiceError {
    match e.kind() {
        ErrorKind::Persistence | ErrorKind::Internal => {
            error!(operation, error = %e, "Inventory transaction failed and was rolled back")
        }
        _ => warn!(operation, error = %e, "Inventory request rejected"),
    }
    e
}
