use crate::{
    config::AppConfig,
    db,
    entities::{
        commerce::{product_variant, Product, ProductModel, ProductVariant, ProductVariantModel},
        MovementReason, StocktakeScope, StocktakeStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::csv::{self, StocktakeSheetRow};
use super::ledger::{self, log_failure, MovementDraft, SkippedRow, StockEffect};
use super::stocktake_store::StocktakeRepository;

/// Counted line of a session under review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StocktakeLine {
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub title: String,
    /// Variant stock at upload time
    pub system_on_hand: i32,
    pub counted: Option<i32>,
    pub delta: Option<i32>,
}

impl StocktakeLine {
    fn new(variant: &ProductVariantModel, title: String, counted: Option<i32>) -> Self {
        Self {
            variant_id: variant.id,
            product_id: variant.product_id,
            title,
            system_on_hand: variant.stock,
            counted,
            delta: counted.map(|c| c - variant.stock),
        }
    }

    /// Lines that will produce a ledger movement when the session posts.
    pub fn is_postable(&self) -> bool {
        self.counted.is_some() && self.delta.is_some_and(|d| d != 0)
    }
}

/// Read-only record of what a post wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostedSnapshot {
    pub posted_at: DateTime<Utc>,
    pub movements_created: usize,
    pub lines: Vec<StocktakeLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StocktakeSession {
    pub id: Uuid,
    pub name: String,
    pub status: StocktakeStatus,
    pub scope: StocktakeScope,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub lines: Vec<StocktakeLine>,
    #[serde(default)]
    pub posted: Option<PostedSnapshot>,
}

impl StocktakeSession {
    pub fn new(name: &str, scope: StocktakeScope) -> Result<Self, ServiceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::ValidationError(
                "Stocktake name is required".to_string(),
            ));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: StocktakeStatus::Draft,
            scope,
            created_at: now,
            updated_at: now,
            lines: Vec::new(),
            posted: None,
        })
    }

    pub fn can_download(&self) -> Result<(), ServiceError> {
        match self.status {
            StocktakeStatus::Draft | StocktakeStatus::Reviewing => Ok(()),
            StocktakeStatus::Posted => Err(ServiceError::InvalidStatus(format!(
                "Stocktake {} is already posted",
                self.id
            ))),
        }
    }

    /// Replaces the working lines. Allowed from draft and reviewing.
    pub fn begin_review(&mut self, lines: Vec<StocktakeLine>) -> Result<(), ServiceError> {
        self.can_download()?;
        self.status = StocktakeStatus::Reviewing;
        self.lines = lines;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Checks that a post may run.
    pub fn ensure_postable(&self) -> Result<(), ServiceError> {
        match self.status {
            StocktakeStatus::Reviewing if !self.lines.is_empty() => Ok(()),
            StocktakeStatus::Reviewing => Err(ServiceError::InvalidOperation(format!(
                "Stocktake {} has no lines to post",
                self.id
            ))),
            status => Err(ServiceError::InvalidStatus(format!(
                "Stocktake {} is {} and cannot be posted",
                self.id, status
            ))),
        }
    }

    /// Moves to posted and keeps the lines as a snapshot.
    pub fn mark_posted(&mut self, movements_created: usize) -> Result<(), ServiceError> {
        self.ensure_postable()?;
        let now = Utc::now();
        self.status = StocktakeStatus::Posted;
        self.posted = Some(PostedSnapshot {
            posted_at: now,
            movements_created,
            lines: std::mem::take(&mut self.lines),
        });
        self.updated_at = now;
        Ok(())
    }

    pub fn ensure_deletable(&self) -> Result<(), ServiceError> {
        if self.status == StocktakeStatus::Posted {
            return Err(ServiceError::InvalidStatus(format!(
                "Posted stocktake {} cannot be deleted",
                self.id
            )));
        }
        Ok(())
    }

    /// Ledger note attached to every movement this session posts.
    pub fn movement_note(&self) -> String {
        format!("stocktake:{}", self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReport {
    pub session: StocktakeSession,
    /// Rows whose variant is in scope
    pub lines: usize,
    /// Lines with a counted value
    pub counted: usize,
    pub skipped: Vec<SkippedRow>,
}

/// Variant together with the product it belongs to, for scope filtering.
struct ScopedVariant {
    variant: ProductVariantModel,
    product: Option<ProductModel>,
}

impl ScopedVariant {
    fn title(&self) -> String {
        let name = self
            .product
            .as_ref()
            .map(|p| p.name.as_str())
            .unwrap_or("(unknown product)");
        match self.variant.color.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(color) => format!("{} / {}", name, color.trim()),
            None => name.to_string(),
        }
    }
}

fn in_scope(scope: StocktakeScope, low_stock_threshold: i32, item: &ScopedVariant) -> bool {
    match scope {
        StocktakeScope::All => true,
        StocktakeScope::Active => item.product.as_ref().is_some_and(ProductModel::is_sellable),
        StocktakeScope::Low => item.variant.stock <= low_stock_threshold,
    }
}

async fn scoped_variants<C: ConnectionTrait>(
    conn: &C,
    scope: StocktakeScope,
    low_stock_threshold: i32,
) -> Result<Vec<ScopedVariant>, ServiceError> {
    let mut query = ProductVariant::find();
    if scope == StocktakeScope::Low {
        query = query.filter(product_variant::Column::Stock.lte(low_stock_threshold));
    }
    let rows = query
        .find_also_related(Product)
        .order_by_asc(product_variant::Column::ProductId)
        .order_by_asc(product_variant::Column::Position)
        .all(conn)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(variant, product)| ScopedVariant { variant, product })
        .filter(|item| in_scope(scope, low_stock_threshold, item))
        .collect())
}

/// Stocktake workflow: `draft -> reviewing -> posted`.
#[derive(Clone)]
pub struct StocktakeService {
    db: Arc<DatabaseConnection>,
    repo: Arc<dyn StocktakeRepository>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl StocktakeService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        repo: Arc<dyn StocktakeRepository>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            repo,
            event_sender,
            config,
        }
    }

    fn low_stock_threshold(&self) -> i32 {
        self.config.inventory.low_stock_threshold
    }

    #[instrument(skip(self))]
    pub async fn create(&self, name: &str, scope: StocktakeScope) -> Result<StocktakeSession, ServiceError> {
        let session = StocktakeSession::new(name, scope)?;
        self.repo.save(&session).await?;
        info!(session_id = %session.id, %scope, "Stocktake created");
        Ok(session)
    }

    pub async fn list(&self) -> Result<Vec<StocktakeSession>, ServiceError> {
        self.repo.list().await
    }

    pub async fn get(&self, id: Uuid) -> Result<StocktakeSession, ServiceError> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Stocktake {} not found", id)))
    }

    /// Count sheet for the session's scope, with current on-hand values.
    #[instrument(skip(self))]
    pub async fn download(&self, id: Uuid) -> Result<String, ServiceError> {
        let session = self.get(id).await?;
        session.can_download()?;

        let rows: Vec<StocktakeSheetRow> =
            scoped_variants(&*self.db, session.scope, self.low_stock_threshold())
                .await?
                .into_iter()
                .map(|item| StocktakeSheetRow {
                    title: item.title(),
                    variant_id: item.variant.id,
                    product_id: item.variant.product_id,
                    system_on_hand: item.variant.stock,
                })
                .collect();
        Ok(csv::render_stocktake(&rows))
    }

    /// Reads a filled-in count sheet and moves the session to reviewing.
    ///
    /// System on-hand is read again now, so deltas reflect movements recorded
    /// since the sheet was downloaded. Variants outside the scope or unknown
    /// to the catalog are reported as skipped. A variant listed twice keeps
    /// its last row.
    #[instrument(skip(self, text), fields(bytes = text.len()))]
    pub async fn upload(&self, id: Uuid, text: &str) -> Result<UploadReport, ServiceError> {
        let mut session = self.get(id).await?;
        session.can_download()?;
        let parsed = csv::parse_stocktake(text)?;

        let scoped: HashMap<Uuid, ScopedVariant> =
            scoped_variants(&*self.db, session.scope, self.low_stock_threshold())
                .await?
                .into_iter()
                .map(|item| (item.variant.id, item))
                .collect();

        let mut skipped = parsed.skipped;
        let mut order: Vec<Uuid> = Vec::new();
        let mut by_variant: HashMap<Uuid, StocktakeLine> = HashMap::new();
        for row in parsed.rows {
            let Some(item) = scoped.get(&row.variant_id) else {
                skipped.push(SkippedRow {
                    line: row.line,
                    reason: format!("variant {} is not in this stocktake", row.variant_id),
                });
                continue;
            };
            let line = StocktakeLine::new(&item.variant, item.title(), row.counted);
            if by_variant.insert(row.variant_id, line).is_none() {
                order.push(row.variant_id);
            }
        }

        let lines: Vec<StocktakeLine> = order
            .into_iter()
            .filter_map(|variant_id| by_variant.remove(&variant_id))
            .collect();
        let counted = lines.iter().filter(|l| l.counted.is_some()).count();
        let line_count = lines.len();

        session.begin_review(lines)?;
        self.repo.save(&session).await?;
        info!(
            session_id = %session.id,
            lines = line_count,
            counted,
            skipped = skipped.len(),
            "Stocktake uploaded"
        );

        Ok(UploadReport {
            session,
            lines: line_count,
            counted,
            skipped,
        })
    }

    /// Writes one movement per counted line with a non-zero delta and sets
    /// the variant's stock to the counted value. All movements share one
    /// transaction.
    ///
    /// The movement's delta is taken against the locked variant's current
    /// stock, not the upload snapshot, so movements recorded between upload
    /// and post do not leave stock and the ledger sum apart.
    #[instrument(skip(self))]
    pub async fn post(&self, id: Uuid) -> Result<StocktakeSession, ServiceError> {
        let mut session = self.get(id).await?;
        session.ensure_postable()?;

        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let mut applied = Vec::new();
        for line in session.lines.iter().filter(|l| l.is_postable()) {
            let Some(counted) = line.counted else {
                continue;
            };
            let Some(variant) = ledger::lock_variant(&txn, line.variant_id).await? else {
                warn!(variant_id = %line.variant_id, "Stocktake line refers to a deleted variant");
                continue;
            };
            // Measured against stock now, so the ledger sum still lands on `counted`.
            let delta = counted - variant.stock;
            if delta == 0 {
                continue;
            }
            let movement = ledger::append_movement(
                &txn,
                &variant,
                MovementDraft {
                    delta,
                    reason: MovementReason::ManualAdjust,
                    note: Some(session.movement_note()),
                    order_ref: None,
                },
                StockEffect::SetTo(counted),
            )
            .await
            .map_err(|e| log_failure("stocktake_post", e))?;
            applied.push(movement);
        }
        db::commit(txn, started).await?;

        let movements_created = applied.len();
        session.mark_posted(movements_created)?;
        self.repo.save(&session).await?;

        info!(session_id = %session.id, movements_created, "Stocktake posted");
        for movement in &applied {
            self.event_sender
                .send_or_log(Event::StockAdjusted {
                    product_id: movement.product_id,
                    variant_id: movement.variant_id,
                    delta: movement.delta,
                    new_stock: movement.new_stock,
                    reason: movement.reason,
                })
                .await;
        }
        self.event_sender
            .send_or_log(Event::StocktakePosted {
                session_id: session.id,
                movements_created,
            })
            .await;
        Ok(session)
    }

    /// Removes a draft or reviewing session. Ledger rows are untouched.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), ServiceError> {
        let session = self.get(id).await?;
        session.ensure_deletable()?;
        if !self.repo.delete(id).await? {
            return Err(ServiceError::NotFound(format!("Stocktake {} not found", id)));
        }
        info!(session_id = %id, "Stocktake deleted");
        Ok(())
    }
}
