use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

use super::csv;
use super::ledger::{BulkAdjustReport, BulkAdjustRow, InventoryLedgerService, SkippedRow};
use crate::errors::ServiceError;

/// Parsed upload waiting for the caller to confirm it.
#[derive(Debug, Clone)]
pub struct BulkPreview {
    pub rows: Vec<BulkAdjustRow>,
    pub skipped: Vec<SkippedRow>,
    created_at: Instant,
}

impl BulkPreview {
    fn new(rows: Vec<BulkAdjustRow>, skipped: Vec<SkippedRow>) -> Self {
        Self {
            rows,
            skipped,
            created_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }
}

/// What the caller sees before committing.
#[derive(Debug, Clone, Serialize)]
pub struct BulkPreviewSummary {
    pub rows: usize,
    pub net_delta: rust_decimal::Decimal,
    pub skipped: Vec<SkippedRow>,
}

impl From<&BulkPreview> for BulkPreviewSummary {
    fn from(preview: &BulkPreview) -> Self {
        Self {
            rows: preview.rows.len(),
            net_delta: csv::net_delta(&preview.rows),
            skipped: preview.skipped.clone(),
        }
    }
}

/// Pending previews keyed by owner (session id, request id or user).
///
/// Each owner has at most one preview. Staging again replaces it.
pub struct BulkPreviewCache {
    entries: DashMap<String, BulkPreview>,
    ttl: Duration,
}

impl BulkPreviewCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Stores `preview` for `owner` and evicts every expired preview, so
    /// owners that never commit do not accumulate.
    pub fn stage(&self, owner: &str, preview: BulkPreview) {
        let purged = self.purge_expired();
        if purged > 0 {
            debug!(purged, "Expired bulk previews evicted");
        }
        self.entries.insert(owner.to_string(), preview);
    }

    pub fn peek(&self, owner: &str) -> Option<BulkPreview> {
        let expired = match self.entries.get(owner) {
            Some(entry) if !entry.is_expired(self.ttl) => return Some(entry.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(owner);
        }
        None
    }

    /// Removes and returns the owner's preview if it has not expired.
    pub fn take(&self, owner: &str) -> Option<BulkPreview> {
        self.entries
            .remove(owner)
            .map(|(_, preview)| preview)
            .filter(|preview| !preview.is_expired(self.ttl))
    }

    pub fn discard(&self, owner: &str) -> bool {
        self.entries.remove(owner).is_some()
    }

    /// Drops every expired preview and returns how many went.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, preview| !preview.is_expired(self.ttl));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Two step bulk adjustment: upload a CSV to preview it, then commit.
#[derive(Clone)]
pub struct BulkAdjustService {
    ledger: InventoryLedgerService,
    previews: Arc<BulkPreviewCache>,
}

impl BulkAdjustService {
    pub fn new(ledger: InventoryLedgerService, previews: Arc<BulkPreviewCache>) -> Self {
        Self { ledger, previews }
    }

    #[instrument(skip(self, text), fields(bytes = text.len()))]
    pub async fn preview(&self, owner: &str, text: &str) -> Result<BulkPreviewSummary, ServiceError> {
        let parsed = csv::parse_bulk_adjust(text)?;
        let preview = BulkPreview::new(parsed.rows, parsed.skipped);
        let summary = BulkPreviewSummary::from(&preview);
        self.previews.stage(owner, preview);
        debug!(owner, rows = summary.rows, skipped = summary.skipped.len(), "Bulk preview staged");
        Ok(summary)
    }

    /// Applies the owner's staged preview. It can be committed only once.
    #[instrument(skip(self))]
    pub async fn commit(&self, owner: &str) -> Result<BulkAdjustReport, ServiceError> {
        let preview = self.previews.take(owner).ok_or_else(|| {
            ServiceError::NotFound("No pending bulk adjustment preview".to_string())
        })?;
        let parse_skipped = preview.skipped;
        let mut report = self.ledger.bulk_adjust(preview.rows).await?;
        report.skipped.splice(0..0, parse_skipped);
        info!(owner, applied = report.applied.len(), "Bulk preview committed");
        Ok(report)
    }

    pub fn cancel(&self, owner: &str) -> bool {
        self.previews.discard(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::MovementReason;
    use uuid::Uuid;

    fn preview(rows: usize) -> BulkPreview {
        let rows = (0..rows)
            .map(|i| BulkAdjustRow {
                line: i + 2,
                product_id: Uuid::new_v4(),
                variant_id: None,
                delta: 1,
                reason: MovementReason::ManualImport,
                note: None,
            })
            .collect();
        BulkPreview::new(rows, Vec::new())
    }

    #[test]
    fn previews_are_scoped_per_owner() {
        let cache = BulkPreviewCache::new(Duration::from_secs(60));
        cache.stage("alice", preview(2));
        cache.stage("bob", preview(1));

        assert_eq!(cache.take("alice").unwrap().rows.len(), 2);
        assert!(cache.take("alice").is_none());
        assert_eq!(cache.peek("bob").unwrap().rows.len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn restaging_replaces_the_preview() {
        let cache = BulkPreviewCache::new(Duration::from_secs(60));
        cache.stage("alice", preview(2));
        cache.stage("alice", preview(5));
        assert_eq!(cache.take("alice").unwrap().rows.len(), 5);
    }

    #[test]
    fn expired_previews_are_not_returned() {
        let cache = BulkPreviewCache::new(Duration::ZERO);
        cache.stage("alice", preview(1));
        assert!(cache.peek("alice").is_none());
        assert!(cache.is_empty());

        cache.stage("alice", preview(1));
        // Staging bob evicts alice's expired preview.
        cache.stage("bob", preview(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.take("alice").is_none());
    }

    #[test]
    fn staging_evicts_abandoned_previews() {
        let cache = BulkPreviewCache::new(Duration::from_millis(200));
        for i in 0..25 {
            cache.stage(&format!("visitor-{}", i), preview(1));
        }
        assert_eq!(cache.len(), 25);

        std::thread::sleep(Duration::from_millis(300));
        cache.stage("late", preview(3));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.take("late").unwrap().rows.len(), 3);
    }

    #[test]
    fn discard_reports_whether_anything_was_pending() {
        let cache = BulkPreviewCache::new(Duration::from_secs(60));
        assert!(!cache.discard("alice"));
        cache.stage("alice", preview(1));
        assert!(cache.discard("alice"));
    }
}
