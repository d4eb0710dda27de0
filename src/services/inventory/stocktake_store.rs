//! Where stocktake sessions live between requests.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, QueryOrder, Set};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::stocktake::{PostedSnapshot, StocktakeLine, StocktakeSession};
use crate::config::{InventoryConfig, StocktakeStoreKind};
use crate::entities::stocktake_session;
use crate::errors::ServiceError;

#[async_trait]
pub trait StocktakeRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<StocktakeSession>, ServiceError>;
    /// Newest first
    async fn list(&self) -> Result<Vec<StocktakeSession>, ServiceError>;
    /// Inserts or replaces by id.
    async fn save(&self, session: &StocktakeSession) -> Result<(), ServiceError>;
    /// Returns whether a session was removed.
    async fn delete(&self, id: Uuid) -> Result<bool, ServiceError>;
}

/// Builds the store selected in configuration.
pub fn stocktake_repository(
    config: &InventoryConfig,
    db: Arc<DatabaseConnection>,
) -> Arc<dyn StocktakeRepository> {
    match config.stocktake_store {
        StocktakeStoreKind::File => Arc::new(JsonFileStocktakeStore::new(config.stocktake_store_path.clone())),
        StocktakeStoreKind::Database => Arc::new(SeaOrmStocktakeStore::new(db)),
    }
}

fn sort_newest_first(sessions: &mut [StocktakeSession]) {
    sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// All sessions in one JSON array on disk.
///
/// Every write rewrites the file through a temporary sibling and a rename.
/// The mutex serializes writers inside this process only.
pub struct JsonFileStocktakeStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStocktakeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<StocktakeSession>, ServiceError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, sessions: &[StocktakeSession]) -> Result<(), ServiceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(sessions)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), sessions = sessions.len(), "Stocktake file written");
        Ok(())
    }
}

#[async_trait]
impl StocktakeRepository for JsonFileStocktakeStore {
    async fn get(&self, id: Uuid) -> Result<Option<StocktakeSession>, ServiceError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.into_iter().find(|s| s.id == id))
    }

    async fn list(&self) -> Result<Vec<StocktakeSession>, ServiceError> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.read_all().await?;
        sort_newest_first(&mut sessions);
        Ok(sessions)
    }

    async fn save(&self, session: &StocktakeSession) -> Result<(), ServiceError> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.read_all().await?;
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => sessions.push(session.clone()),
        }
        self.write_all(&sessions).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool, ServiceError> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.read_all().await?;
        let before = sessions.len();
        sessions.retain(|s| s.id != id);
        if sessions.len() == before {
            return Ok(false);
        }
        self.write_all(&sessions).await?;
        Ok(true)
    }
}

/// Sessions in the `stocktake_sessions` table.
pub struct SeaOrmStocktakeStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmStocktakeStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

impl TryFrom<stocktake_session::Model> for StocktakeSession {
    type Error = ServiceError;

    fn try_from(model: stocktake_session::Model) -> Result<Self, Self::Error> {
        let lines: Vec<StocktakeLine> = match model.lines {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };
        let posted: Option<PostedSnapshot> = match model.posted {
            Some(value) => Some(serde_json::from_value(value)?),
            None => None,
        };
        Ok(Self {
            id: model.id,
            name: model.name,
            status: model.status,
            scope: model.scope,
            created_at: model.created_at,
            updated_at: model.updated_at,
            lines,
            posted,
        })
    }
}

#[async_trait]
impl StocktakeRepository for SeaOrmStocktakeStore {
    async fn get(&self, id: Uuid) -> Result<Option<StocktakeSession>, ServiceError> {
        stocktake_session::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .map(StocktakeSession::try_from)
            .transpose()
    }

    async fn list(&self) -> Result<Vec<StocktakeSession>, ServiceError> {
        stocktake_session::Entity::find()
            .order_by_desc(stocktake_session::Column::CreatedAt)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(StocktakeSession::try_from)
            .collect()
    }

    async fn save(&self, session: &StocktakeSession) -> Result<(), ServiceError> {
        let lines = if session.lines.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&session.lines)?)
        };
        let posted = session.posted.as_ref().map(serde_json::to_value).transpose()?;

        let exists = stocktake_session::Entity::find_by_id(session.id)
            .one(&*self.db)
            .await?
            .is_some();
        let active = stocktake_session::ActiveModel {
            id: Set(session.id),
            name: Set(session.name.clone()),
            status: Set(session.status),
            scope: Set(session.scope),
            lines: Set(lines),
            posted: Set(posted),
            created_at: Set(session.created_at),
            updated_at: Set(Utc::now()),
        };
        if exists {
            active.update(&*self.db).await?;
        } else {
            active.insert(&*self.db).await?;
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, ServiceError> {
        let result = stocktake_session::Entity::delete_by_id(id)
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::StocktakeScope;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let store = JsonFileStocktakeStore::new(dir.path().join("nested/sessions.json"));
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
        assert!(!store.delete(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn file_store_saves_replaces_and_deletes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data/sessions.json");
        let store = JsonFileStocktakeStore::new(&path);

        let mut first = StocktakeSession::new("First", StocktakeScope::All).unwrap();
        let second = StocktakeSession::new("Second", StocktakeScope::Low).unwrap();
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        first.name = "Renamed".to_string();
        store.save(&first).await.unwrap();

        let reopened = JsonFileStocktakeStore::new(&path);
        let listed = reopened.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(reopened.get(first.id).await.unwrap().unwrap().name, "Renamed");

        assert!(reopened.delete(second.id).await.unwrap());
        assert_eq!(reopened.list().await.unwrap().len(), 1);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
