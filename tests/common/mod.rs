#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::json;
use storefront_engine::{
    config::AppConfig,
    db::{self, DbConfig},
    entities::{
        commerce::{coupon, product_variant, CouponKind, CouponModel, CouponStatus, ProductVariant, ProductVariantModel},
        product, ProductStatus,
    },
    events::{Event, EventSender},
    services::{
        commerce::{CartService, CouponService},
        inventory::{
            InventoryLedgerService, SeaOrmStocktakeStore, StocktakeRepository, StocktakeService,
        },
    },
};
use uuid::Uuid;

/// Services over a fresh in-memory SQLite database.
pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub event_sender: Arc<EventSender>,
    events: Arc<Mutex<Vec<Event>>>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(AppConfig::new("sqlite::memory:".to_string(), "test".to_string())).await
    }

    pub async fn with_config(mut cfg: AppConfig) -> Self {
        // One connection, otherwise every pooled connection gets its own memory database.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let db_cfg = DbConfig {
            sqlx_logging: false,
            ..DbConfig::from(&cfg)
        };
        let pool = db::establish_connection_with_config(&db_cfg)
            .await
            .expect("failed to open test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to migrate test database");

        let (sender, mut rx) = EventSender::channel(256);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let event_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.lock().expect("event sink poisoned").push(event);
            }
        });

        Self {
            db: Arc::new(pool),
            config: Arc::new(cfg),
            event_sender: Arc::new(sender),
            events,
            _event_task: event_task,
        }
    }

    pub fn cart_service(&self) -> CartService {
        CartService::new(self.db.clone(), self.event_sender.clone(), self.config.clone())
    }

    pub fn coupon_service(&self) -> CouponService {
        CouponService::new(self.db.clone())
    }

    pub fn ledger(&self) -> InventoryLedgerService {
        InventoryLedgerService::new(self.db.clone(), self.event_sender.clone(), self.config.clone())
    }

    pub fn stocktakes_with(&self, repo: Arc<dyn StocktakeRepository>) -> StocktakeService {
        StocktakeService::new(self.db.clone(), repo, self.event_sender.clone(), self.config.clone())
    }

    pub fn stocktakes(&self) -> StocktakeService {
        self.stocktakes_with(Arc::new(SeaOrmStocktakeStore::new(self.db.clone())))
    }

    /// Events delivered so far. Yields first so the collector can catch up.
    pub async fn events(&self) -> Vec<Event> {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        self.events.lock().expect("event sink poisoned").clone()
    }

    pub async fn create_product(&self, name: &str, base_price: Decimal) -> product::Model {
        self.create_product_with(name, base_price, Decimal::ZERO, ProductStatus::Active, None)
            .await
    }

    pub async fn create_product_with(
        &self,
        name: &str,
        base_price: Decimal,
        discount_percent: Decimal,
        status: ProductStatus,
        sizes: Option<&[&str]>,
    ) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            base_price: Set(base_price),
            discount_percent: Set(discount_percent),
            sizes: Set(sizes.map(|s| json!(s))),
            status: Set(status),
            deleted_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("failed to insert product")
    }

    pub async fn create_variant(
        &self,
        product_id: Uuid,
        color: Option<&str>,
        stock: i32,
        position: i32,
    ) -> ProductVariantModel {
        let now = Utc::now();
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            sku: Set(None),
            color: Set(color.map(str::to_string)),
            images: Set(Some(json!([format!("/img/{}.jpg", position)]))),
            stock: Set(stock),
            position: Set(position),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("failed to insert variant")
    }

    /// Overwrites stock without a ledger row, to simulate drift.
    pub async fn force_stock(&self, variant: &ProductVariantModel, stock: i32) {
        let mut active: product_variant::ActiveModel = variant.clone().into();
        active.stock = Set(stock);
        active.update(&*self.db).await.expect("failed to force stock");
    }

    pub async fn stock_of(&self, variant_id: Uuid) -> i32 {
        ProductVariant::find_by_id(variant_id)
            .one(&*self.db)
            .await
            .expect("variant query failed")
            .expect("variant missing")
            .stock
    }

    pub async fn create_coupon(&self, code: &str, kind: CouponKind, value: Decimal) -> CouponModel {
        self.insert_coupon(code, kind, value, |_| {}).await
    }

    /// Inserts a coupon row directly, bypassing `CouponService` validation.
    pub async fn insert_coupon(
        &self,
        code: &str,
        kind: CouponKind,
        value: Decimal,
        customize: impl FnOnce(&mut coupon::ActiveModel),
    ) -> CouponModel {
        let now = Utc::now();
        let mut active = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_string()),
            title: Set(format!("{} coupon", code)),
            kind: Set(kind),
            value: Set(value),
            min_order_value: Set(None),
            max_discount: Set(None),
            usage_limit: Set(None),
            used_count: Set(0),
            status: Set(CouponStatus::Active),
            start_date: Set(None),
            end_date: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        customize(&mut active);
        active
            .insert(&*self.db)
            .await
            .expect("failed to insert coupon")
    }
}

pub fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::days(days)
}
