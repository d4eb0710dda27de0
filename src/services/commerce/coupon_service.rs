use crate::{
    entities::commerce::{coupon, Coupon, CouponKind, CouponModel, CouponStatus},
    errors::ServiceError,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, Func},
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Input for creating a coupon
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateCouponInput {
    #[validate(length(min = 1, max = 64, message = "Coupon code must be 1-64 characters"))]
    pub code: String,
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    pub kind: CouponKind,
    pub value: Decimal,
    pub min_order_value: Option<Decimal>,
    pub max_discount: Option<Decimal>,
    #[validate(range(min = 1))]
    pub usage_limit: Option<i32>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// Looks a coupon up by code, ignoring case. Status and window are not
/// checked here; the evaluator reports those as rejection reasons.
pub async fn find_by_code<C: ConnectionTrait>(
    conn: &C,
    code: &str,
) -> Result<Option<CouponModel>, ServiceError> {
    let normalized = code.trim().to_lowercase();
    if normalized.is_empty() {
        return Ok(None);
    }

    Coupon::find()
        .filter(
            Expr::expr(Func::lower(Expr::col((coupon::Entity, coupon::Column::Code))))
                .eq(normalized),
        )
        .one(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Increments `used_count` unless the usage limit is already reached.
///
/// The guard lives in the UPDATE itself so two concurrent redemptions cannot
/// both take the last use.
pub async fn redeem_in<C: ConnectionTrait>(conn: &C, coupon_id: Uuid) -> Result<(), ServiceError> {
    let result = Coupon::update_many()
        .col_expr(
            coupon::Column::UsedCount,
            Expr::col(coupon::Column::UsedCount).add(1),
        )
        .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(coupon::Column::Id.eq(coupon_id))
        .filter(
            coupon::Column::UsageLimit
                .is_null()
                .or(Expr::col(coupon::Column::UsedCount).lt(Expr::col(coupon::Column::UsageLimit))),
        )
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        let exists = Coupon::find_by_id(coupon_id).one(conn).await?.is_some();
        return Err(if exists {
            warn!(%coupon_id, "Coupon usage limit reached");
            ServiceError::InvalidOperation("Coupon usage limit reached".to_string())
        } else {
            ServiceError::NotFound(format!("Coupon {} not found", coupon_id))
        });
    }

    Ok(())
}

#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Creates a coupon. Codes are stored upper-cased and must be unique.
    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_coupon(&self, input: CreateCouponInput) -> Result<CouponModel, ServiceError> {
        input.validate()?;
        if let (Some(start), Some(end)) = (input.start_date, input.end_date) {
            if end < start {
                return Err(ServiceError::ValidationError(
                    "end_date must not precede start_date".to_string(),
                ));
            }
        }
        if input.kind == CouponKind::Percent && input.value > Decimal::ONE_HUNDRED {
            return Err(ServiceError::ValidationError(
                "Percent coupons cannot exceed 100".to_string(),
            ));
        }

        let code = input.code.trim().to_uppercase();
        if find_by_code(&*self.db, &code).await?.is_some() {
            return Err(ServiceError::InvalidOperation(format!(
                "Coupon code {} already exists",
                code
            )));
        }

        let now = Utc::now();
        let model = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.clone()),
            title: Set(input.title),
            kind: Set(input.kind),
            value: Set(input.value),
            min_order_value: Set(input.min_order_value),
            max_discount: Set(input.max_discount),
            usage_limit: Set(input.usage_limit),
            used_count: Set(0),
            status: Set(CouponStatus::Active),
            start_date: Set(input.start_date),
            end_date: Set(input.end_date),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!("Created coupon {}", code);
        Ok(model)
    }

    /// Finds a coupon by code (case-insensitive)
    pub async fn find_by_code(&self, code: &str) -> Result<Option<CouponModel>, ServiceError> {
        find_by_code(&*self.db, code).await
    }

    /// Records one use of the coupon when an order is placed.
    #[instrument(skip(self))]
    pub async fn redeem(&self, coupon_id: Uuid) -> Result<(), ServiceError> {
        redeem_in(&*self.db, coupon_id).await?;
        info!(%coupon_id, "Coupon redeemed");
        Ok(())
    }

    /// Switches a coupon off without deleting it.
    pub async fn deactivate(&self, coupon_id: Uuid) -> Result<CouponModel, ServiceError> {
        let existing = Coupon::find_by_id(coupon_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Coupon {} not found", coupon_id)))?;

        let mut active: coupon::ActiveModel = existing.into();
        active.status = Set(CouponStatus::Inactive);
        active.updated_at = Set(Utc::now());
        Ok(active.update(&*self.db).await?)
    }
}
