//! Product and variant lookups shared by the cart and the inventory ledger.

use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::VariantFallbackPolicy;
use crate::entities::commerce::{product_variant, Product, ProductModel, ProductVariant, ProductVariantModel};
use crate::errors::ServiceError;

/// How a variant was picked for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantMatch {
    Explicit,
    ColorMatch,
    FirstVariantFallback,
}

#[derive(Debug, Clone)]
pub struct ResolvedVariant {
    pub variant: ProductVariantModel,
    pub matched_by: VariantMatch,
}

/// What the caller asked for.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariantRequest<'a> {
    pub variant_id: Option<Uuid>,
    pub color: Option<&'a str>,
}

pub async fn find_product<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<ProductModel, ServiceError> {
    Product::find_by_id(product_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
}

/// Variants of `product_id` in display order.
pub async fn variants_of<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<Vec<ProductVariantModel>, ServiceError> {
    Ok(ProductVariant::find()
        .filter(product_variant::Column::ProductId.eq(product_id))
        .order_by_asc(product_variant::Column::Position)
        .order_by_asc(product_variant::Column::CreatedAt)
        .all(conn)
        .await?)
}

/// Picks the variant for `request`: explicit id, then a case-insensitive color
/// match, then the first variant if `policy` allows it.
///
/// Falling back is unambiguous for single-variant products. For products with
/// several variants it is a guess, logged at warn.
pub async fn resolve_variant<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    request: VariantRequest<'_>,
    policy: VariantFallbackPolicy,
) -> Result<ResolvedVariant, ServiceError> {
    let variants = variants_of(conn, product_id).await?;
    if variants.is_empty() {
        return Err(ServiceError::NotFound(format!(
            "Product {} has no variants",
            product_id
        )));
    }

    if let Some(variant_id) = request.variant_id {
        return variants
            .into_iter()
            .find(|v| v.id == variant_id)
            .map(|variant| ResolvedVariant {
                variant,
                matched_by: VariantMatch::Explicit,
            })
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Variant {} not found for product {}",
                    variant_id, product_id
                ))
            });
    }

    if let Some(color) = request.color.map(str::trim).filter(|c| !c.is_empty()) {
        if let Some(pos) = variants.iter().position(|v| {
            v.color
                .as_deref()
                .is_some_and(|vc| vc.trim().eq_ignore_ascii_case(color))
        }) {
            let variant = variants.into_iter().nth(pos).ok_or_else(|| {
                ServiceError::InternalError("variant index out of range".to_string())
            })?;
            return Ok(ResolvedVariant {
                variant,
                matched_by: VariantMatch::ColorMatch,
            });
        }
    }

    let candidates = variants.len();
    if candidates > 1 && policy == VariantFallbackPolicy::Reject {
        return Err(ServiceError::NotFound(format!(
            "No variant of product {} matches the request",
            product_id
        )));
    }

    let variant = variants
        .into_iter()
        .next()
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} has no variants", product_id)))?;

    if candidates > 1 {
        warn!(
            %product_id,
            variant_id = %variant.id,
            candidates,
            requested_color = ?request.color,
            "Falling back to first variant of a multi-variant product"
        );
    } else {
        debug!(%product_id, variant_id = %variant.id, "Using the only variant");
    }

    Ok(ResolvedVariant {
        variant,
        matched_by: VariantMatch::FirstVariantFallback,
    })
}
