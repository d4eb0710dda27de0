use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Purchasable variation of a product (usually one per color)
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "product_variants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    #[sea_orm(nullable)]
    pub sku: Option<String>,
    #[sea_orm(nullable)]
    pub color: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub images: Option<Json>, // Vec<String> serialized
    /// On-hand quantity. Zero or negative means the variant is not tracked.
    pub stock: i32,
    pub position: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::super::product::Entity",
        from = "Column::ProductId",
        to = "super::super::product::Column::Id"
    )]
    Product,
    #[sea_orm(has_many = "crate::entities::inventory_movement::Entity")]
    Movements,
}

impl Related<super::super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl Related<crate::entities::inventory_movement::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Movements.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// First image URL, used as the cart line thumbnail.
    pub fn primary_image(&self) -> Option<String> {
        self.images
            .as_ref()
            .and_then(|v| v.as_array())
            .and_then(|images| images.first())
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Whether `requested` units exceed a tracked stock level.
    pub fn exceeds_stock(&self, requested: i32) -> bool {
        self.stock > 0 && requested > self.stock
    }
}
