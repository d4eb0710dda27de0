use crate::{
    config::AppConfig,
    db,
    entities::commerce::{
        cart, cart_item, Cart, CartItem, CartItemModel, CartModel, Coupon, ProductModel,
    },
    errors::{ErrorKind, ServiceError},
    events::{Event, EventSender},
    services::{
        catalog::{self, VariantMatch, VariantRequest},
        commerce::{
            coupon_evaluator::{self, CartSummary, CouponOutcome, CouponRejection},
            coupon_service,
            pricing_service::{build_cart_data, CartData, PricingRules},
            session::{AppliedCoupon, CartSession},
        },
        inventory::ledger::lock_variant,
        money::{parse_number, round_money, truncate_to_i32},
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, ModelTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Input for adding an item to the cart
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddItemInput {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub color: Option<String>,
    pub size: Option<String>,
    pub quantity: i32,
    pub image: Option<String>,
}

/// Raw quantity change as submitted by the cart page.
///
/// Fields stay strings so that a non-numeric submission can be told apart
/// from an absent one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuantityChange {
    pub action: Option<String>,
    pub quantity: Option<String>,
    pub delta: Option<String>,
}

impl QuantityChange {
    pub fn increase() -> Self {
        Self {
            action: Some("increase".to_string()),
            ..Default::default()
        }
    }

    pub fn decrease() -> Self {
        Self {
            action: Some("decrease".to_string()),
            ..Default::default()
        }
    }

    pub fn set(quantity: i32) -> Self {
        Self {
            action: Some("set".to_string()),
            quantity: Some(quantity.to_string()),
            ..Default::default()
        }
    }

    pub fn delta(delta: i32) -> Self {
        Self {
            delta: Some(delta.to_string()),
            ..Default::default()
        }
    }

    /// New quantity for a line currently at `current`, before clamping.
    ///
    /// Rules, first match wins: increase/decrease, set/update with a
    /// quantity, delta, bare quantity.
    pub fn resolve(&self, current: i32) -> Option<i32> {
        let action = self
            .action
            .as_deref()
            .map(|a| a.trim().to_ascii_lowercase());
        let quantity = self
            .quantity
            .as_deref()
            .and_then(parse_number)
            .map(truncate_to_i32);

        match action.as_deref() {
            Some("increase") => return Some(current.saturating_add(1)),
            Some("decrease") => return Some(current.saturating_sub(1)),
            Some("set") | Some("update") if quantity.is_some() => return quantity,
            _ => {}
        }

        if let Some(delta) = self.delta.as_deref().and_then(parse_number) {
            return Some(current.saturating_add(truncate_to_i32(delta)));
        }

        quantity
    }
}

/// Fresh cart state after a committed mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartUpdate {
    pub cart_id: Uuid,
    /// Line touched by the mutation, if it still exists
    pub item_id: Option<Uuid>,
    pub variant_match: Option<VariantMatch>,
    pub data: CartData,
}

/// Result of a cart mutation. Business rejections are values, not errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CartOutcome {
    Updated(CartUpdate),
    OutOfStock {
        variant_id: Uuid,
        available: i32,
        requested: i32,
    },
    ItemNotFound,
}

impl CartOutcome {
    pub fn updated(&self) -> Option<&CartUpdate> {
        match self {
            CartOutcome::Updated(update) => Some(update),
            _ => None,
        }
    }
}

/// Result of running the coupon evaluator against the persisted cart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponApplication {
    pub cart_id: Uuid,
    pub data: CartData,
    /// Totals after the coupon, or the base totals when nothing applied
    pub summary: CartSummary,
    /// `None` when no coupon was requested or stored
    pub outcome: Option<CouponOutcome>,
}

/// Shopping cart service.
///
/// Every mutation runs in one transaction: resolve or create the cart,
/// change lines, then recompute and persist the cart aggregates. The stock
/// ceiling is checked inside the same transaction as the write.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl CartService {
    /// Creates a new `CartService` instance.
    ///
    /// # Arguments
    ///
    /// * `db` - Database connection pool
    /// * `event_sender` - Event sender for publishing cart events
    /// * `config` - Application configuration (shipping rules, variant policy)
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

    fn pricing_rules(&self) -> PricingRules {
        PricingRules::from(&self.config.pricing)
    }

    /// Returns the visitor's cart without creating one.
    ///
    /// The coupon stored on the cart is evaluated again against the current
    /// lines, so a reload shows the same totals `apply_coupon` returned.
    /// Nothing is written.
    #[instrument(skip(self, session))]
    pub async fn get_cart(&self, session: &CartSession) -> Result<Option<CouponApplication>, ServiceError> {
        let Some(cart) = find_cart(&*self.db, session, false).await? else {
            return Ok(None);
        };
        let lines = load_lines(&*self.db, cart.id).await?;
        let data = build_cart_data(&lines, &self.pricing_rules());
        let base = data.totals.summary();

        let outcome = match cart.coupon_id {
            Some(coupon_id) => Some(match Coupon::find_by_id(coupon_id).one(&*self.db).await? {
                Some(model) => coupon_evaluator::apply_coupon(&base, &model, Utc::now()),
                None => CouponOutcome::no_effect(base, CouponRejection::UnknownCode),
            }),
            None => None,
        };
        let summary = outcome.as_ref().map_or(base, |o| o.summary);

        Ok(Some(CouponApplication {
            cart_id: cart.id,
            data,
            summary,
            outcome,
        }))
    }

    /// Adds an item to the cart or increments the existing line for the same variant.
    ///
    /// # Arguments
    ///
    /// * `session` - Visitor identity; its cart id is rewritten on success
    /// * `input` - Product, optional variant/color, size and quantity
    ///
    /// # Returns
    ///
    /// * `Ok(CartOutcome::Updated)` - The line was added or incremented
    /// * `Ok(CartOutcome::OutOfStock)` - The tracked stock would be exceeded; nothing was written
    /// * `Err(ServiceError)` - Unknown product/variant, unsupported size or a database failure
    #[instrument(skip(self, session), fields(product_id = %input.product_id))]
    pub async fn add_item(
        &self,
        session: &mut CartSession,
        input: AddItemInput,
    ) -> Result<CartOutcome, ServiceError> {
        if input.quantity < 1 {
            return Err(ServiceError::InvalidInput(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let result = self.add_item_in(&txn, session, &input).await;
        self.finish("add_item", txn, started, session, result).await
    }

    async fn add_item_in(
        &self,
        txn: &DatabaseTransaction,
        session: &CartSession,
        input: &AddItemInput,
    ) -> Result<CartOutcome, ServiceError> {
        let cart = ensure_cart(txn, session).await?;
        let product = catalog::find_product(txn, input.product_id).await?;
        if !product.is_sellable() {
            return Err(ServiceError::NotFound(format!(
                "Product {} is not available",
                product.id
            )));
        }

        let resolved = catalog::resolve_variant(
            txn,
            product.id,
            VariantRequest {
                variant_id: input.variant_id,
                color: input.color.as_deref(),
            },
            self.config.inventory.variant_fallback,
        )
        .await?;
        let size = validate_size(&product, input.size.as_deref())?;

        let variant = lock_variant(txn, resolved.variant.id)
            .await?
            .unwrap_or(resolved.variant);

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::VariantId.eq(variant.id))
            .one(txn)
            .await?;

        let requested = existing
            .as_ref()
            .map_or(0, |line| line.quantity)
            .saturating_add(input.quantity);
        if variant.exceeds_stock(requested) {
            info!(
                variant_id = %variant.id,
                available = variant.stock,
                requested,
                "Add to cart rejected: out of stock"
            );
            return Ok(CartOutcome::OutOfStock {
                variant_id: variant.id,
                available: variant.stock,
                requested,
            });
        }

        let now = Utc::now();
        let item_id = match existing {
            Some(line) => {
                let line_id = line.id;
                let needs_size = line.size.is_none();
                let needs_color = line.color.is_none();
                let mut active: cart_item::ActiveModel = line.clone().into();
                apply_line_quantity(&mut active, &line, requested);
                if needs_size && size.is_some() {
                    active.size = Set(size.clone());
                }
                if needs_color && variant.color.is_some() {
                    active.color = Set(variant.color.clone());
                }
                active.updated_at = Set(now);
                active.update(txn).await?;
                line_id
            }
            None => {
                let unit_price = effective_unit_price(&product);
                let subtotal = unit_price * Decimal::from(requested);
                let line = cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product.id),
                    variant_id: Set(variant.id),
                    title: Set(product.name.clone()),
                    quantity: Set(requested),
                    unit_price: Set(unit_price),
                    subtotal: Set(Some(subtotal)),
                    discount: Set(None),
                    line_total: Set(subtotal),
                    size: Set(size.clone()),
                    color: Set(variant.color.clone()),
                    image: Set(input.image.clone().or_else(|| variant.primary_image())),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(txn)
                .await?;
                line.id
            }
        };

        let data = recalculate_cart(txn, &cart, &self.pricing_rules()).await?;
        info!(cart_id = %cart.id, variant_id = %variant.id, quantity = requested, "Cart line added");

        Ok(CartOutcome::Updated(CartUpdate {
            cart_id: cart.id,
            item_id: Some(item_id),
            variant_match: Some(resolved.matched_by),
            data,
        }))
    }

    /// Changes a line's quantity. A resulting quantity of 0 removes the line.
    ///
    /// Fails with `InvalidInput` when no rule of [`QuantityChange::resolve`]
    /// yields a number. Raising the quantity past tracked stock returns
    /// `OutOfStock` and leaves the line unchanged.
    #[instrument(skip(self, session, change))]
    pub async fn update_item_quantity(
        &self,
        session: &mut CartSession,
        item_id: Uuid,
        change: QuantityChange,
    ) -> Result<CartOutcome, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let result = self.update_item_in(&txn, session, item_id, &change).await;
        self.finish("update_item_quantity", txn, started, session, result)
            .await
    }

    async fn update_item_in(
        &self,
        txn: &DatabaseTransaction,
        session: &CartSession,
        item_id: Uuid,
        change: &QuantityChange,
    ) -> Result<CartOutcome, ServiceError> {
        let cart = ensure_cart(txn, session).await?;
        let Some(line) = find_line(txn, cart.id, item_id).await? else {
            return Ok(CartOutcome::ItemNotFound);
        };

        let new_quantity = change
            .resolve(line.quantity)
            .ok_or_else(|| ServiceError::InvalidInput("Quantity must be a number".to_string()))?
            .max(0);

        if new_quantity == 0 {
            line.delete(txn).await?;
            let data = recalculate_cart(txn, &cart, &self.pricing_rules()).await?;
            info!(cart_id = %cart.id, %item_id, "Cart line removed by quantity change");
            return Ok(CartOutcome::Updated(CartUpdate {
                cart_id: cart.id,
                item_id: None,
                variant_match: None,
                data,
            }));
        }

        if new_quantity > line.quantity {
            if let Some(variant) = lock_variant(txn, line.variant_id).await? {
                if variant.exceeds_stock(new_quantity) {
                    info!(
                        variant_id = %variant.id,
                        available = variant.stock,
                        requested = new_quantity,
                        "Quantity change rejected: out of stock"
                    );
                    return Ok(CartOutcome::OutOfStock {
                        variant_id: variant.id,
                        available: variant.stock,
                        requested: new_quantity,
                    });
                }
            }
        }

        let mut active: cart_item::ActiveModel = line.clone().into();
        apply_line_quantity(&mut active, &line, new_quantity);
        active.updated_at = Set(Utc::now());
        active.update(txn).await?;

        let data = recalculate_cart(txn, &cart, &self.pricing_rules()).await?;
        debug!(cart_id = %cart.id, %item_id, quantity = new_quantity, "Cart line quantity updated");

        Ok(CartOutcome::Updated(CartUpdate {
            cart_id: cart.id,
            item_id: Some(item_id),
            variant_match: None,
            data,
        }))
    }

    /// Removes one line from the visitor's cart.
    #[instrument(skip(self, session))]
    pub async fn remove_item(
        &self,
        session: &mut CartSession,
        item_id: Uuid,
    ) -> Result<CartOutcome, ServiceError> {
        self.remove_selected_items(session, &[item_id]).await
    }

    /// Removes every listed line found in the visitor's cart.
    ///
    /// Ids that belong to no line of this cart are ignored as long as at
    /// least one id matched; otherwise the result is `ItemNotFound`.
    #[instrument(skip(self, session), fields(count = item_ids.len()))]
    pub async fn remove_selected_items(
        &self,
        session: &mut CartSession,
        item_ids: &[Uuid],
    ) -> Result<CartOutcome, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let result = self.remove_items_in(&txn, session, item_ids).await;
        self.finish("remove_items", txn, started, session, result).await
    }

    async fn remove_items_in(
        &self,
        txn: &DatabaseTransaction,
        session: &CartSession,
        item_ids: &[Uuid],
    ) -> Result<CartOutcome, ServiceError> {
        if item_ids.is_empty() {
            return Ok(CartOutcome::ItemNotFound);
        }

        let cart = ensure_cart(txn, session).await?;
        let removed = CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::Id.is_in(item_ids.iter().copied()))
            .exec(txn)
            .await?
            .rows_affected;

        if removed == 0 {
            return Ok(CartOutcome::ItemNotFound);
        }

        let data = recalculate_cart(txn, &cart, &self.pricing_rules()).await?;
        info!(cart_id = %cart.id, removed, "Cart lines removed");

        Ok(CartOutcome::Updated(CartUpdate {
            cart_id: cart.id,
            item_id: None,
            variant_match: None,
            data,
        }))
    }

    /// Deletes every line of the visitor's cart. Always succeeds.
    ///
    /// Returns `None` without writing anything when the visitor has no cart.
    #[instrument(skip(self, session))]
    pub async fn clear_cart(&self, session: &mut CartSession) -> Result<Option<CartUpdate>, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let cart = match find_cart(&txn, session, true).await {
            Ok(Some(cart)) => cart,
            Ok(None) => {
                db::rollback(txn, "clear_cart_absent").await?;
                debug!("No cart to clear");
                return Ok(None);
            }
            Err(e) => {
                log_failure("clear_cart", &e);
                return Err(e);
            }
        };
        let result = self.clear_cart_in(&txn, cart).await;
        let outcome = self
            .finish("clear_cart", txn, started, session, result)
            .await?;

        match outcome {
            CartOutcome::Updated(update) => {
                self.event_sender
                    .send_or_log(Event::CartCleared(update.cart_id))
                    .await;
                Ok(Some(update))
            }
            _ => Err(ServiceError::InternalError(
                "clear_cart produced no cart state".to_string(),
            )),
        }
    }

    async fn clear_cart_in(
        &self,
        txn: &DatabaseTransaction,
        cart: CartModel,
    ) -> Result<CartOutcome, ServiceError> {
        let removed = CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(txn)
            .await?
            .rows_affected;

        let data = recalculate_cart(txn, &cart, &self.pricing_rules()).await?;
        info!(cart_id = %cart.id, removed, "Cart cleared");

        Ok(CartOutcome::Updated(CartUpdate {
            cart_id: cart.id,
            item_id: None,
            variant_match: None,
            data,
        }))
    }

    /// Applies the coupon `code` to the visitor's cart and persists the result.
    ///
    /// A code that matches nothing, or a coupon that fails validation, clears
    /// any stored coupon and returns the base totals with the rejection reason.
    #[instrument(skip(self, session))]
    pub async fn apply_coupon(
        &self,
        session: &mut CartSession,
        code: &str,
    ) -> Result<CouponApplication, ServiceError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(ServiceError::ValidationError(
                "Coupon code is required".to_string(),
            ));
        }
        self.run_coupon("apply_coupon", session, CouponSource::Code(code), false)
            .await
    }

    /// Re-evaluates the stored coupon against the current cart for checkout.
    ///
    /// Falls back to the coupon mirrored in the session when the cart row
    /// carries none. Fails with `InvalidOperation` for an empty cart.
    #[instrument(skip(self, session))]
    pub async fn prepare_checkout(
        &self,
        session: &mut CartSession,
    ) -> Result<CouponApplication, ServiceError> {
        let fallback = session.applied_coupon.code().map(str::to_string);
        self.run_coupon(
            "prepare_checkout",
            session,
            CouponSource::Stored { fallback },
            true,
        )
        .await
    }

    /// Drops the cart's coupon and restores base totals.
    #[instrument(skip(self, session))]
    pub async fn remove_coupon(&self, session: &mut CartSession) -> Result<CouponApplication, ServiceError> {
        self.run_coupon("remove_coupon", session, CouponSource::Remove, false)
            .await
    }

    async fn run_coupon(
        &self,
        operation: &'static str,
        session: &mut CartSession,
        source: CouponSource<'_>,
        require_items: bool,
    ) -> Result<CouponApplication, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;

        let result = self
            .run_coupon_in(&txn, session, source, require_items)
            .await;
        let application = match result {
            Ok(application) => application,
            Err(e) => {
                log_failure(operation, &e);
                return Err(e);
            }
        };

        db::commit(txn, started).await?;

        session.cart_id = Some(application.cart_id);
        session.cart = Some(application.data.session.clone());
        session.applied_coupon = match application.outcome.as_ref().and_then(|o| o.coupon_info()) {
            Some(info) => AppliedCoupon::Applied {
                code: info.code.clone(),
                title: info.title.clone(),
                kind: info.kind,
            },
            None => AppliedCoupon::None,
        };

        if let Some(info) = application.outcome.as_ref().and_then(|o| o.coupon_info()) {
            self.event_sender
                .send_or_log(Event::CouponApplied {
                    cart_id: application.cart_id,
                    code: info.code.clone(),
                    discount: info.discount + info.shipping_discount,
                })
                .await;
        }

        Ok(application)
    }

    async fn run_coupon_in(
        &self,
        txn: &DatabaseTransaction,
        session: &CartSession,
        source: CouponSource<'_>,
        require_items: bool,
    ) -> Result<CouponApplication, ServiceError> {
        let cart = ensure_cart(txn, session).await?;
        let lines = load_lines(txn, cart.id).await?;
        if require_items && lines.is_empty() {
            return Err(ServiceError::InvalidOperation("Cart is empty".to_string()));
        }

        let data = build_cart_data(&lines, &self.pricing_rules());
        let base = data.totals.summary();

        // Outer None: no coupon requested. Inner None: the code matched nothing.
        let coupon = match source {
            CouponSource::Code(code) => Some(coupon_service::find_by_code(txn, code).await?),
            CouponSource::Stored { fallback } => match (cart.coupon_id, fallback) {
                (Some(coupon_id), _) => Some(Coupon::find_by_id(coupon_id).one(txn).await?),
                (None, Some(code)) => Some(coupon_service::find_by_code(txn, &code).await?),
                (None, None) => None,
            },
            CouponSource::Remove => None,
        };

        let outcome = coupon.map(|found| match found {
            Some(model) => coupon_evaluator::apply_coupon(&base, &model, Utc::now()),
            None => CouponOutcome::no_effect(base, CouponRejection::UnknownCode),
        });
        let summary = outcome.as_ref().map_or(base, |o| o.summary);

        let mut active: cart::ActiveModel = cart.clone().into();
        match outcome.as_ref().and_then(|o| o.coupon_info()) {
            Some(info) => {
                active.coupon_id = Set(Some(info.coupon_id));
                active.coupon_code = Set(Some(info.code.clone()));
            }
            None => {
                active.coupon_id = Set(None);
                active.coupon_code = Set(None);
            }
        }
        active.shipping_fee = Set(summary.shipping);
        active.grand_total = Set(summary.total);
        active.updated_at = Set(Utc::now());
        active.update(txn).await?;

        if let Some(reason) = outcome.as_ref().and_then(|o| o.rejection()) {
            info!(cart_id = %cart.id, %reason, "Coupon had no effect");
        }

        Ok(CouponApplication {
            cart_id: cart.id,
            data,
            summary,
            outcome,
        })
    }

    /// Transaction boundary shared by the line mutations: commit and publish
    /// on `Updated`, roll back on a business rejection or an error.
    async fn finish(
        &self,
        operation: &'static str,
        txn: DatabaseTransaction,
        started: Instant,
        session: &mut CartSession,
        result: Result<CartOutcome, ServiceError>,
    ) -> Result<CartOutcome, ServiceError> {
        match result {
            Ok(CartOutcome::Updated(update)) => {
                db::commit(txn, started).await?;

                session.cart_id = Some(update.cart_id);
                session.cart = Some(update.data.session.clone());

                self.event_sender
                    .send_or_log(Event::CartUpdated {
                        cart_id: update.cart_id,
                        quantity: update.data.totals.quantity,
                        grand_total: update.data.totals.total,
                    })
                    .await;
                Ok(CartOutcome::Updated(update))
            }
            Ok(rejected) => {
                db::rollback(txn, operation).await?;
                Ok(rejected)
            }
            Err(e) => {
                log_failure(operation, &e);
                // Dropping the transaction rolls it back.
                drop(txn);
                Err(e)
            }
        }
    }
}

enum CouponSource<'a> {
    Code(&'a str),
    Stored { fallback: Option<String> },
    Remove,
}

fn log_failure(operation: &str, e: &ServiceError) {
    match e.kind() {
        ErrorKind::Persistence | ErrorKind::Internal => {
            error!(operation, error = %e, "Cart transaction failed and was rolled back")
        }
        _ => debug!(operation, error = %e, "Cart request rejected"),
    }
}

/// `round(base_price * (100 - discount_percent) / 100)`, floored at zero.
pub fn effective_unit_price(product: &ProductModel) -> Decimal {
    let factor = Decimal::ONE_HUNDRED - product.discount_percent;
    round_money(product.base_price * factor / Decimal::ONE_HUNDRED).max(Decimal::ZERO)
}

/// Checks `requested` against the product's declared sizes and returns the
/// canonical spelling. Either side being empty skips the check.
pub fn validate_size(product: &ProductModel, requested: Option<&str>) -> Result<Option<String>, ServiceError> {
    let Some(requested) = requested.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let declared = product.declared_sizes();
    if declared.is_empty() {
        return Ok(Some(requested.to_string()));
    }

    declared
        .into_iter()
        .find(|s| s.eq_ignore_ascii_case(requested))
        .map(Some)
        .ok_or_else(|| {
            ServiceError::ValidationError(format!("Size {} is not offered for this product", requested))
        })
}

fn apply_line_quantity(active: &mut cart_item::ActiveModel, line: &CartItemModel, quantity: i32) {
    let subtotal = line.unit_price * Decimal::from(quantity);
    let discount = line.discount.unwrap_or(Decimal::ZERO).max(Decimal::ZERO);
    active.quantity = Set(quantity);
    active.subtotal = Set(Some(subtotal));
    active.line_total = Set((subtotal - discount).max(Decimal::ZERO));
}

async fn find_line<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
    item_id: Uuid,
) -> Result<Option<CartItemModel>, ServiceError> {
    Ok(CartItem::find_by_id(item_id)
        .filter(cart_item::Column::CartId.eq(cart_id))
        .one(conn)
        .await?)
}

/// Lines of a cart in the order they were added.
pub async fn load_lines<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Vec<CartItemModel>, ServiceError> {
    Ok(CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .order_by_asc(cart_item::Column::Id)
        .all(conn)
        .await?)
}

/// Existing cart for `session`: the token-owned cart first, then the cookie
/// cart if it is anonymous or owned by the same token.
async fn find_cart<C: ConnectionTrait>(
    conn: &C,
    session: &CartSession,
    lock: bool,
) -> Result<Option<CartModel>, ServiceError> {
    let token = session
        .user_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());

    if let Some(token) = token {
        let query = Cart::find()
            .filter(cart::Column::UserToken.eq(token))
            .order_by_desc(cart::Column::UpdatedAt);
        let query = if lock { db::for_update(query, conn) } else { query };
        if let Some(owned) = query.one(conn).await? {
            return Ok(Some(owned));
        }
    }

    if let Some(cart_id) = session.cart_id {
        let query = Cart::find().filter(cart::Column::Id.eq(cart_id));
        let query = if lock { db::for_update(query, conn) } else { query };
        if let Some(cookie_cart) = query.one(conn).await? {
            let usable = match (&cookie_cart.user_token, token) {
                (None, _) => true,
                (Some(owner), Some(token)) => owner == token,
                (Some(_), None) => false,
            };
            if usable {
                return Ok(Some(cookie_cart));
            }
        }
    }

    Ok(None)
}

/// Looks up or creates the cart for `session`.
///
/// A token-owned cart wins over the cookie cart. An anonymous cookie cart
/// is adopted by the token when the user has no cart of their own.
pub async fn ensure_cart<C: ConnectionTrait>(
    conn: &C,
    session: &CartSession,
) -> Result<CartModel, ServiceError> {
    let token = session
        .user_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    if let Some(cart) = find_cart(conn, session, true).await? {
        if session.cart_id.is_some_and(|id| id != cart.id) {
            debug!(cart_id = %cart.id, "Re-anchoring session to token-owned cart");
        }
        if cart.user_token.is_none() && token.is_some() {
            let mut active: cart::ActiveModel = cart.into();
            active.user_token = Set(token);
            active.updated_at = Set(Utc::now());
            return Ok(active.update(conn).await?);
        }
        return Ok(cart);
    }

    let now = Utc::now();
    let cart = cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_token: Set(token),
        shipping_fee: Set(Decimal::ZERO),
        coupon_id: Set(None),
        coupon_code: Set(None),
        grand_total: Set(Decimal::ZERO),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;

    info!("Created cart: {}", cart.id);
    Ok(cart)
}

/// Recomputes the cart's aggregates from its lines and persists them.
///
/// Writes the base totals: `grand_total = sum(line_total) + shipping_fee`.
/// The coupon reference is kept; coupon effects are re-applied at checkout.
pub async fn recalculate_cart<C: ConnectionTrait>(
    conn: &C,
    cart: &CartModel,
    rules: &PricingRules,
) -> Result<CartData, ServiceError> {
    let lines = load_lines(conn, cart.id).await?;
    let data = build_cart_data(&lines, rules);

    let mut active: cart::ActiveModel = cart.clone().into();
    active.shipping_fee = Set(data.totals.shipping);
    active.grand_total = Set(data.totals.total);
    active.updated_at = Set(Utc::now());
    active.update(conn).await?;

    Ok(data)
}
