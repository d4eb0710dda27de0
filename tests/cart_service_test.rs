mod common;

use assert_matches::assert_matches;
use common::TestApp;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use storefront_engine::{
    config::{AppConfig, VariantFallbackPolicy},
    entities::{commerce::{Cart, CartItem, CouponKind}, ProductStatus},
    errors::ServiceError,
    events::Event,
    services::{
        catalog::VariantMatch,
        commerce::{AddItemInput, AppliedCoupon, CartOutcome, CartSession, CartUpdate, QuantityChange},
    },
};
use uuid::Uuid;

fn add(product_id: Uuid, variant_id: Option<Uuid>, quantity: i32) -> AddItemInput {
    AddItemInput {
        product_id,
        variant_id,
        quantity,
        ..Default::default()
    }
}

fn updated(outcome: CartOutcome) -> CartUpdate {
    match outcome {
        CartOutcome::Updated(update) => update,
        other => panic!("expected an updated cart, got {:?}", other),
    }
}

/// Persisted cart row agrees with its lines.
async fn assert_cart_consistent(app: &TestApp, cart_id: Uuid) {
    let cart = Cart::find_by_id(cart_id)
        .one(&*app.db)
        .await
        .unwrap()
        .expect("cart row missing");
    let lines = CartItem::find().all(&*app.db).await.unwrap();
    let lines: Vec<_> = lines.into_iter().filter(|l| l.cart_id == cart_id).collect();

    let line_sum: Decimal = lines.iter().map(|l| l.line_total).sum();
    let quantity: i32 = lines.iter().map(|l| l.quantity).sum();
    let expected_shipping = if quantity == 0 || line_sum >= dec!(500000) {
        dec!(0)
    } else {
        dec!(30000)
    };
    assert_eq!(cart.shipping_fee, expected_shipping);
    assert_eq!(cart.grand_total, line_sum + cart.shipping_fee);
}

#[tokio::test]
async fn test_add_increase_and_freeship_coupon() {
    let app = TestApp::new().await;
    let service = app.cart_service();
    let product = app.create_product("Linen shirt", dec!(100000)).await;
    let variant = app.create_variant(product.id, Some("White"), 10, 0).await;
    app.create_coupon("FREESHIP10", CouponKind::Freeship, dec!(0)).await;

    let mut session = CartSession::default();
    let first = updated(
        service
            .add_item(&mut session, add(product.id, Some(variant.id), 3))
            .await
            .unwrap(),
    );
    assert_eq!(first.variant_match, Some(VariantMatch::Explicit));
    assert_eq!(first.data.totals.subtotal, dec!(300000));
    assert_eq!(first.data.totals.shipping, dec!(30000));
    assert_eq!(first.data.totals.total, dec!(330000));
    assert_eq!(session.cart_id, Some(first.cart_id));
    assert_eq!(session.cart.as_ref().unwrap().quantity, 3);

    let item_id = first.item_id.unwrap();
    let second = updated(
        service
            .update_item_quantity(&mut session, item_id, QuantityChange::increase())
            .await
            .unwrap(),
    );
    assert_eq!(second.data.totals.quantity, 4);
    assert_eq!(second.data.totals.subtotal, dec!(400000));
    assert_eq!(second.data.totals.shipping, dec!(30000));
    assert_eq!(second.data.totals.total, dec!(430000));

    let applied = service.apply_coupon(&mut session, "freeship10").await.unwrap();
    assert_eq!(applied.summary.shipping, dec!(0));
    assert_eq!(applied.summary.total, dec!(400000));
    let info = applied.outcome.as_ref().and_then(|o| o.coupon_info()).unwrap();
    assert_eq!(info.code, "FREESHIP10");
    assert_eq!(info.shipping_discount, dec!(30000));
    assert_matches!(&session.applied_coupon, AppliedCoupon::Applied { code, .. } if code == "FREESHIP10");

    let cart = Cart::find_by_id(first.cart_id).one(&*app.db).await.unwrap().unwrap();
    assert_eq!(cart.grand_total, dec!(400000));
    assert_eq!(cart.shipping_fee, dec!(0));
    assert_eq!(cart.coupon_code.as_deref(), Some("FREESHIP10"));

    let events = app.events().await;
    assert!(events.iter().any(|e| matches!(e, Event::CouponApplied { code, .. } if code == "FREESHIP10")));
    assert_eq!(
        events.iter().filter(|e| matches!(e, Event::CartUpdated { .. })).count(),
        2
    );
}

#[tokio::test]
async fn test_stock_ceiling_leaves_cart_untouched() {
    let app = TestApp::new().await;
    let service = app.cart_service();
    let product = app.create_product("Cap", dec!(50000)).await;
    let variant = app.create_variant(product.id, None, 5, 0).await;

    let mut session = CartSession::default();
    let outcome = service
        .add_item(&mut session, add(product.id, Some(variant.id), 6))
        .await
        .unwrap();
    assert_matches!(
        outcome,
        CartOutcome::OutOfStock { available: 5, requested: 6, .. }
    );
    assert_eq!(session.cart_id, None);
    assert!(CartItem::find().all(&*app.db).await.unwrap().is_empty());
    assert!(Cart::find().all(&*app.db).await.unwrap().is_empty());

    let first = updated(
        service
            .add_item(&mut session, add(product.id, Some(variant.id), 3))
            .await
            .unwrap(),
    );
    let outcome = service
        .add_item(&mut session, add(product.id, Some(variant.id), 3))
        .await
        .unwrap();
    assert_matches!(outcome, CartOutcome::OutOfStock { requested: 6, .. });

    let outcome = service
        .update_item_quantity(&mut session, first.item_id.unwrap(), QuantityChange::set(6))
        .await
        .unwrap();
    assert_matches!(outcome, CartOutcome::OutOfStock { requested: 6, .. });

    let lines = CartItem::find().all(&*app.db).await.unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].quantity, 3);
    assert_cart_consistent(&app, first.cart_id).await;
}

#[tokio::test]
async fn test_untracked_stock_has_no_ceiling() {
    let app = TestApp::new().await;
    let service = app.cart_service();
    let product = app.create_product("Gift card", dec!(200000)).await;
    let variant = app.create_variant(product.id, None, 0, 0).await;

    let mut session = CartSession::default();
    let update = updated(
        service
            .add_item(&mut session, add(product.id, Some(variant.id), 40))
            .await
            .unwrap(),
    );
    assert_eq!(update.data.totals.quantity, 40);
    assert_eq!(update.data.totals.shipping, dec!(0));
}

#[tokio::test]
async fn test_same_variant_merges_into_one_line() {
    let app = TestApp::new().await;
    let service = app.cart_service();
    let product = app
        .create_product_with("Tee", dec!(199000), dec!(15), ProductStatus::Active, Some(&["S", "M"]))
        .await;
    let variant = app.create_variant(product.id, Some("Black"), 20, 0).await;

    let mut session = CartSession::default();
    service
        .add_item(&mut session, add(product.id, Some(variant.id), 1))
        .await
        .unwrap();
    let mut input = add(product.id, Some(variant.id), 2);
    input.size = Some("m".to_string());
    let update = updated(service.add_item(&mut session, input).await.unwrap());

    assert_eq!(update.data.items.len(), 1);
    let line = &update.data.items[0];
    assert_eq!(line.quantity, 3);
    assert_eq!(line.unit_price, dec!(169150));
    assert_eq!(line.subtotal, dec!(507450));
    assert_eq!(line.size.as_deref(), Some("M"));
    assert_eq!(line.color.as_deref(), Some("Black"));
    assert_eq!(line.image.as_deref(), Some("/img/0.jpg"));
    assert_eq!(update.data.totals.shipping, dec!(0));
    assert_cart_consistent(&app, update.cart_id).await;
}

#[tokio::test]
async fn test_size_and_product_availability_are_validated() {
    let app = TestApp::new().await;
    let service = app.cart_service();
    let product = app
        .create_product_with("Tee", dec!(100000), dec!(0), ProductStatus::Active, Some(&["S", "M"]))
        .await;
    app.create_variant(product.id, None, 5, 0).await;
    let draft = app
        .create_product_with("Draft tee", dec!(100000), dec!(0), ProductStatus::Draft, None)
        .await;
    app.create_variant(draft.id, None, 5, 0).await;

    let mut session = CartSession::default();
    let mut input = add(product.id, None, 1);
    input.size = Some("XL".to_string());
    assert_matches!(
        service.add_item(&mut session, input).await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        service.add_item(&mut session, add(draft.id, None, 1)).await,
        Err(ServiceError::NotFound(_))
    );
    assert_matches!(
        service.add_item(&mut session, add(product.id, None, 0)).await,
        Err(ServiceError::InvalidInput(_))
    );
    assert_matches!(
        service.add_item(&mut session, add(Uuid::new_v4(), None, 1)).await,
        Err(ServiceError::NotFound(_))
    );
    assert!(Cart::find().all(&*app.db).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_variant_resolution_by_color_and_fallback_policy() {
    let app = TestApp::new().await;
    let product = app.create_product("Hoodie", dec!(300000)).await;
    let grey = app.create_variant(product.id, Some("Grey"), 5, 0).await;
    let red = app.create_variant(product.id, Some("Red"), 5, 1).await;

    let service = app.cart_service();
    let mut session = CartSession::default();
    let mut input = add(product.id, None, 1);
    input.color = Some(" red ".to_string());
    let update = updated(service.add_item(&mut session, input).await.unwrap());
    assert_eq!(update.variant_match, Some(VariantMatch::ColorMatch));
    assert_eq!(update.data.items[0].variant_id, red.id);

    let update = updated(
        service
            .add_item(&mut session, add(product.id, None, 1))
            .await
            .unwrap(),
    );
    assert_eq!(update.variant_match, Some(VariantMatch::FirstVariantFallback));
    assert!(update.data.items.iter().any(|i| i.variant_id == grey.id));

    let mut strict = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
    strict.inventory.variant_fallback = VariantFallbackPolicy::Reject;
    let strict_app = TestApp::with_config(strict).await;
    let hoodie = strict_app.create_product("Hoodie", dec!(300000)).await;
    strict_app.create_variant(hoodie.id, Some("Grey"), 5, 0).await;
    strict_app.create_variant(hoodie.id, Some("Red"), 5, 1).await;
    let mut session = CartSession::default();
    assert_matches!(
        strict_app
            .cart_service()
            .add_item(&mut session, add(hoodie.id, None, 1))
            .await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn test_quantity_changes() {
    let app = TestApp::new().await;
    let service = app.cart_service();
    let product = app.create_product("Socks", dec!(40000)).await;
    let variant = app.create_variant(product.id, None, 0, 0).await;

    let mut session = CartSession::default();
    let update = updated(
        service
            .add_item(&mut session, add(product.id, Some(variant.id), 2))
            .await
            .unwrap(),
    );
    let item_id = update.item_id.unwrap();

    let update = updated(
        service
            .update_item_quantity(&mut session, item_id, QuantityChange::delta(5))
            .await
            .unwrap(),
    );
    assert_eq!(update.data.totals.quantity, 7);

    let junk = QuantityChange {
        quantity: Some("lots".to_string()),
        ..Default::default()
    };
    assert_matches!(
        service.update_item_quantity(&mut session, item_id, junk).await,
        Err(ServiceError::InvalidInput(_))
    );

    let update = updated(
        service
            .update_item_quantity(&mut session, item_id, QuantityChange::delta(-100))
            .await
            .unwrap(),
    );
    assert_eq!(update.item_id, None);
    assert!(update.data.items.is_empty());
    assert_eq!(update.data.totals.total, dec!(0));
    assert_eq!(update.data.totals.shipping, dec!(0));

    assert_matches!(
        service
            .update_item_quantity(&mut session, item_id, QuantityChange::increase())
            .await
            .unwrap(),
        CartOutcome::ItemNotFound
    );
    assert_cart_consistent(&app, update.cart_id).await;
}

#[tokio::test]
async fn test_removal_is_idempotent() {
    let app = TestApp::new().await;
    let service = app.cart_service();
    let product = app.create_product("Belt", dec!(120000)).await;
    let variant = app.create_variant(product.id, None, 10, 0).await;

    let mut session = CartSession::default();
    let update = updated(
        service
            .add_item(&mut session, add(product.id, Some(variant.id), 2))
            .await
            .unwrap(),
    );
    let before = service.get_cart(&session).await.unwrap().unwrap();

    assert_matches!(
        service.remove_item(&mut session, Uuid::new_v4()).await.unwrap(),
        CartOutcome::ItemNotFound
    );
    let after = service.get_cart(&session).await.unwrap().unwrap();
    assert_eq!(after.data.totals, before.data.totals);

    let item_id = update.item_id.unwrap();
    updated(service.remove_item(&mut session, item_id).await.unwrap());
    assert_matches!(
        service.remove_item(&mut session, item_id).await.unwrap(),
        CartOutcome::ItemNotFound
    );
    assert_cart_consistent(&app, update.cart_id).await;
}

#[tokio::test]
async fn test_remove_selected_and_clear() {
    let app = TestApp::new().await;
    let service = app.cart_service();
    let mut session = CartSession::default();
    let mut item_ids = Vec::new();
    for (i, price) in [dec!(100000), dec!(150000), dec!(300000)].into_iter().enumerate() {
        let product = app.create_product(&format!("Item {}", i), price).await;
        let variant = app.create_variant(product.id, None, 10, 0).await;
        let update = updated(
            service
                .add_item(&mut session, add(product.id, Some(variant.id), 1))
                .await
                .unwrap(),
        );
        item_ids.push(update.item_id.unwrap());
        assert_cart_consistent(&app, update.cart_id).await;
    }

    let update = updated(
        service
            .remove_selected_items(&mut session, &[item_ids[0], item_ids[1], Uuid::new_v4()])
            .await
            .unwrap(),
    );
    assert_eq!(update.data.items.len(), 1);
    assert_eq!(update.data.totals.total, dec!(330000));
    assert_cart_consistent(&app, update.cart_id).await;

    let cleared = service.clear_cart(&mut session).await.unwrap().unwrap();
    assert!(cleared.data.items.is_empty());
    assert_eq!(cleared.data.totals.total, dec!(0));
    assert_eq!(session.cart.as_ref().unwrap().quantity, 0);
    assert_cart_consistent(&app, cleared.cart_id).await;

    let again = service.clear_cart(&mut session).await.unwrap().unwrap();
    assert_eq!(again.cart_id, cleared.cart_id);
    let events = app.events().await;
    assert_eq!(
        events.iter().filter(|e| matches!(e, Event::CartCleared(_))).count(),
        2
    );
}

#[tokio::test]
async fn test_clear_without_cart_writes_nothing() {
    let app = TestApp::new().await;
    let service = app.cart_service();

    let mut fresh = CartSession::default();
    assert!(service.clear_cart(&mut fresh).await.unwrap().is_none());
    let mut stale_cookie = CartSession::anonymous(Some(Uuid::new_v4()));
    assert!(service.clear_cart(&mut stale_cookie).await.unwrap().is_none());

    assert!(Cart::find().all(&*app.db).await.unwrap().is_empty());
    let events = app.events().await;
    assert!(!events.iter().any(|e| matches!(e, Event::CartCleared(_))));
}

#[tokio::test]
async fn test_get_cart_does_not_create() {
    let app = TestApp::new().await;
    let service = app.cart_service();
    assert!(service.get_cart(&CartSession::default()).await.unwrap().is_none());
    assert!(service
        .get_cart(&CartSession::anonymous(Some(Uuid::new_v4())))
        .await
        .unwrap()
        .is_none());
    assert!(Cart::find().all(&*app.db).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_token_cart_wins_over_cookie() {
    let app = TestApp::new().await;
    let service = app.cart_service();
    let product = app.create_product("Scarf", dec!(90000)).await;
    let variant = app.create_variant(product.id, None, 0, 0).await;

    let mut anonymous = CartSession::default();
    let guest = updated(
        service
            .add_item(&mut anonymous, add(product.id, Some(variant.id), 1))
            .await
            .unwrap(),
    );

    // Signing in adopts the anonymous cookie cart.
    let mut alice = CartSession::for_user("alice-token", anonymous.cart_id);
    let adopted = updated(
        service
            .add_item(&mut alice, add(product.id, Some(variant.id), 1))
            .await
            .unwrap(),
    );
    assert_eq!(adopted.cart_id, guest.cart_id);
    assert_eq!(adopted.data.totals.quantity, 2);
    let row = Cart::find_by_id(guest.cart_id).one(&*app.db).await.unwrap().unwrap();
    assert_eq!(row.user_token.as_deref(), Some("alice-token"));

    // Another user's cookie never exposes alice's cart.
    let mut bob = CartSession::for_user("bob-token", Some(guest.cart_id));
    let bobs = updated(
        service
            .add_item(&mut bob, add(product.id, Some(variant.id), 1))
            .await
            .unwrap(),
    );
    assert_ne!(bobs.cart_id, guest.cart_id);
    assert_eq!(bobs.data.totals.quantity, 1);

    // Alice arriving with bob's cookie is re-anchored to her own cart.
    let mut alice_elsewhere = CartSession::for_user("alice-token", Some(bobs.cart_id));
    let view = service.get_cart(&alice_elsewhere).await.unwrap().unwrap();
    assert_eq!(view.cart_id, guest.cart_id);
    updated(
        service
            .add_item(&mut alice_elsewhere, add(product.id, Some(variant.id), 1))
            .await
            .unwrap(),
    );
    assert_eq!(alice_elsewhere.cart_id, Some(guest.cart_id));
}

#[tokio::test]
async fn test_checkout_reapplies_and_remove_coupon_restores_base() {
    let app = TestApp::new().await;
    let service = app.cart_service();
    let product = app.create_product("Jacket", dec!(1000000)).await;
    let variant = app.create_variant(product.id, None, 3, 0).await;
    app.insert_coupon("HALF", CouponKind::Percent, dec!(50), |c| {
        c.max_discount = sea_orm::Set(Some(dec!(20000)));
    })
    .await;

    let mut session = CartSession::default();
    updated(
        service
            .add_item(&mut session, add(product.id, Some(variant.id), 1))
            .await
            .unwrap(),
    );
    let applied = service.apply_coupon(&mut session, "half").await.unwrap();
    assert_eq!(applied.summary.discount, dec!(20000));
    assert_eq!(applied.summary.total, dec!(980000));

    // A later mutation persists base totals; checkout puts the coupon back.
    updated(
        service
            .update_item_quantity(&mut session, applied.data.items[0].id, QuantityChange::set(2))
            .await
            .unwrap(),
    );
    let checkout = service.prepare_checkout(&mut session).await.unwrap();
    assert_eq!(checkout.summary.subtotal, dec!(2000000));
    assert_eq!(checkout.summary.discount, dec!(20000));
    assert_eq!(checkout.summary.total, dec!(1980000));
    let row = Cart::find_by_id(checkout.cart_id).one(&*app.db).await.unwrap().unwrap();
    assert_eq!(row.grand_total, dec!(1980000));

    let removed = service.remove_coupon(&mut session).await.unwrap();
    assert!(removed.outcome.is_none());
    assert_eq!(removed.summary.total, dec!(2000000));
    assert_eq!(session.applied_coupon, AppliedCoupon::None);
    let row = Cart::find_by_id(removed.cart_id).one(&*app.db).await.unwrap().unwrap();
    assert_eq!(row.coupon_id, None);
    assert_eq!(row.grand_total, dec!(2000000));
}

#[tokio::test]
async fn test_checkout_requires_items_and_rejects_blank_codes() {
    let app = TestApp::new().await;
    let service = app.cart_service();
    let mut session = CartSession::default();
    assert_matches!(
        service.prepare_checkout(&mut session).await,
        Err(ServiceError::InvalidOperation(_))
    );
    assert_matches!(
        service.apply_coupon(&mut session, "   ").await,
        Err(ServiceError::ValidationError(_))
    );
}
