//! Second-level cache, natural ids, inheritance and settings.

mod common;

use common::{auction, billing, catalog, seed_auction, setup, setup_cached};
use hibernia::prelude::*;
use hibernia::{InMemoryRegionCache, RegionCache};

fn seed_catalog(db: &Database) {
    db.insert(
        "category",
        &[("id", Value::BigInt(1)), ("code", "LAMPS".into()), ("title", "Lamps".into())],
    )
    .unwrap();
    db.insert(
        "product",
        &[
            ("id", Value::BigInt(1)),
            ("sku", "A-1".into()),
            ("name", "Lamp".into()),
            ("version", Value::Int(0)),
            ("category_id", Value::BigInt(1)),
        ],
    )
    .unwrap();
}

// ============================================================================
// Second-level cache
// ============================================================================

#[test]
fn committed_updates_reach_other_sessions_through_the_cache() {
    let (db, factory) = setup_cached(catalog());
    seed_catalog(&db);

    let writer = factory.open_session();
    writer.begin_transaction().unwrap();
    let category = writer.find("Category", 1).unwrap().unwrap();
    category.set("title", "Lighting").unwrap();
    writer.commit().unwrap();
    assert_eq!(writer.statistics().updates, 1);

    let reader = factory.open_session();
    let before = db.statement_count();
    let cached = reader.find("Category", 1).unwrap().unwrap();
    assert_eq!(cached.get("title").unwrap(), Value::Text("Lighting".into()));
    assert_eq!(db.statement_count(), before);
    assert_eq!(reader.statistics().cache_hits, 1);
}

#[test]
fn lazy_references_resolve_from_the_cache() {
    let (db, factory) = setup_cached(catalog());
    seed_catalog(&db);
    factory.open_session().find("Category", 1).unwrap().unwrap();

    let session = factory.open_session();
    let product = session.find("Product", 1).unwrap().unwrap();
    let category = product.reference("category").unwrap().unwrap();
    assert!(!category.is_initialized());

    let before = db.statement_count();
    let target = category.get().unwrap();
    assert_eq!(target.get("code").unwrap(), Value::Text("LAMPS".into()));
    assert_eq!(db.statement_count(), before);
    assert_eq!(session.statistics().proxy_initializations, 1);
}

#[test]
fn uncached_entities_and_evicted_entries_hit_the_database() {
    let (db, factory) = setup_cached(catalog());
    seed_catalog(&db);
    factory.open_session().find("Product", 1).unwrap().unwrap();
    factory.open_session().find("Category", 1).unwrap().unwrap();

    // products are not cacheable
    let before = db.statement_count();
    factory.open_session().find("Product", 1).unwrap().unwrap();
    assert_eq!(db.statement_count(), before + 1);

    factory.evict_cache("Category", 1).unwrap();
    let session = factory.open_session();
    session.find("Category", 1).unwrap().unwrap();
    assert_eq!(db.statement_count(), before + 2);
    assert_eq!(session.statistics().cache_misses, 1);
}

#[test]
fn removed_entities_leave_the_cache() {
    let (db, factory) = setup_cached(catalog());
    db.insert(
        "category",
        &[("id", Value::BigInt(2)), ("code", "DESKS".into()), ("title", "Desks".into())],
    )
    .unwrap();

    let session = factory.open_session();
    session.begin_transaction().unwrap();
    let desks = session.find("Category", 2).unwrap().unwrap();
    session.remove(&desks).unwrap();
    session.commit().unwrap();

    assert!(factory.open_session().find("Category", 2).unwrap().is_none());
}

#[test]
fn disabling_the_cache_in_settings_bypasses_the_region() {
    let cache = Arc::new(InMemoryRegionCache::new());
    let db = Database::new();
    let model = catalog();
    db.create_schema(&model).unwrap();
    seed_catalog(&db);
    let settings = Settings::from_properties([("hibernia.use_second_level_cache", "off")]).unwrap();
    let factory = SessionFactory::builder(model)
        .settings(settings)
        .connection_provider(Arc::new(db.clone()))
        .region_cache(cache.clone())
        .build()
        .unwrap();

    factory.open_session().find("Category", 1).unwrap().unwrap();
    assert!(cache.get("Category", &Identifier::from(1_i64)).is_none());
    let session = factory.open_session();
    session.find("Category", 1).unwrap().unwrap();
    assert_eq!(session.statistics().cache_hits, 0);
}

// ============================================================================
// Natural ids
// ============================================================================

#[test]
fn natural_ids_find_persisted_and_loaded_instances() {
    let (db, factory) = setup(catalog(), Settings::default());
    seed_catalog(&db);
    let session = factory.open_session();

    let lamp = session.find_by_natural_id("Product", &["A-1".into()]).unwrap().unwrap();
    assert_eq!(lamp.id(), Some(Identifier::from(1_i64)));
    assert!(EntityRef::ptr_eq(&lamp, &session.find("Product", 1).unwrap().unwrap()));

    session.begin_transaction().unwrap();
    let desk = session.instantiate("Product").unwrap();
    desk.set("sku", "B-2").unwrap();
    desk.set("name", "Desk").unwrap();
    session.persist(&desk).unwrap();
    session.flush().unwrap();

    let statements = db.statement_count();
    let found = session.find_by_natural_id("Product", &["B-2".into()]).unwrap().unwrap();
    assert!(EntityRef::ptr_eq(&found, &desk));
    assert_eq!(db.statement_count(), statements);
    session.commit().unwrap();
}

// ============================================================================
// Inheritance
// ============================================================================

fn seed_billing(db: &Database, id: i64, kind: &str) {
    db.insert(
        "billing_details",
        &[
            ("id", Value::BigInt(id)),
            ("kind", kind.into()),
            ("owner", "ann".into()),
            ("number", "4111".into()),
            ("iban", "DE89".into()),
        ],
    )
    .unwrap();
}

#[test]
fn polymorphic_queries_return_concrete_subtypes() {
    let (db, factory) = setup(billing(), Settings::default());
    seed_billing(&db, 1, "CC");
    seed_billing(&db, 2, "BA");
    seed_billing(&db, 3, "BD");
    let session = factory.open_session();

    let mut kinds: Vec<String> = session
        .query("BillingDetails")
        .list()
        .unwrap()
        .iter()
        .map(EntityRef::entity_name)
        .collect();
    kinds.sort();
    assert_eq!(kinds, vec!["BankAccount", "BillingDetails", "CreditCard"]);

    let cards = session.query("CreditCard").list().unwrap();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].get("number").unwrap(), Value::Text("4111".into()));
    assert!(session.find("BankAccount", 1).unwrap().is_none());
}

#[test]
fn unknown_discriminators_are_reported() {
    let (db, factory) = setup(billing(), Settings::default());
    seed_billing(&db, 1, "XX");
    let session = factory.open_session();
    match session.find("BillingDetails", 1) {
        Err(Error::UnknownEntityType { entity, discriminator }) => {
            assert_eq!(entity, "BillingDetails");
            assert!(discriminator.contains("XX"));
        }
        other => panic!("expected an unknown entity type, got {:?}", other),
    }
    assert_eq!(session.managed_count(), 0);
}

// ============================================================================
// Queries and settings
// ============================================================================

#[test]
fn fetch_depth_limits_join_chains() {
    let (db, factory) = setup(auction(), Settings::default().max_fetch_depth(1));
    seed_auction(&db);
    let session = factory.open_session();

    // the seller is past the join limit and arrives by a second select
    let before = db.statement_count();
    let bids = session.query("Bid").join("item").join("item.seller").list().unwrap();
    assert_eq!(bids.len(), 2);
    assert_eq!(db.statement_count(), before + 2);
    let item = bids[0].reference("item").unwrap().unwrap();
    assert!(item.is_initialized());
    let seller = item.get().unwrap().reference("seller").unwrap().unwrap();
    assert!(seller.is_initialized());
    assert_eq!(db.statement_count(), before + 2);
}

#[test]
fn read_only_queries_are_never_flushed() {
    let (db, factory) = setup(auction(), Settings::default());
    seed_auction(&db);
    let session = factory.open_session();
    let users = session.query("User").read_only(true).list().unwrap();
    assert!(session.is_read_only(&users[0]).unwrap());
    users[0].set("username", "renamed").unwrap();
    assert!(!session.is_dirty().unwrap());
    session.begin_transaction().unwrap();
    session.commit().unwrap();
    assert!(db.statements_starting_with("UPDATE").is_empty());
}

#[test]
fn malformed_properties_are_rejected() {
    assert!(matches!(
        Settings::from_properties([("hibernia.max_fetch_depth", "deep")]),
        Err(Error::Config(_))
    ));
    let settings = Settings::from_properties([
        ("hibernia.n1_warn_threshold", "5"),
        ("hibernia.flush_on_commit", "false"),
        ("hibernia.not_a_setting", "1"),
    ])
    .unwrap();
    assert_eq!(settings.n1_warn_threshold, 5);
    assert!(!settings.flush_on_commit);
}
