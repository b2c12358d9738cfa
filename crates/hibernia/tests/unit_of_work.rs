//! Flush ordering, cascades, dirty checking, locking and transactions.

mod common;

use common::{catalog, couples, geography, invoices, setup};
use hibernia::TransactionStatus;
use hibernia::prelude::*;
use proptest::prelude::*;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

fn seed_customer(db: &Database) {
    db.insert("customer", &[("id", Value::BigInt(7)), ("name", "Acme".into())]).unwrap();
}

fn seed_product(db: &Database) {
    db.insert(
        "product",
        &[
            ("id", Value::BigInt(1)),
            ("sku", "A-1".into()),
            ("name", "Lamp".into()),
            ("version", Value::Int(0)),
        ],
    )
    .unwrap();
}

fn column(db: &Database, table: &str, name: &str) -> Value {
    db.rows(table).unwrap()[0].get_by_name(name).cloned().unwrap()
}

// ============================================================================
// Ordering
// ============================================================================

/// Countries, regions referencing a country, cities referencing a region and
/// a country, persisted in a shuffled order.
fn geography_graph() -> impl Strategy<Value = (usize, Vec<usize>, Vec<(usize, usize)>, Vec<usize>)> {
    (1usize..4, 1usize..5, 0usize..6).prop_flat_map(|(countries, regions, cities)| {
        (
            Just(countries),
            proptest::collection::vec(0..countries, regions),
            proptest::collection::vec((0..regions, 0..countries), cities),
            Just((0..countries + regions + cities).collect::<Vec<_>>()).prop_shuffle(),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn referenced_rows_are_always_inserted_first(
        (countries, regions, cities, order) in geography_graph()
    ) {
        let (db, factory) = setup(geography(), Settings::default());
        let session = factory.open_session();

        let mut all = Vec::new();
        for i in 0..countries {
            let country = session.instantiate("Country").unwrap();
            country.set_id(i as i64 + 1).unwrap();
            country.set("name", format!("country {}", i)).unwrap();
            all.push(country);
        }
        for (i, &country) in regions.iter().enumerate() {
            let region = session.instantiate("Region").unwrap();
            region.set_id(i as i64 + 1).unwrap();
            region.set("name", format!("region {}", i)).unwrap();
            region.set_reference("country", Some(&all[country])).unwrap();
            all.push(region);
        }
        for (i, &(region, country)) in cities.iter().enumerate() {
            let city = session.instantiate("City").unwrap();
            city.set_id(i as i64 + 1).unwrap();
            city.set("name", format!("city {}", i)).unwrap();
            city.set_reference("region", Some(&all[countries + region])).unwrap();
            city.set_reference("country", Some(&all[country])).unwrap();
            all.push(city);
        }
        for &index in &order {
            session.persist(&all[index]).unwrap();
        }

        // the database rejects any row whose referenced row is missing
        let written = session.flush().unwrap();
        prop_assert_eq!(written.inserted, all.len());
        prop_assert_eq!(db.count("country"), countries);
        prop_assert_eq!(db.count("region"), regions.len());
        prop_assert_eq!(db.count("city"), cities.len());
        prop_assert!(db.statements_starting_with("UPDATE").is_empty());
    }
}

#[test]
fn non_nullable_cycles_insert_nothing() {
    let (db, factory) = setup(couples(), Settings::default());
    let session = factory.open_session();
    let husband = session.instantiate("Husband").unwrap();
    husband.set_id(1).unwrap();
    husband.set("name", "Ed").unwrap();
    let wife = session.instantiate("Wife").unwrap();
    wife.set_id(1).unwrap();
    wife.set("name", "Flo").unwrap();
    husband.set_reference("wife", Some(&wife)).unwrap();
    wife.set_reference("husband", Some(&husband)).unwrap();

    // persist cascades to the wife
    session.persist(&husband).unwrap();
    assert!(session.contains(&wife).unwrap());

    match session.flush() {
        Err(Error::TransientPropertyValue { owner, property, referenced }) => {
            assert!(["Husband", "Wife"].contains(&owner.as_str()));
            assert!(["wife", "husband"].contains(&property.as_str()));
            assert_ne!(owner, referenced);
        }
        other => panic!("expected a transient property error, got {:?}", other),
    }
    assert!(db.statements_starting_with("INSERT").is_empty());
    assert_eq!(db.count("husband") + db.count("wife"), 0);
}

#[test]
fn references_to_never_saved_instances_insert_nothing() {
    let (db, factory) = setup(invoices(), Settings::default());
    let session = factory.open_session();
    session.begin_transaction().unwrap();

    let customer = session.instantiate("Customer").unwrap();
    customer.set_id(50).unwrap();
    customer.set("name", "Initech").unwrap();
    session.persist(&customer).unwrap();

    // assigned identifier, never persisted
    let invoice = session.instantiate("Invoice").unwrap();
    invoice.set_id(60).unwrap();
    invoice.set("name", "orphan").unwrap();

    let line = session.instantiate("InvoiceLine").unwrap();
    line.set_id(70).unwrap();
    line.set("description", "Lamp").unwrap();
    line.set_reference("invoice", Some(&invoice)).unwrap();
    session.persist(&line).unwrap();

    match session.flush() {
        Err(Error::TransientPropertyValue { owner, property, referenced }) => {
            assert_eq!(owner, "InvoiceLine");
            assert_eq!(property, "invoice");
            assert_eq!(referenced, "Invoice");
        }
        other => panic!("expected a transient property error, got {:?}", other),
    }
    assert!(db.statements_starting_with("INSERT").is_empty());
    assert_eq!(session.transaction_status().unwrap(), TransactionStatus::Active);

    // once the invoice is persisted too, everything goes in
    session.persist(&invoice).unwrap();
    assert_eq!(session.flush().unwrap().inserted, 3);
    session.commit().unwrap();
    assert_eq!(db.count("invoice_line"), 1);
}

#[test]
fn removal_cascades_and_deletes_children_first() {
    let (db, factory) = setup(invoices(), Settings::default());
    {
        let session = factory.open_session();
        session.begin_transaction().unwrap();
        let invoice = session.instantiate("Invoice").unwrap();
        invoice.set_id(1).unwrap();
        invoice.set("name", "A").unwrap();
        for id in [10, 11] {
            let line = session.instantiate("InvoiceLine").unwrap();
            line.set_id(id).unwrap();
            line.set("description", "x").unwrap();
            line.set("amount", Value::Decimal("1".into())).unwrap();
            line.set_reference("invoice", Some(&invoice)).unwrap();
            invoice.collection("lines").unwrap().add(line).unwrap();
        }
        session.persist(&invoice).unwrap();
        session.commit().unwrap();
    }
    assert_eq!(db.count("invoice_line"), 2);
    db.reset_log();

    let session = factory.open_session();
    session.begin_transaction().unwrap();
    let invoice = session.find("Invoice", 1).unwrap().unwrap();
    session.remove(&invoice).unwrap();
    assert_eq!(session.status(&invoice).unwrap(), EntityStatus::Removed);
    session.commit().unwrap();

    assert_eq!(db.count("invoice"), 0);
    assert_eq!(db.count("invoice_line"), 0);
    let deletes = db.statements_starting_with("DELETE");
    assert_eq!(deletes.len(), 3);
    assert!(deletes[0].contains("invoice_line"));
    assert!(deletes[2].starts_with("DELETE FROM invoice "));
}

// ============================================================================
// Dirty checking and merge
// ============================================================================

#[test]
fn dirty_checking_is_idempotent() {
    let (db, factory) = setup(invoices(), Settings::default());
    seed_customer(&db);
    let session = factory.open_session();
    let customer = session.find("Customer", 7).unwrap().unwrap();

    assert!(session.dirty_properties(&customer).unwrap().is_empty());
    assert!(session.dirty_properties(&customer).unwrap().is_empty());

    customer.set("name", "Acme Ltd").unwrap();
    assert_eq!(session.dirty_properties(&customer).unwrap(), vec!["name"]);
    assert_eq!(session.dirty_properties(&customer).unwrap(), vec!["name"]);

    customer.set("name", "Acme").unwrap();
    assert!(!session.is_dirty().unwrap());
}

#[test]
fn read_only_instances_are_not_written() {
    let (db, factory) = setup(invoices(), Settings::default());
    seed_customer(&db);
    let session = factory.open_session();
    let customer = session.find("Customer", 7).unwrap().unwrap();
    session.set_read_only(&customer, true).unwrap();
    customer.set("name", "ignored").unwrap();
    session.begin_transaction().unwrap();
    session.commit().unwrap();
    assert_eq!(column(&db, "customer", "name"), Value::Text("Acme".into()));
}

#[test]
fn merge_copies_detached_state() {
    let (db, factory) = setup(invoices(), Settings::default());
    seed_customer(&db);
    let detached = {
        let session = factory.open_session();
        session.find("Customer", 7).unwrap().unwrap()
    };
    detached.set("name", "Acme Ltd").unwrap();

    let session = factory.open_session();
    session.begin_transaction().unwrap();
    let managed = session.merge(&detached).unwrap();
    assert!(!EntityRef::ptr_eq(&managed, &detached));
    assert_eq!(managed.get("name").unwrap(), Value::Text("Acme Ltd".into()));
    assert!(!session.contains(&detached).unwrap());
    session.commit().unwrap();
    assert_eq!(column(&db, "customer", "name"), Value::Text("Acme Ltd".into()));

    // an unknown identity is persisted
    let fresh = session.instantiate("Customer").unwrap();
    fresh.set_id(8).unwrap();
    fresh.set("name", "Globex").unwrap();
    session.begin_transaction().unwrap();
    session.merge(&fresh).unwrap();
    session.commit().unwrap();
    assert_eq!(db.count("customer"), 2);
}

#[test]
fn merge_replaces_collection_contents() {
    let (db, factory) = setup(invoices(), Settings::default());
    db.insert("invoice", &[("id", Value::BigInt(1)), ("name", "A".into())]).unwrap();
    for (id, description) in [(10, "Lamp"), (11, "Desk")] {
        db.insert(
            "invoice_line",
            &[
                ("id", Value::BigInt(id)),
                ("description", description.into()),
                ("amount", Value::Decimal("1".into())),
                ("invoice_id", Value::BigInt(1)),
            ],
        )
        .unwrap();
    }

    let detached = {
        let session = factory.open_session();
        let invoice = session.find("Invoice", 1).unwrap().unwrap();
        assert_eq!(invoice.collection("lines").unwrap().size().unwrap(), 2);
        session.close().unwrap();
        invoice
    };
    let lines = detached.collection("lines").unwrap();
    let desk = lines
        .elements()
        .unwrap()
        .into_iter()
        .find(|l| l.id() == Some(Identifier::from(11_i64)))
        .unwrap();
    assert!(lines.remove(&desk).unwrap());
    assert_eq!(lines.size().unwrap(), 1);

    let session = factory.open_session();
    session.begin_transaction().unwrap();
    let managed = session.merge(&detached).unwrap();
    let merged = managed.collection("lines").unwrap();
    assert_eq!(merged.size().unwrap(), 1);
    let remaining = merged.elements().unwrap();
    assert_eq!(remaining[0].id(), Some(Identifier::from(10_i64)));
    assert!(session.contains(&remaining[0]).unwrap());
    session.commit().unwrap();
}

#[test]
fn refresh_discards_local_changes() {
    let (db, factory) = setup(invoices(), Settings::default());
    seed_customer(&db);
    let session = factory.open_session();
    let customer = session.find("Customer", 7).unwrap().unwrap();
    customer.set("name", "local").unwrap();
    session.refresh(&customer).unwrap();
    assert_eq!(customer.get("name").unwrap(), Value::Text("Acme".into()));
    assert!(!session.is_dirty().unwrap());
}

// ============================================================================
// Optimistic locking
// ============================================================================

#[test]
fn concurrent_updates_fail_with_stale_state() {
    let (db, factory) = setup(catalog(), Settings::default());
    seed_product(&db);
    let first = factory.open_session();
    let second = factory.open_session();
    let mine = first.find("Product", 1).unwrap().unwrap();
    let theirs = second.find("Product", 1).unwrap().unwrap();

    first.begin_transaction().unwrap();
    mine.set("name", "Desk lamp").unwrap();
    first.commit().unwrap();
    assert_eq!(mine.get("version").unwrap(), Value::Int(1));

    second.begin_transaction().unwrap();
    theirs.set("name", "Floor lamp").unwrap();
    match second.commit() {
        Err(Error::StaleObjectState { entity, id }) => {
            assert_eq!(entity, "Product");
            assert_eq!(id, Identifier::from(1_i64));
        }
        other => panic!("expected stale state, got {:?}", other),
    }
    assert_eq!(second.transaction_status().unwrap(), TransactionStatus::MarkedRollback);
    second.rollback().unwrap();
    assert_eq!(column(&db, "product", "name"), Value::Text("Desk lamp".into()));

    // the rolled back instance is detached and still at version 0
    let third = factory.open_session();
    assert!(matches!(
        third.merge(&theirs),
        Err(Error::StaleObjectState { .. })
    ));
}

#[test]
fn generated_identifiers_follow_existing_rows() {
    let (db, factory) = setup(catalog(), Settings::default());
    seed_product(&db);
    let session = factory.open_session();
    session.begin_transaction().unwrap();
    let product = session.instantiate("Product").unwrap();
    product.set("sku", "B-2").unwrap();
    product.set("name", "Desk").unwrap();
    session.persist(&product).unwrap();
    assert_eq!(product.id(), Some(Identifier::from(2_i64)));
    session.commit().unwrap();
    assert_eq!(db.count("product"), 2);
    assert_eq!(product.get("version").unwrap(), Value::Int(0));
}

// ============================================================================
// Transactions
// ============================================================================

#[test]
fn expired_transactions_become_rollback_only() {
    let settings = Settings::default().transaction_timeout(Duration::from_millis(5));
    let (db, factory) = setup(invoices(), settings);
    seed_customer(&db);
    let session = factory.open_session();
    session.begin_transaction().unwrap();
    let customer = session.find("Customer", 7).unwrap().unwrap();
    customer.set("name", "late").unwrap();
    let flushes = Rc::new(Cell::new(0));
    {
        let flushes = Rc::clone(&flushes);
        session
            .on(SessionEvent::BeforeFlush, move || {
                flushes.set(flushes.get() + 1);
                Ok(())
            })
            .unwrap();
    }
    std::thread::sleep(Duration::from_millis(25));

    assert!(matches!(
        session.flush(),
        Err(Error::TransactionTimeout { timeout_ms: 5, .. })
    ));
    assert_eq!(flushes.get(), 0);
    assert_eq!(session.transaction_status().unwrap(), TransactionStatus::MarkedRollback);
    assert!(session.commit().is_err());
    session.rollback().unwrap();
    assert_eq!(session.transaction_status().unwrap(), TransactionStatus::RolledBack);
    assert_eq!(column(&db, "customer", "name"), Value::Text("Acme".into()));
}

#[test]
fn failed_statements_leave_the_transaction_rollback_only() {
    let (db, factory) = setup(invoices(), Settings::default());
    seed_customer(&db);
    let session = factory.open_session();
    let rolled_back = Rc::new(Cell::new(false));
    {
        let rolled_back = Rc::clone(&rolled_back);
        session
            .on(SessionEvent::AfterRollback, move || {
                rolled_back.set(true);
                Ok(())
            })
            .unwrap();
    }

    session.begin_transaction().unwrap();
    let customer = session.find("Customer", 7).unwrap().unwrap();
    customer.set("name", "Acme Ltd").unwrap();
    db.fail_next("UPDATE customer");
    assert!(matches!(session.flush(), Err(Error::Query(_))));
    assert_eq!(session.transaction_status().unwrap(), TransactionStatus::MarkedRollback);
    assert!(session.commit().is_err());

    session.rollback().unwrap();
    assert!(rolled_back.get());
    assert_eq!(session.managed_count(), 0);
    assert_eq!(db.rollbacks(), 1);
    assert_eq!(column(&db, "customer", "name"), Value::Text("Acme".into()));
}

#[test]
fn flush_without_auto_begin_requires_a_transaction() {
    let (_db, factory) = setup(invoices(), Settings::default().auto_begin(false));
    let session = factory.open_session();
    assert!(matches!(session.flush(), Err(Error::Transaction(_))));
    session.begin_transaction().unwrap();
    session.flush().unwrap();
}

#[test]
fn dropping_a_session_rolls_back() {
    let (db, factory) = setup(invoices(), Settings::default());
    {
        let session = factory.open_session();
        let customer = session.instantiate("Customer").unwrap();
        customer.set_id(9).unwrap();
        customer.set("name", "Initech").unwrap();
        session.persist(&customer).unwrap();
        session.flush().unwrap();
        assert_eq!(db.count("customer"), 1);
    }
    assert_eq!(db.count("customer"), 0);
    assert_eq!(db.rollbacks(), 1);
}
