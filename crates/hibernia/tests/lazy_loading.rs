//! Lazy collections, proxies and join fan-out, end to end.

mod common;

use common::{auction, invoices, seed_auction, setup};
use hibernia::prelude::*;

fn line(session: &Session, id: i64, description: &str, amount: &str) -> EntityRef {
    let line = session.instantiate("InvoiceLine").unwrap();
    line.set_id(id).unwrap();
    line.set("description", description).unwrap();
    line.set("amount", Value::Decimal(amount.to_string())).unwrap();
    line
}

#[test]
fn invoice_lines_stay_unloaded_until_used() {
    let (db, factory) = setup(invoices(), Settings::default());
    let session = factory.open_session();

    let invoice = session.instantiate("Invoice").unwrap();
    invoice.set_id(1).unwrap();
    invoice.set("name", "Invoice A").unwrap();
    let lines = invoice.collection("lines").unwrap();
    for l in [line(&session, 10, "Lamp", "12.50"), line(&session, 11, "Desk", "80")] {
        l.set_reference("invoice", Some(&invoice)).unwrap();
        lines.add(l).unwrap();
    }
    session.persist(&invoice).unwrap();
    let written = session.flush().unwrap();
    assert_eq!(written.inserted, 3);
    session.clear().unwrap();

    let loaded = session.find("Invoice", 1).unwrap().unwrap();
    assert!(!EntityRef::ptr_eq(&loaded, &invoice));
    assert_eq!(loaded.get("name").unwrap(), Value::Text("Invoice A".into()));

    let lines = loaded.collection("lines").unwrap();
    let before = db.statement_count();
    assert!(!lines.is_initialized());
    assert_eq!(db.statement_count(), before);

    assert_eq!(lines.size().unwrap(), 2);
    assert!(lines.is_initialized());
    assert_eq!(db.statement_count(), before + 1);

    let mut descriptions: Vec<Value> = lines
        .elements()
        .unwrap()
        .iter()
        .map(|l| l.get("description").unwrap())
        .collect();
    descriptions.sort_by_key(|v| v.to_string());
    assert_eq!(descriptions, vec![Value::Text("Desk".into()), Value::Text("Lamp".into())]);
    // elements point back at the very same invoice instance
    for l in lines.elements().unwrap() {
        assert!(EntityRef::ptr_eq(&l.related("invoice").unwrap().unwrap(), &loaded));
    }
    assert_eq!(db.statement_count(), before + 1);
    session.commit().unwrap();
}

#[test]
fn join_fetch_fan_out_yields_one_item() {
    let (db, factory) = setup(auction(), Settings::default());
    seed_auction(&db);
    let session = factory.open_session();

    let items = session
        .query("Item")
        .join("bids")
        .join("comments")
        .list()
        .unwrap();
    assert_eq!(items.len(), 1);

    let item = &items[0];
    let bids = item.collection("bids").unwrap();
    let comments = item.collection("comments").unwrap();
    assert!(bids.is_initialized());
    assert!(comments.is_initialized());

    let statements = db.statement_count();
    assert_eq!(bids.size().unwrap(), 2);
    assert_eq!(comments.size().unwrap(), 3);
    assert_eq!(db.statement_count(), statements);

    // every bid is managed once, however many rows carried it
    let again = session.find("Bid", 1).unwrap().unwrap();
    assert!(bids.contains(&again).unwrap());
}

#[test]
fn lazy_to_one_is_untouched_until_a_property_is_read() {
    let (db, factory) = setup(invoices(), Settings::default());
    db.insert("customer", &[("id", Value::BigInt(7)), ("name", "Acme".into())]).unwrap();
    db.insert(
        "invoice",
        &[("id", Value::BigInt(1)), ("name", "A".into()), ("customer_id", Value::BigInt(7))],
    )
    .unwrap();
    let session = factory.open_session();

    let invoice = session.find("Invoice", 1).unwrap().unwrap();
    let after_load = db.statement_count();
    let customer = invoice.reference("customer").unwrap().unwrap();
    assert!(!customer.is_initialized());
    assert_eq!(customer.identifier(), Some(Identifier::from(7_i64)));
    assert_eq!(customer.entity_name(), "Customer");
    assert_eq!(db.statement_count(), after_load);

    let target = customer.get().unwrap();
    assert_eq!(target.get("name").unwrap(), Value::Text("Acme".into()));
    assert_eq!(db.statement_count(), after_load + 1);
    assert!(EntityRef::ptr_eq(&target, &session.find("Customer", 7).unwrap().unwrap()));
    assert_eq!(db.statement_count(), after_load + 1);
}

#[test]
fn proxies_survive_serialization_and_reattach() {
    let (db, factory) = setup(invoices(), Settings::default());
    db.insert("customer", &[("id", Value::BigInt(7)), ("name", "Acme".into())]).unwrap();

    let json = {
        let session = factory.open_session();
        let Reference::Proxy(proxy) = session.get_reference("Customer", 7).unwrap() else {
            panic!("customers are proxyable");
        };
        session.close().unwrap();
        serde_json::to_string(&proxy).unwrap()
    };

    let restored: LazyRef = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.entity_name(), "Customer");
    assert_eq!(restored.identifier(), &Identifier::from(7_i64));
    assert!(!restored.is_initialized());
    assert!(!restored.has_session());
    assert!(restored.get().unwrap_err().is_lazy_initialization());

    // an attempt without a session does not poison the proxy
    let session = factory.open_session();
    session.reattach(&restored).unwrap();
    assert_eq!(restored.get_value("name").unwrap(), Value::Text("Acme".into()));
    assert!(EntityRef::ptr_eq(
        &restored.get().unwrap(),
        &session.find("Customer", 7).unwrap().unwrap()
    ));
}

#[test]
fn reattach_refuses_a_taken_identity() {
    let (db, factory) = setup(invoices(), Settings::default());
    db.insert("customer", &[("id", Value::BigInt(7)), ("name", "Acme".into())]).unwrap();
    let session = factory.open_session();
    session.find("Customer", 7).unwrap().unwrap();

    let detached = {
        let other = factory.open_session();
        let Reference::Proxy(proxy) = other.get_reference("Customer", 7).unwrap() else {
            panic!("customers are proxyable");
        };
        proxy
    };
    assert!(matches!(
        session.reattach(&detached),
        Err(Error::DuplicateIdentity { .. })
    ));
}

#[test]
fn closed_and_cleared_sessions_fail_lazily() {
    let (db, factory) = setup(invoices(), Settings::default());
    db.insert("customer", &[("id", Value::BigInt(7)), ("name", "Acme".into())]).unwrap();
    db.insert(
        "invoice",
        &[("id", Value::BigInt(1)), ("name", "A".into()), ("customer_id", Value::BigInt(7))],
    )
    .unwrap();

    let session = factory.open_session();
    let invoice = session.find("Invoice", 1).unwrap().unwrap();
    let customer = invoice.reference("customer").unwrap().unwrap();
    let lines = invoice.collection("lines").unwrap();
    session.close().unwrap();

    match customer.get() {
        Err(Error::LazyInitialization { entity, id, .. }) => {
            assert_eq!(entity, "Customer");
            assert_eq!(id, Some(Identifier::from(7_i64)));
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert!(lines.size().unwrap_err().is_lazy_initialization());
    // identifiers stay readable
    assert_eq!(customer.identifier(), Some(Identifier::from(7_i64)));

    let session = factory.open_session();
    let invoice = session.find("Invoice", 1).unwrap().unwrap();
    let lines = invoice.collection("lines").unwrap();
    session.clear().unwrap();
    assert!(lines.is_empty().unwrap_err().is_lazy_initialization());
}

#[test]
fn repeated_lazy_loads_are_reported_as_n_plus_one() {
    let (db, factory) = setup(auction(), Settings::default().n1_warn_threshold(2));
    seed_auction(&db);
    db.insert("item", &[("id", Value::BigInt(2)), ("name", "Desk".into())]).unwrap();
    let session = factory.open_session();

    for item in session.query("Item").list().unwrap() {
        item.collection("bids").unwrap().size().unwrap();
    }
    let suspects = session.n1_suspects();
    assert_eq!(suspects, vec![("Item".to_string(), "bids".to_string(), 2)]);
    assert_eq!(session.statistics().collection_initializations, 2);
}
