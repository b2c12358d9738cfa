//! Shared mapping models and helpers for the end-to-end tests.

#![allow(dead_code)]

use hibernia::prelude::*;
use hibernia::{IdGenerator, InMemoryRegionCache};

pub fn id() -> IdentifierMapping {
    IdentifierMapping::simple("id", "id", SemanticType::Long)
}

/// Customer <- Invoice -> lines (lazy, cascade all) -> InvoiceLine
pub fn invoices() -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityMapping::new("Customer")
                .id(id())
                .property(PropertyMapping::basic("name", SemanticType::Text)),
        )
        .entity(
            EntityMapping::new("Invoice")
                .id(id())
                .property(PropertyMapping::basic("name", SemanticType::Text))
                .property(PropertyMapping::many_to_one("customer", "Customer").lazy())
                .property(
                    PropertyMapping::one_to_many("lines", "InvoiceLine")
                        .mapped_by("invoice")
                        .cascade("all"),
                ),
        )
        .entity(
            EntityMapping::new("InvoiceLine")
                .id(id())
                .property(PropertyMapping::basic("description", SemanticType::Text))
                .property(PropertyMapping::basic("amount", SemanticType::Decimal))
                .property(PropertyMapping::many_to_one("invoice", "Invoice").not_null()),
        )
        .build()
        .expect("invoice model")
}

/// Items with bids and comments, sold and bid on by users.
pub fn auction() -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityMapping::new("User")
                .table("users")
                .id(id())
                .property(PropertyMapping::basic("username", SemanticType::Text)),
        )
        .entity(
            EntityMapping::new("Item")
                .id(id())
                .property(PropertyMapping::basic("name", SemanticType::Text))
                .property(PropertyMapping::many_to_one("seller", "User"))
                .property(PropertyMapping::one_to_many("bids", "Bid").mapped_by("item"))
                .property(PropertyMapping::one_to_many("comments", "Comment").mapped_by("item")),
        )
        .entity(
            EntityMapping::new("Bid")
                .id(id())
                .property(PropertyMapping::basic("amount", SemanticType::Long))
                .property(PropertyMapping::many_to_one("item", "Item").not_null())
                .property(PropertyMapping::many_to_one("bidder", "User")),
        )
        .entity(
            EntityMapping::new("Comment")
                .id(id())
                .property(PropertyMapping::basic("text", SemanticType::Text))
                .property(PropertyMapping::many_to_one("item", "Item").not_null()),
        )
        .build()
        .expect("auction model")
}

/// Two entities holding non-nullable references to each other.
pub fn couples() -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityMapping::new("Husband")
                .id(id())
                .property(PropertyMapping::basic("name", SemanticType::Text))
                .property(
                    PropertyMapping::many_to_one("wife", "Wife")
                        .not_null()
                        .cascade("persist"),
                ),
        )
        .entity(
            EntityMapping::new("Wife")
                .id(id())
                .property(PropertyMapping::basic("name", SemanticType::Text))
                .property(
                    PropertyMapping::many_to_one("husband", "Husband")
                        .not_null()
                        .cascade("persist"),
                ),
        )
        .build()
        .expect("couples model")
}

/// Three levels of non-nullable references: City -> Region -> Country, and
/// City -> Country directly.
pub fn geography() -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityMapping::new("Country")
                .id(id())
                .property(PropertyMapping::basic("name", SemanticType::Text)),
        )
        .entity(
            EntityMapping::new("Region")
                .id(id())
                .property(PropertyMapping::basic("name", SemanticType::Text))
                .property(PropertyMapping::many_to_one("country", "Country").not_null()),
        )
        .entity(
            EntityMapping::new("City")
                .id(id())
                .property(PropertyMapping::basic("name", SemanticType::Text))
                .property(PropertyMapping::many_to_one("region", "Region").not_null())
                .property(PropertyMapping::many_to_one("country", "Country").not_null()),
        )
        .build()
        .expect("geography model")
}

/// Versioned products with generated keys in cacheable categories.
pub fn catalog() -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityMapping::new("Category")
                .id(id())
                .cacheable(true)
                .property(PropertyMapping::basic("code", SemanticType::Text).natural_id())
                .property(PropertyMapping::basic("title", SemanticType::Text)),
        )
        .entity(
            EntityMapping::new("Product")
                .id(id().generator(IdGenerator::Increment))
                .property(PropertyMapping::basic("sku", SemanticType::Text).natural_id())
                .property(PropertyMapping::basic("name", SemanticType::Text))
                .property(PropertyMapping::basic("version", SemanticType::Integer).version())
                .property(PropertyMapping::many_to_one("category", "Category").lazy()),
        )
        .build()
        .expect("catalog model")
}

/// Single-table inheritance: BillingDetails <- CreditCard, BankAccount.
pub fn billing() -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityMapping::new("BillingDetails")
                .id(id())
                .discriminator("kind", SemanticType::Text)
                .discriminator_value("BD")
                .property(PropertyMapping::basic("owner", SemanticType::Text)),
        )
        .entity(
            EntityMapping::new("CreditCard")
                .extends("BillingDetails")
                .discriminator_value("CC")
                .property(PropertyMapping::basic("number", SemanticType::Text)),
        )
        .entity(
            EntityMapping::new("BankAccount")
                .extends("BillingDetails")
                .discriminator_value("BA")
                .property(PropertyMapping::basic("iban", SemanticType::Text)),
        )
        .build()
        .expect("billing model")
}

/// A fresh database with the model's schema and a factory over it.
pub fn setup(model: Metamodel, settings: Settings) -> (Database, SessionFactory) {
    let db = Database::new();
    db.create_schema(&model).expect("schema");
    let factory = SessionFactory::builder(model)
        .settings(settings)
        .connection_provider(Arc::new(db.clone()))
        .build()
        .expect("factory");
    (db, factory)
}

/// Like [`setup`], with an in-memory second-level cache.
pub fn setup_cached(model: Metamodel) -> (Database, SessionFactory) {
    let db = Database::new();
    db.create_schema(&model).expect("schema");
    let factory = SessionFactory::builder(model)
        .connection_provider(Arc::new(db.clone()))
        .region_cache(Arc::new(InMemoryRegionCache::new()))
        .build()
        .expect("factory");
    (db, factory)
}

/// Item 1 with two bids and three comments; users 1 (seller) and 2.
pub fn seed_auction(db: &Database) {
    for (id, name) in [(1, "seller"), (2, "bidder")] {
        db.insert("users", &[("id", Value::BigInt(id)), ("username", name.into())])
            .expect("user");
    }
    db.insert(
        "item",
        &[("id", Value::BigInt(1)), ("name", "Lamp".into()), ("seller_id", Value::BigInt(1))],
    )
    .expect("item");
    for (id, amount) in [(1, 10), (2, 12)] {
        db.insert(
            "bid",
            &[
                ("id", Value::BigInt(id)),
                ("amount", Value::BigInt(amount)),
                ("item_id", Value::BigInt(1)),
                ("bidder_id", Value::BigInt(2)),
            ],
        )
        .expect("bid");
    }
    for id in 1..=3 {
        db.insert(
            "comment",
            &[
                ("id", Value::BigInt(id)),
                ("text", format!("comment {}", id).into()),
                ("item_id", Value::BigInt(1)),
            ],
        )
        .expect("comment");
    }
}
