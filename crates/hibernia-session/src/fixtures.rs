//! Mapping models and a seeded in-memory database for the session tests.

use crate::factory::SessionFactory;
use hibernia_core::{
    EntityMapping, IdGenerator, IdentifierMapping, Metamodel, PropertyMapping, SemanticType, Settings,
    Value,
};
use hibernia_memdb::Database;
use std::sync::Arc;

fn id() -> IdentifierMapping {
    IdentifierMapping::simple("id", "id", SemanticType::Long)
}

pub fn invoice_model() -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityMapping::new("Customer")
                .id(id())
                .property(PropertyMapping::basic("name", SemanticType::Text)),
        )
        .entity(
            EntityMapping::new("Invoice")
                .id(id())
                .property(PropertyMapping::basic("number", SemanticType::Text))
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
        .unwrap()
}

pub fn auction_model() -> Metamodel {
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
        .unwrap()
}

pub fn billing_model() -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityMapping::new("User")
                .table("users")
                .id(id())
                .property(PropertyMapping::basic("username", SemanticType::Text))
                .property(PropertyMapping::one_to_many("billingDetails", "BillingDetails").mapped_by("owner")),
        )
        .entity(
            EntityMapping::new("BillingDetails")
                .id(id())
                .discriminator("kind", SemanticType::Text)
                .discriminator_value("BD")
                .property(PropertyMapping::basic("owner_name", SemanticType::Text))
                .property(PropertyMapping::many_to_one("owner", "User").lazy()),
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
        .unwrap()
}

/// Versioned, cacheable entities with natural ids and generated keys.
pub fn catalog_model() -> Metamodel {
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
        .unwrap()
}

pub fn factory(model: Metamodel, db: &Database, settings: Settings) -> SessionFactory {
    SessionFactory::builder(model)
        .settings(settings)
        .connection_provider(Arc::new(db.clone()))
        .build()
        .unwrap()
}

/// Invoice 1 with two lines, customer 7.
pub fn seed_invoices(db: &Database) {
    db.insert("customer", &[("id", Value::BigInt(7)), ("name", "Acme".into())]).unwrap();
    db.insert(
        "invoice",
        &[
            ("id", Value::BigInt(1)),
            ("number", "INV-1".into()),
            ("customer_id", Value::BigInt(7)),
        ],
    )
    .unwrap();
    for (id, description, amount) in [(10, "Lamp", "12.50"), (11, "Desk", "80")] {
        db.insert(
            "invoice_line",
            &[
                ("id", Value::BigInt(id)),
                ("description", description.into()),
                ("amount", Value::Decimal(amount.to_string())),
                ("invoice_id", Value::BigInt(1)),
            ],
        )
        .unwrap();
    }
}

/// Two users, item 1 sold by user 1 with two bids and three comments.
pub fn seed_auction(db: &Database) {
    for (id, name) in [(1, "seller"), (2, "bidder")] {
        db.insert("users", &[("id", Value::BigInt(id)), ("username", name.into())]).unwrap();
    }
    db.insert(
        "item",
        &[("id", Value::BigInt(1)), ("name", "Lamp".into()), ("seller_id", Value::BigInt(1))],
    )
    .unwrap();
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
        .unwrap();
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
        .unwrap();
    }
}
