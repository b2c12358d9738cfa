//! Mapping models shared by the loader tests.

use hibernia_core::{EntityMapping, IdentifierMapping, Metamodel, PropertyMapping, SemanticType};

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
                .property(PropertyMapping::one_to_many("lines", "InvoiceLine").mapped_by("invoice")),
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

pub fn org_model() -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityMapping::new("Company")
                .id(id())
                .property(PropertyMapping::basic("name", SemanticType::Text))
                .property(PropertyMapping::one_to_many("departments", "Department").mapped_by("company")),
        )
        .entity(
            EntityMapping::new("Department")
                .id(id())
                .property(PropertyMapping::basic("name", SemanticType::Text))
                .property(PropertyMapping::many_to_one("company", "Company"))
                .property(PropertyMapping::one_to_many("staff", "Employee").mapped_by("department")),
        )
        .entity(
            EntityMapping::new("Employee")
                .id(id())
                .property(PropertyMapping::basic("name", SemanticType::Text))
                .property(PropertyMapping::many_to_one("department", "Department"))
                .property(PropertyMapping::many_to_one("manager", "Employee"))
                .property(PropertyMapping::one_to_many("reports", "Employee").mapped_by("manager")),
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
