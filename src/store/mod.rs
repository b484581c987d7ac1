pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::StoreError;
use crate::types::Role;

pub use sqlite::SqliteStore;

/// Render integer cents as `$149.99`.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}${}.{:02}", abs / 100, abs % 100)
}

/// Dollars as given by a user or a model (`74.99`) to integer cents.
pub fn dollars_to_cents(dollars: f64) -> i64 {
    (dollars * 100.0).round() as i64
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub price_cents: i64,
    pub category: String,
    pub brand: String,
    pub stock: i64,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn price(&self) -> String {
        format_cents(self.price_cents)
    }

    pub fn in_stock(&self) -> bool {
        self.stock > 0
    }
}

/// Catalog row to insert. Deserializes from the seed format, where
/// `price` is in dollars.
#[derive(Debug, Clone, Deserialize)]
pub struct NewProduct {
    pub name: String,
    pub description: String,
    #[serde(rename = "price", deserialize_with = "price_from_dollars")]
    pub price_cents: i64,
    pub category: String,
    pub brand: String,
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub image_url: Option<String>,
}

fn price_from_dollars<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    f64::deserialize(d).map(dollars_to_cents)
}

/// Hard predicates applied after vector retrieval.
#[derive(Debug, Clone, Default)]
pub struct ProductFilter {
    pub max_price_cents: Option<i64>,
    /// Case-insensitive substring match.
    pub category: Option<String>,
    pub in_stock_only: bool,
}

/// One cart row. Scoped to exactly one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CartLine {
    pub id: i64,
    pub user_id: String,
    pub product_id: i64,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CartEntry {
    pub line: CartLine,
    pub product: Product,
}

impl CartEntry {
    pub fn subtotal_cents(&self) -> i64 {
        self.product.price_cents * self.line.quantity
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Cart {
    pub entries: Vec<CartEntry>,
    pub total_cents: i64,
}

impl Cart {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A persisted turn. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnRecord {
    pub id: i64,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTurn {
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
}

impl NewTurn {
    fn plain(conversation_id: &str, role: Role, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            role,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn user(conversation_id: &str, content: impl Into<String>) -> Self {
        Self::plain(conversation_id, Role::User, content)
    }

    pub fn assistant(conversation_id: &str, content: impl Into<String>) -> Self {
        Self::plain(conversation_id, Role::Assistant, content)
    }

    pub fn tool_result(
        conversation_id: &str,
        call_id: &str,
        tool_name: &str,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(call_id.to_string()),
            tool_name: Some(tool_name.to_string()),
            ..Self::plain(conversation_id, Role::Tool, content)
        }
    }
}

/// System of record for the catalog, carts and the turn log.
///
/// Every method is one logical transaction; nothing is held across calls.
#[async_trait]
pub trait ShopStore: Send + Sync {
    async fn create_product(&self, product: NewProduct) -> Result<Product, StoreError>;

    async fn get_product(&self, id: i64) -> Result<Option<Product>, StoreError>;

    async fn list_products(&self) -> Result<Vec<Product>, StoreError>;

    /// Products among `ids` that pass `filter`. Order is unspecified.
    async fn products_by_ids(
        &self,
        ids: &[i64],
        filter: &ProductFilter,
    ) -> Result<Vec<Product>, StoreError>;

    /// Insert a line or bump the quantity of the existing one.
    /// `None` when the product does not exist.
    async fn add_to_cart(
        &self,
        user_id: &str,
        product_id: i64,
        quantity: i64,
    ) -> Result<Option<CartEntry>, StoreError>;

    /// Returns whether a line was removed.
    async fn remove_from_cart(&self, user_id: &str, product_id: i64) -> Result<bool, StoreError>;

    async fn remove_cart_line(&self, line_id: i64) -> Result<bool, StoreError>;

    /// Number of lines removed.
    async fn clear_cart(&self, user_id: &str) -> Result<usize, StoreError>;

    async fn cart(&self, user_id: &str) -> Result<Cart, StoreError>;

    async fn append_turn(&self, turn: NewTurn) -> Result<TurnRecord, StoreError>;

    /// Oldest first; ties keep insertion order.
    async fn load_turns(&self, conversation_id: &str) -> Result<Vec<TurnRecord>, StoreError>;
}
