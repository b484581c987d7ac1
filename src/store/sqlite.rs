//! SQLite-backed shop store.
//!
//! One connection behind an async mutex. Each trait method takes the lock,
//! runs its statements and releases it, so no request holds the database
//! across an await on another collaborator.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    Cart, CartEntry, CartLine, NewProduct, NewTurn, Product, ProductFilter, ShopStore, TurnRecord,
};
use crate::error::StoreError;
use crate::types::Role;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS products (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name        TEXT NOT NULL,
        description TEXT NOT NULL,
        price_cents INTEGER NOT NULL,
        category    TEXT NOT NULL,
        brand       TEXT NOT NULL,
        stock       INTEGER NOT NULL DEFAULT 0,
        image_url   TEXT,
        created_at  TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS cart_items (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id     TEXT NOT NULL,
        product_id  INTEGER NOT NULL REFERENCES products(id),
        quantity    INTEGER NOT NULL DEFAULT 1,
        created_at  TEXT NOT NULL,
        UNIQUE (user_id, product_id)
    );
    CREATE INDEX IF NOT EXISTS idx_cart_items_user ON cart_items(user_id);
    CREATE TABLE IF NOT EXISTS messages (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id TEXT NOT NULL,
        role            TEXT NOT NULL,
        content         TEXT NOT NULL,
        tool_call_id    TEXT,
        tool_name       TEXT,
        created_at      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
";

const PRODUCT_COLUMNS: &str =
    "id, name, description, price_cents, category, brand, stock, image_url, created_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a database file and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.as_ref().display(), "shop store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_stamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Maps `PRODUCT_COLUMNS` starting at `offset`.
fn row_to_product(row: &Row, offset: usize) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(offset)?,
        name: row.get(offset + 1)?,
        description: row.get(offset + 2)?,
        price_cents: row.get(offset + 3)?,
        category: row.get(offset + 4)?,
        brand: row.get(offset + 5)?,
        stock: row.get(offset + 6)?,
        image_url: row.get(offset + 7)?,
        created_at: parse_stamp(offset + 8, row.get(offset + 8)?)?,
    })
}

fn row_to_line(row: &Row) -> rusqlite::Result<CartLine> {
    Ok(CartLine {
        id: row.get(0)?,
        user_id: row.get(1)?,
        product_id: row.get(2)?,
        quantity: row.get(3)?,
        created_at: parse_stamp(4, row.get(4)?)?,
    })
}

fn row_to_turn(row: &Row) -> rusqlite::Result<TurnRecord> {
    let role: String = row.get(2)?;
    let role = Role::parse(&role).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown role {role:?}").into(),
        )
    })?;
    Ok(TurnRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role,
        content: row.get(3)?,
        tool_call_id: row.get(4)?,
        tool_name: row.get(5)?,
        created_at: parse_stamp(6, row.get(6)?)?,
    })
}

const ENTRY_SELECT: &str = "
    SELECT c.id, c.user_id, c.product_id, c.quantity, c.created_at,
           p.id, p.name, p.description, p.price_cents, p.category, p.brand,
           p.stock, p.image_url, p.created_at
    FROM cart_items c JOIN products p ON p.id = c.product_id";

fn row_to_entry(row: &Row) -> rusqlite::Result<CartEntry> {
    Ok(CartEntry {
        line: row_to_line(row)?,
        product: row_to_product(row, 5)?,
    })
}

#[async_trait]
impl ShopStore for SqliteStore {
    async fn create_product(&self, product: NewProduct) -> Result<Product, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO products (name, description, price_cents, category, brand, stock, image_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                product.name,
                product.description,
                product.price_cents,
                product.category,
                product.brand,
                product.stock,
                product.image_url,
                now_stamp(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        let created = conn.query_row(
            &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"),
            params![id],
            |row| row_to_product(row, 0),
        )?;
        debug!(id, name = %created.name, "product created");
        Ok(created)
    }

    async fn get_product(&self, id: i64) -> Result<Option<Product>, StoreError> {
        let conn = self.conn.lock().await;
        let product = conn
            .query_row(
                &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"),
                params![id],
                |row| row_to_product(row, 0),
            )
            .optional()?;
        Ok(product)
    }

    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("SELECT {PRODUCT_COLUMNS} FROM products ORDER BY id"))?;
        let products = stmt
            .query_map([], |row| row_to_product(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(products)
    }

    async fn products_by_ids(
        &self,
        ids: &[i64],
        filter: &ProductFilter,
    ) -> Result<Vec<Product>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let mut sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id IN ({placeholders})");
        let mut values: Vec<SqlValue> = ids.iter().map(|id| SqlValue::Integer(*id)).collect();

        if let Some(max) = filter.max_price_cents {
            sql.push_str(" AND price_cents <= ?");
            values.push(SqlValue::Integer(max));
        }
        if let Some(category) = &filter.category {
            sql.push_str(" AND LOWER(category) LIKE ?");
            values.push(SqlValue::Text(format!("%{}%", category.to_lowercase())));
        }
        if filter.in_stock_only {
            sql.push_str(" AND stock > 0");
        }

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let products = stmt
            .query_map(params_from_iter(values), |row| row_to_product(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(products)
    }

    async fn add_to_cart(
        &self,
        user_id: &str,
        product_id: i64,
        quantity: i64,
    ) -> Result<Option<CartEntry>, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM products WHERE id = ?1)",
            params![product_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO cart_items (user_id, product_id, quantity, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, product_id)
             DO UPDATE SET quantity = quantity + excluded.quantity",
            params![user_id, product_id, quantity, now_stamp()],
        )?;

        let entry = tx.query_row(
            &format!("{ENTRY_SELECT} WHERE c.user_id = ?1 AND c.product_id = ?2"),
            params![user_id, product_id],
            row_to_entry,
        )?;
        tx.commit()?;

        debug!(user_id, product_id, quantity = entry.line.quantity, "cart line upserted");
        Ok(Some(entry))
    }

    async fn remove_from_cart(&self, user_id: &str, product_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM cart_items WHERE user_id = ?1 AND product_id = ?2",
            params![user_id, product_id],
        )?;
        Ok(removed > 0)
    }

    async fn remove_cart_line(&self, line_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute("DELETE FROM cart_items WHERE id = ?1", params![line_id])?;
        Ok(removed > 0)
    }

    async fn clear_cart(&self, user_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute("DELETE FROM cart_items WHERE user_id = ?1", params![user_id])?;
        debug!(user_id, removed, "cart cleared");
        Ok(removed)
    }

    async fn cart(&self, user_id: &str) -> Result<Cart, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("{ENTRY_SELECT} WHERE c.user_id = ?1 ORDER BY c.id"))?;
        let entries = stmt
            .query_map(params![user_id], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        let total_cents = entries.iter().map(CartEntry::subtotal_cents).sum();
        Ok(Cart {
            entries,
            total_cents,
        })
    }

    async fn append_turn(&self, turn: NewTurn) -> Result<TurnRecord, StoreError> {
        let conn = self.conn.lock().await;
        let stamp = now_stamp();
        conn.execute(
            "INSERT INTO messages (conversation_id, role, content, tool_call_id, tool_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                turn.conversation_id,
                turn.role.as_str(),
                turn.content,
                turn.tool_call_id,
                turn.tool_name,
                stamp,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(TurnRecord {
            id,
            conversation_id: turn.conversation_id,
            role: turn.role,
            content: turn.content,
            tool_call_id: turn.tool_call_id,
            tool_name: turn.tool_name,
            created_at: parse_stamp(6, stamp)?,
        })
    }

    async fn load_turns(&self, conversation_id: &str) -> Result<Vec<TurnRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, tool_call_id, tool_name, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let turns = stmt
            .query_map(params![conversation_id], row_to_turn)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(turns)
    }
}
