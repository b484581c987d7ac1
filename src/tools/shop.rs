//! The seven shopping tools exposed to the model.
//!
//! Results are plain text written for the model. Products always carry
//! their `[ID:X]` tag so later turns can refer back to them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::handler::ToolHandler;
use super::registry::ToolRegistry;
use crate::catalog::{ProductSearch, SearchQuery};
use crate::error::ToolError;
use crate::session::RequestContext;
use crate::store::{dollars_to_cents, format_cents, Product};

/// `[ID:7] Name — $149.99` followed by brand/category/stock and description lines.
pub fn format_product(p: &Product) -> String {
    format!(
        "[ID:{}] {} — {}\n  Brand: {} | Category: {} | Stock: {}\n  {}",
        p.id,
        p.name,
        p.price(),
        p.brand,
        p.category,
        p.stock,
        p.description
    )
}

/// All shop tools, in the order the model sees them.
pub fn shop_registry(search: Arc<ProductSearch>) -> ToolRegistry {
    ToolRegistry::new()
        .add(SearchProducts { search })
        .add(GetProductDetails)
        .add(AddToCart)
        .add(RemoveFromCart)
        .add(ClearCart)
        .add(GetCurrentCart)
        .add(CompareProducts)
}

fn parse_args<T: DeserializeOwned>(input: &Value) -> Result<T, ToolError> {
    let input = if input.is_null() { json!({}) } else { input.clone() };
    serde_json::from_value(input).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

// --- search_products ---

pub struct SearchProducts {
    search: Arc<ProductSearch>,
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    max_price: Option<f64>,
    #[serde(default)]
    category: Option<String>,
}

#[async_trait]
impl ToolHandler for SearchProducts {
    fn name(&self) -> &str {
        "search_products"
    }

    fn description(&self) -> &str {
        "Search for products by natural language query. \
         Use this when the user asks about products, gear recommendations, \
         or anything shopping-related. Supports optional price and category filters.\n\n\
         Available categories (use exact values): jackets, footwear, sleeping, packs, \
         lighting, hydration, cooking, accessories, safety.\n\
         Only pass category if the user explicitly mentions one. \
         Let the semantic search handle discovery otherwise."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "What the user is looking for"},
                "max_price": {"type": "number", "description": "Maximum price in dollars"},
                "category": {"type": "string", "description": "Product category"}
            },
            "required": ["query"]
        })
    }

    fn status(&self) -> String {
        "Searching products...".into()
    }

    async fn call(&self, ctx: &RequestContext, input: &Value) -> Result<String, ToolError> {
        let args: SearchArgs = parse_args(input)?;

        let mut query = SearchQuery::new(args.query);
        if let Some(max) = args.max_price {
            query = query.max_price_cents(dollars_to_cents(max));
        }
        if let Some(category) = args.category.filter(|c| !c.trim().is_empty()) {
            query = query.category(category);
        }

        let products = self.search.search(ctx.store.as_ref(), &query).await?;
        if products.is_empty() {
            return Ok("No products found matching your search.".into());
        }
        Ok(products
            .iter()
            .map(format_product)
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

// --- get_product_details ---

pub struct GetProductDetails;

#[derive(Deserialize)]
struct ProductIdArgs {
    product_id: i64,
}

#[async_trait]
impl ToolHandler for GetProductDetails {
    fn name(&self) -> &str {
        "get_product_details"
    }

    fn description(&self) -> &str {
        "Get full details for a specific product by its ID. \
         Use this when the user asks for more information about a specific product \
         they've seen in search results."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"product_id": {"type": "integer"}},
            "required": ["product_id"]
        })
    }

    fn status(&self) -> String {
        "Looking up product details...".into()
    }

    async fn call(&self, ctx: &RequestContext, input: &Value) -> Result<String, ToolError> {
        let args: ProductIdArgs = parse_args(input)?;
        match ctx.store.get_product(args.product_id).await? {
            Some(product) => Ok(format_product(&product)),
            None => Ok(format!("Product with ID {} not found.", args.product_id)),
        }
    }
}

// --- add_to_cart ---

pub struct AddToCart;

#[derive(Deserialize)]
struct AddArgs {
    product_id: i64,
    #[serde(default = "one")]
    quantity: i64,
}

fn one() -> i64 {
    1
}

#[async_trait]
impl ToolHandler for AddToCart {
    fn name(&self) -> &str {
        "add_to_cart"
    }

    fn description(&self) -> &str {
        "Add a product to the user's shopping cart. \
         Use this when the user says they want to buy, add, or get a product. \
         If the user refers to a product from a previous comparison (e.g. \"add the cheaper one\", \
         \"add the most expensive one\"), look up the [ID:X] tags and prices in your earlier \
         messages to resolve the correct product_id. Do NOT ask for clarification."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "product_id": {"type": "integer"},
                "quantity": {"type": "integer", "minimum": 1, "default": 1}
            },
            "required": ["product_id"]
        })
    }

    fn status(&self) -> String {
        "Adding to your cart...".into()
    }

    fn mutates_cart(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &RequestContext, input: &Value) -> Result<String, ToolError> {
        let args: AddArgs = parse_args(input)?;
        if args.quantity < 1 {
            return Err(ToolError::InvalidArguments(format!(
                "quantity must be at least 1, got {}",
                args.quantity
            )));
        }

        match ctx
            .store
            .add_to_cart(&ctx.user_id, args.product_id, args.quantity)
            .await?
        {
            Some(entry) => Ok(format!(
                "Added {}x {} ({}) to your cart.",
                args.quantity,
                entry.product.name,
                entry.product.price()
            )),
            None => Ok(format!("Product with ID {} not found.", args.product_id)),
        }
    }
}

// --- remove_from_cart ---

pub struct RemoveFromCart;

#[async_trait]
impl ToolHandler for RemoveFromCart {
    fn name(&self) -> &str {
        "remove_from_cart"
    }

    fn description(&self) -> &str {
        "Remove a product from the user's cart. \
         Use this when the user wants to remove or delete an item from their cart."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"product_id": {"type": "integer"}},
            "required": ["product_id"]
        })
    }

    fn status(&self) -> String {
        "Updating your cart...".into()
    }

    fn mutates_cart(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &RequestContext, input: &Value) -> Result<String, ToolError> {
        let args: ProductIdArgs = parse_args(input)?;
        if ctx
            .store
            .remove_from_cart(&ctx.user_id, args.product_id)
            .await?
        {
            Ok("Removed the item from your cart.".into())
        } else {
            Ok("That product is not in your cart.".into())
        }
    }
}

// --- clear_cart ---

pub struct ClearCart;

#[async_trait]
impl ToolHandler for ClearCart {
    fn name(&self) -> &str {
        "clear_cart"
    }

    fn description(&self) -> &str {
        "Remove ALL items from the user's cart at once. \
         Use this when the user wants to empty, clear, or reset their entire cart \
         (e.g. \"clear my cart\", \"remove everything\", \"start over\"). \
         Do NOT use this to remove a single item; use remove_from_cart instead."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn status(&self) -> String {
        "Clearing your cart...".into()
    }

    fn mutates_cart(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &RequestContext, _input: &Value) -> Result<String, ToolError> {
        match ctx.store.clear_cart(&ctx.user_id).await? {
            0 => Ok("Your cart is already empty.".into()),
            n => Ok(format!("Done! Removed all {n} item(s) from your cart.")),
        }
    }
}

// --- get_current_cart ---

pub struct GetCurrentCart;

#[async_trait]
impl ToolHandler for GetCurrentCart {
    fn name(&self) -> &str {
        "get_current_cart"
    }

    fn description(&self) -> &str {
        "Get the current contents of the user's shopping cart. \
         Use this when the user asks what's in their cart, the total, or wants to review."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn status(&self) -> String {
        "Checking your cart...".into()
    }

    async fn call(&self, ctx: &RequestContext, _input: &Value) -> Result<String, ToolError> {
        let cart = ctx.store.cart(&ctx.user_id).await?;
        if cart.is_empty() {
            return Ok("Your cart is empty.".into());
        }

        let mut lines: Vec<String> = cart
            .entries
            .iter()
            .map(|e| {
                format!(
                    "• [ID:{}] {} x{} — {}",
                    e.product.id,
                    e.product.name,
                    e.line.quantity,
                    format_cents(e.subtotal_cents())
                )
            })
            .collect();
        lines.push(format!("\nTotal: {}", format_cents(cart.total_cents)));
        Ok(lines.join("\n"))
    }
}

// --- compare_products ---

pub struct CompareProducts;

#[derive(Deserialize)]
struct CompareArgs {
    product_ids: Vec<i64>,
}

#[async_trait]
impl ToolHandler for CompareProducts {
    fn name(&self) -> &str {
        "compare_products"
    }

    fn description(&self) -> &str {
        "Compare multiple products side by side. \
         Use this when the user wants to compare two or more products. \
         Takes a list of product IDs."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "product_ids": {"type": "array", "items": {"type": "integer"}, "minItems": 2}
            },
            "required": ["product_ids"]
        })
    }

    fn status(&self) -> String {
        "Comparing products...".into()
    }

    async fn call(&self, ctx: &RequestContext, input: &Value) -> Result<String, ToolError> {
        let args: CompareArgs = parse_args(input)?;

        let mut products = Vec::with_capacity(args.product_ids.len());
        for id in &args.product_ids {
            if products.iter().any(|p: &Product| p.id == *id) {
                continue;
            }
            if let Some(p) = ctx.store.get_product(*id).await? {
                products.push(p);
            }
        }

        if products.len() < 2 {
            return Ok("Need at least 2 valid product IDs to compare.".into());
        }
        Ok(products
            .iter()
            .map(format_product)
            .collect::<Vec<_>>()
            .join("\n\n--- vs ---\n\n"))
    }
}
