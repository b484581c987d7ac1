use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolError;
use crate::session::RequestContext;

/// One capability the model can invoke by name.
///
/// `description` is the only signal the model has for when to call the
/// tool, so write it for the model.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn input_schema(&self) -> Value;

    /// Human-readable progress line shown while the tool runs.
    fn status(&self) -> String {
        format!("Running {}...", self.name())
    }

    /// Whether a successful call changes the user's cart.
    fn mutates_cart(&self) -> bool {
        false
    }

    async fn call(&self, ctx: &RequestContext, input: &Value) -> Result<String, ToolError>;
}
