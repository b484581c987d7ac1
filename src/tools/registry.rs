use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::handler::ToolHandler;
use crate::error::ToolError;
use crate::session::RequestContext;

/// Longest tool error string fed back to the model.
pub const MAX_TOOL_ERROR_CHARS: usize = 200;

/// Catalog of available tools. Keeps registration order for the schema
/// list and looks handlers up by name at dispatch time.
pub struct ToolRegistry {
    tools: Vec<Box<dyn ToolHandler>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Builder-style `register`.
    pub fn add(mut self, handler: impl ToolHandler + 'static) -> Self {
        self.register(handler);
        self
    }

    /// Register a tool. A tool with the same name is replaced in place.
    pub fn register(&mut self, handler: impl ToolHandler + 'static) {
        let name = handler.name().to_string();
        match self.by_name.get(&name) {
            Some(&i) => self.tools[i] = Box::new(handler),
            None => {
                self.by_name.insert(name, self.tools.len());
                self.tools.push(Box::new(handler));
            }
        }
    }

    fn get(&self, name: &str) -> Option<&dyn ToolHandler> {
        self.by_name.get(name).map(|&i| self.tools[i].as_ref())
    }

    /// All tool schemas for the LLM API request, in registration order.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools.iter().map(|t| schema_of(t.as_ref())).collect()
    }

    pub fn schema(&self, name: &str) -> Option<Value> {
        self.get(name).map(schema_of)
    }

    /// Run a tool by name. Unknown names, non-object arguments and panics
    /// come back as errors.
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        name: &str,
        input: &Value,
    ) -> Result<String, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        match input {
            Value::Object(_) | Value::Null => {}
            Value::String(_) => {
                return Err(ToolError::InvalidArguments(
                    "arguments were not valid JSON".into(),
                ))
            }
            _ => {
                return Err(ToolError::InvalidArguments(
                    "arguments must be a JSON object".into(),
                ))
            }
        }

        debug!(tool = name, "executing tool");
        match AssertUnwindSafe(tool.call(ctx, input)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                warn!(tool = name, "tool panicked");
                Err(ToolError::Panicked)
            }
        }
    }

    pub fn status_for(&self, name: &str) -> String {
        match self.get(name) {
            Some(tool) => tool.status(),
            None => format!("Running {name}..."),
        }
    }

    pub fn mutates_cart(&self, name: &str) -> bool {
        self.get(name).is_some_and(|t| t.mutates_cart())
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn schema_of(tool: &dyn ToolHandler) -> Value {
    json!({
        "name": tool.name(),
        "description": tool.description(),
        "input_schema": tool.input_schema(),
    })
}

/// One-line message the model sees in place of a failed tool's result.
/// Never includes backtraces or driver-level detail.
pub fn render_tool_error(name: &str, err: &ToolError) -> String {
    let message = match err {
        ToolError::UnknownTool(unknown) => format!("Error: there is no tool named {unknown}."),
        ToolError::InvalidArguments(detail) => {
            format!("Error: invalid arguments for {name}: {detail}")
        }
        ToolError::Store(_) | ToolError::Catalog(_) => {
            format!("Error: {name} is temporarily unavailable. Try again or use a different tool.")
        }
        ToolError::Panicked => format!("Error: {name} failed unexpectedly."),
        ToolError::Timeout(_) => format!("Error: {name} took too long and was stopped."),
    };
    truncate_chars(message, MAX_TOOL_ERROR_CHARS)
}

fn truncate_chars(s: String, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => s[..cut].to_string(),
        None => s,
    }
}
