pub mod handler;
pub mod registry;
pub mod shop;

pub use handler::ToolHandler;
pub use registry::{render_tool_error, ToolRegistry};
pub use shop::{format_product, shop_registry};
