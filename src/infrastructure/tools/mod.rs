//! Tool-server integration: stdio JSON-RPC sessions, catalog and routing.

pub mod catalog;
pub mod invoker;
pub mod stdio;

pub use catalog::ToolCatalog;
pub use invoker::{classify_tool_result, ToolInvoker, ToolResultKind};
pub use stdio::StdioToolSession;
