//! Tool contract and registry.
//!
//! A tool is a named, schema-described operation the model can call. The
//! loop validates arguments against the declared schema before invoking
//! `execute`; validation and execution failures both become error tool
//! results, never loop failures.

mod edit_tool;
mod registry;
mod tool;
mod validate;

pub use edit_tool::{EditArgs, EditOpArg, EditTool};
pub use registry::ToolRegistry;
pub use tool::{ProgressFn, Tool, ToolError, ToolOutput, schema_for};
pub use validate::{ValidationError, validate_tool_arguments};
