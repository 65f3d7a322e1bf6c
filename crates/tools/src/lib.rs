//! Locally-implemented tools: path safety, the per-agent files sandbox,
//! the capped key/value state store, and the tool registry + executor
//! that dispatches every tool call an agent makes.

pub mod bash;
pub mod executor;
pub mod files;
pub mod path;
pub mod registry;
pub mod state;

pub use executor::{ExecutorDeps, ToolExecutor};
pub use state::AgentStateStore;
