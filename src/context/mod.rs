//! Session context types and context compression for RLM orchestration.
//!
//! The context module provides the core types for representing conversation
//! state, messages, and tool outputs, plus the compression pipeline used to
//! keep those artifacts within a caller's token budget.

pub mod compression;
mod types;

pub use types::{Message, Role, SessionContext, ToolOutput};
