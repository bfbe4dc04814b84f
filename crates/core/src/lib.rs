//! # AgentRail Core
//!
//! Domain types, collaborator traits, and error definitions for the AgentRail
//! agent runtime. This crate defines the domain model that all other crates
//! implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator the agent loop consumes (model provider, tool executor,
//! verifier, context shrinker, conversation store) is a trait here.
//! Implementations live in their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with scripted mock implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod message;
pub mod provider;
pub mod tool;
pub mod verifier;
pub mod context;
pub mod store;
pub mod progress;
pub mod session;
pub mod process;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{Message, Role, Conversation, ConversationId};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition, parse_completion_signal};
pub use tool::{Tool, ToolCall, ToolExecutor, ToolOutput, ToolProgress, ToolResult, ToolRegistry};
pub use verifier::{Verdict, Verifier};
pub use context::{ContextShrinker, ShrinkResult};
pub use store::ConversationStore;
pub use progress::{ProgressBus, ProgressEvent, ProgressStep, StepStatus, StepType};
pub use session::SessionSnapshot;
pub use process::{ProcessGuard, ProcessTracker};
