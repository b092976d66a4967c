//! Context budget allocation for LLM inference
//!
//! Sits between retrieval and the model call. Given ranked memory fragments
//! and a conversation log, it fits the best evidence into the model's
//! context window without ever exceeding it.

pub mod chunking;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod text;

pub use config::Config;
pub use context::{AdaptiveContextManager, AssembledContext, AssemblyRequest};
pub use error::{ContextError, Result, ValidationError};
