//! # cloudchat
//!
//! A self-hosted conversational agent for cloud management.
//!
//! This library provides:
//! - An HTTP API for chat submission and conversation management
//! - An iterative tool-calling agent loop with bounded termination
//! - An MCP stdio session executing cloud CLI tools in a side-channel process
//! - A persistent session registry surviving restarts
//!
//! ## Architecture
//!
//! One user message becomes a chain of model calls and tool executions:
//! 1. The request layer resolves or creates the conversation
//! 2. The agent loop asks the model, executes requested tools in order,
//!    feeds results back, and repeats
//! 3. The loop stops on completion, stall detection, or the safety ceiling
//! 4. The exchange is recorded and the registry persisted
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cloudchat::{api, config::Config, session::SessionRegistry};
//!
//! let config = Config::from_env()?;
//! let registry = Arc::new(SessionRegistry::restore(config.history_file.clone()).await);
//! api::serve(config, registry, None).await?;
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod llm;
pub mod mcp;
pub mod session;

pub use config::Config;
