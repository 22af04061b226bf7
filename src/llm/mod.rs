//! LLM completion layer.
//!
//! Defines the conversation data model shared with the agent loop and the
//! [`ModelGateway`] seam the loop calls through. The only concrete gateway is
//! [`AnthropicGateway`], one stateless HTTPS round trip per completion.

mod anthropic;
mod types;

pub use anthropic::AnthropicGateway;
pub use types::{
    ContentBlock, ConversationTurn, GatewayError, ModelGateway, ModelResponse, ToolResultBlock,
    ToolSpec,
};
