//! Agent module - the core iterative tool-calling loop.
//!
//! The agent follows a "tools in a loop" pattern:
//! 1. Send the accumulated conversation and tool catalog to the model
//! 2. Execute any tool calls the model requested, in order
//! 3. Feed results back and ask again
//! 4. Stop on completion, stall, or the safety ceiling

mod agent_loop;

pub use agent_loop::AgentRunner;
