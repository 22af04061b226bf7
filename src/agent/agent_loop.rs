//! Core agent loop implementation.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;

use crate::config::LoopPolicy;
use crate::llm::{ConversationTurn, ModelGateway, ToolResultBlock, ToolSpec};
use crate::mcp::ToolInvoker;

/// Drives one user message to a final answer.
///
/// Owns no conversation state itself; the caller hands it a mutable turn log
/// for the duration of one run and takes it back afterwards.
pub struct AgentRunner {
    gateway: Arc<dyn ModelGateway>,
    invoker: Arc<dyn ToolInvoker>,
    policy: LoopPolicy,
}

impl AgentRunner {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        invoker: Arc<dyn ToolInvoker>,
        policy: LoopPolicy,
    ) -> Self {
        Self {
            gateway,
            invoker,
            policy,
        }
    }

    /// Run the iterative tool-calling cycle until a termination condition
    /// fires, appending every assistant and tool-result turn to `turns`.
    ///
    /// Returns the newline-join of every text block the model emitted, plus
    /// any diagnostics. Degraded endings (model failure mid-run, stall,
    /// safety ceiling) still return the accumulated text; turns already
    /// appended are never rolled back.
    pub async fn run(
        &self,
        turns: &mut Vec<ConversationTurn>,
        tools: &[ToolSpec],
        user_message: &str,
    ) -> String {
        turns.push(ConversationTurn::User {
            text: user_message.to_string(),
        });

        let mut final_text: Vec<String> = Vec::new();
        let mut iteration: usize = 0;
        let mut consecutive_no_tool: usize = 0;
        let mut recent_signatures: VecDeque<Vec<String>> = VecDeque::new();

        loop {
            iteration += 1;

            // Hard upper bound on model calls per request; everything else
            // is a heuristic, this one is unconditional.
            if iteration > self.policy.safety_limit {
                tracing::warn!(
                    limit = self.policy.safety_limit,
                    "safety ceiling reached, forcing stop"
                );
                final_text.push(format!(
                    "[Stopped: reached the safety limit of {} iterations]",
                    self.policy.safety_limit
                ));
                break;
            }

            tracing::debug!(iteration, "requesting model completion");
            let response = match self.gateway.complete(turns, tools).await {
                Ok(response) => response,
                Err(e) => {
                    // Fatal to the run, not to the conversation: keep what
                    // the model already said and surface the failure.
                    tracing::error!(iteration, "model request failed: {}", e);
                    final_text.push(format!(
                        "[Error: model request failed in iteration {}: {}]",
                        iteration, e
                    ));
                    break;
                }
            };

            let (texts, tool_uses) = response.partition();
            tracing::debug!(
                iteration,
                text_blocks = texts.len(),
                tool_calls = tool_uses.len(),
                "model response"
            );

            // Text is kept even when tool calls follow; it may be the
            // model's intermediate reasoning.
            for text in &texts {
                final_text.push((*text).to_string());
            }

            if !tool_uses.is_empty() {
                consecutive_no_tool = 0;

                let signature: Vec<String> = tool_uses
                    .iter()
                    .map(|(_, name, input)| format!("{}({})", name, canonical_json(input)))
                    .collect();
                recent_signatures.push_back(signature);
                if recent_signatures.len() > self.policy.stall_window {
                    recent_signatures.pop_front();
                }
                if recent_signatures.len() == self.policy.stall_window
                    && recent_signatures
                        .iter()
                        .all(|s| s == &recent_signatures[0])
                {
                    tracing::warn!(
                        window = self.policy.stall_window,
                        "identical tool calls repeated, stopping early"
                    );
                    final_text.push(
                        "[Warning: the model kept requesting the same tool calls; \
                         stopping early with partial results]"
                            .to_string(),
                    );
                    break;
                }

                turns.push(ConversationTurn::Assistant {
                    content: response.content.clone(),
                });

                // Strictly sequential; the tool session serializes anyway.
                let mut results = Vec::with_capacity(tool_uses.len());
                for (index, (id, name, input)) in tool_uses.iter().enumerate() {
                    tracing::info!(
                        "executing tool {}/{}: {}",
                        index + 1,
                        tool_uses.len(),
                        name
                    );
                    let result = match self.invoker.invoke(name, input).await {
                        Ok(output) => ToolResultBlock {
                            tool_use_id: (*id).to_string(),
                            content: output,
                            is_error: false,
                        },
                        // A failed tool call goes back to the model as data
                        // so it can adapt; it never aborts the run.
                        Err(e) => {
                            tracing::warn!(tool = *name, "tool call failed: {}", e);
                            ToolResultBlock {
                                tool_use_id: (*id).to_string(),
                                content: format!("Error executing tool: {}", e),
                                is_error: true,
                            }
                        }
                    };
                    results.push(result);
                }
                turns.push(ConversationTurn::ToolResults { results });
            } else {
                consecutive_no_tool += 1;
                turns.push(ConversationTurn::Assistant {
                    content: response.content.clone(),
                });

                // One trailing text-only response is tolerated: models often
                // emit a closing remark before the real final answer.
                if consecutive_no_tool >= self.policy.completion_grace {
                    tracing::debug!(
                        iteration,
                        "completion: {} consecutive responses without tool calls",
                        consecutive_no_tool
                    );
                    break;
                }
            }
        }

        final_text.join("\n")
    }
}

/// Deterministic serialization for tool-signature comparison: object keys
/// are emitted in sorted order at every depth, so two inputs differing only
/// in key order produce the same signature while any value change does not.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        other => other.to_string(),
    }
}
