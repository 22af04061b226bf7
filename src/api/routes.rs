//! Route table and request handlers.
//!
//! Handlers validate, resolve the conversation, and delegate to the agent
//! loop. Responses use the `{success, data|error}` envelope; errors carry a
//! structured code plus message, never raw internal detail.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::agent::AgentRunner;
use crate::config::Config;
use crate::llm::{AnthropicGateway, ModelGateway};
use crate::mcp::{McpSession, ToolInvoker};
use crate::session::SessionRegistry;

use super::types::{
    ChatRequest, ChatResponse, ConversationListResponse, ConversationResponse, HealthResponse,
    McpStatus, StatusResponse,
};

/// Everything the handlers need, constructed once at startup.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<SessionRegistry>,
    pub gateway: Arc<dyn ModelGateway>,
    /// Absent when the tool server failed to start; chat reports 503.
    pub mcp: Option<Arc<McpSession>>,
}

/// Bind and serve the API until the process exits.
pub async fn serve(
    config: Config,
    registry: Arc<SessionRegistry>,
    mcp: Option<Arc<McpSession>>,
) -> anyhow::Result<()> {
    let gateway: Arc<dyn ModelGateway> = Arc::new(AnthropicGateway::new(
        config.api_key.clone(),
        config.model.clone(),
        config.max_tokens,
        config.model_timeout,
    ));

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState {
        config,
        registry,
        gateway,
        mcp,
    });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/conversations", get(list_conversations))
        .route(
            "/api/conversations/:id",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/api/status", get(status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn success(data: impl Serialize) -> Response {
    let data = serde_json::to_value(data).unwrap_or(Value::Null);
    Json(json!({"success": true, "data": data})).into_response()
}

fn failure(status: StatusCode, code: &'static str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error": {"code": code, "message": message},
        })),
    )
        .into_response()
}

// ── Handlers ──────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let connected = state.mcp.is_some();
    let body = HealthResponse {
        status: if connected { "healthy" } else { "unhealthy" },
        timestamp: Utc::now(),
        mcp_connected: connected,
    };
    let status = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn chat(State(state): State<Arc<AppState>>, Json(request): Json<ChatRequest>) -> Response {
    // Validation first: an empty message never reaches the model.
    let message = match request.message.as_deref().map(str::trim) {
        Some(trimmed) if !trimmed.is_empty() => trimmed.to_string(),
        _ => {
            tracing::warn!("chat request with missing or empty message");
            return failure(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "Message cannot be empty",
            );
        }
    };

    let conversation_id = request
        .conversation_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(mcp) = state.mcp.clone() else {
        tracing::error!("chat request while the tool session is unavailable");
        return failure(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            "Cloud tool session is not available. Please check the server connection.",
        );
    };

    state.registry.get_or_create(&conversation_id).await;

    // Serialize runs on this conversation; concurrent requests for other
    // ids proceed on their own locks.
    let run_lock = state.registry.run_lock(&conversation_id).await;
    let _guard = run_lock.lock().await;

    tracing::info!(
        "processing message for conversation {}: {:.100}",
        conversation_id,
        message
    );

    let runner = AgentRunner::new(
        Arc::clone(&state.gateway),
        Arc::clone(&mcp) as Arc<dyn ToolInvoker>,
        state.config.policy,
    );

    let mut turns = state.registry.turns(&conversation_id).await;
    let response_text = runner.run(&mut turns, mcp.tools(), &message).await;

    let message_id = state
        .registry
        .complete_exchange(&conversation_id, turns, &message, &response_text)
        .await;

    tracing::info!(
        "processed message {}, response length: {} chars",
        message_id,
        response_text.len()
    );

    success(ChatResponse {
        response: response_text,
        conversation_id,
        message_id,
    })
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.registry.get(&id).await {
        Some(session) => success(ConversationResponse {
            conversation_id: id,
            created_at: session.created_at,
            last_activity: session.last_activity,
            message_count: session.message_count,
            messages: session.exchanges,
        }),
        None => failure(
            StatusCode::NOT_FOUND,
            "not_found",
            "Conversation not found",
        ),
    }
}

async fn list_conversations(State(state): State<Arc<AppState>>) -> Response {
    let conversations = state.registry.list().await;
    let total_count = conversations.len();
    success(ConversationListResponse {
        conversations,
        total_count,
    })
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    // Idempotent: deleting an unknown id succeeds quietly.
    state.registry.delete(&id).await;
    success(json!({"message": "Conversation cleared"}))
}

async fn status(State(state): State<Arc<AppState>>) -> Response {
    let history_file = state
        .registry
        .history_path()
        .map(|p| p.display().to_string());
    let history_file_exists = state
        .registry
        .history_path()
        .map(|p| p.exists())
        .unwrap_or(false);

    success(StatusResponse {
        status: "running",
        timestamp: Utc::now(),
        active_sessions: state.registry.session_count().await,
        total_messages: state.registry.total_messages().await,
        mcp: McpStatus {
            connected: state.mcp.is_some(),
            tool_count: state.mcp.as_ref().map(|m| m.tools().len()).unwrap_or(0),
        },
        history_file,
        history_file_exists,
    })
}
