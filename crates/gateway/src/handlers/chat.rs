//! Chat streaming handlers

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use askforge_common::{
    errors::{AppError, Result},
    LlmError, ALL_MODELS_FAILED_MESSAGE,
};
use askforge_context::ChatTurn;
use askforge_llm::StreamEvent;

const BUSY_MESSAGE: &str = "The service is busy, please retry later.";

/// Chat request
#[derive(Debug, Deserialize, Validate)]
pub struct ChatStreamRequest {
    #[validate(length(min = 1, max = 4000))]
    pub question: String,

    /// Continue an existing conversation; a new one is started when absent
    #[serde(default)]
    #[validate(length(min = 1, max = 128))]
    pub conversation_id: Option<String>,

    #[serde(default)]
    pub deep_thinking: bool,
}

#[derive(Serialize)]
pub struct StopResponse {
    pub task_id: String,
    pub stopped: bool,
}

/// Text shown to the user for a stream error
fn error_message(error: &LlmError) -> &'static str {
    match error {
        LlmError::PoolRejected { .. } => BUSY_MESSAGE,
        _ => ALL_MODELS_FAILED_MESSAGE,
    }
}

/// Map a pipeline event onto an SSE frame
fn to_sse_event(event: &StreamEvent) -> Event {
    match event {
        StreamEvent::Content(delta) => Event::default()
            .event("content")
            .data(json!({ "delta": delta }).to_string()),
        StreamEvent::Thinking(delta) => Event::default()
            .event("thinking")
            .data(json!({ "delta": delta }).to_string()),
        StreamEvent::Complete => Event::default()
            .event("finish")
            .data(json!({ "status": "complete" }).to_string()),
        StreamEvent::Error(error) => Event::default().event("error").data(
            json!({ "code": error.kind(), "message": error_message(error) }).to_string(),
        ),
    }
}

/// Answer a question as a server-sent event stream.
///
/// The first frame is `meta` with the conversation and task ids; the task id
/// can be passed to the stop endpoint.
pub async fn stream_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatStreamRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let user_id = headers
        .get(state.config.server.user_header.as_str())
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
        .to_string();
    let conversation_id = request
        .conversation_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let task_id = Uuid::new_v4().to_string();

    info!(
        conversation_id = %conversation_id,
        task_id = %task_id,
        deep_thinking = request.deep_thinking,
        "Chat stream requested"
    );

    let meta = Event::default()
        .event("meta")
        .data(json!({ "conversation_id": conversation_id, "task_id": task_id }).to_string());

    let turn = ChatTurn {
        question: request.question,
        conversation_id,
        user_id,
        deep_thinking: request.deep_thinking,
        task_id,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let chat = state.chat.clone();
    tokio::spawn(async move {
        let task_id = turn.task_id.clone();
        if let Err(e) = chat.stream_chat(turn, tx).await {
            warn!(task_id = %task_id, error = %e, "Chat stream ended with an error");
        }
    });

    let events = UnboundedReceiverStream::new(rx).map(|event| Ok(to_sse_event(&event)));
    let stream = stream::once(async move { Ok(meta) }).chain(events);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Stop an in-flight answer; unknown or finished tasks are a no-op
pub async fn stop_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Json<StopResponse> {
    let stopped = state.chat.stop_task(&task_id);
    info!(task_id = %task_id, stopped, "Stop requested");
    Json(StopResponse { task_id, stopped })
}
