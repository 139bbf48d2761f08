// src/http/mod.rs
//! HTTP surface (§6.1): the only two routes the Pipeline exposes.
//! Transport itself is out of scope (§1) beyond this thin adaptation layer;
//! grounded on the teacher's `api::routes` axum router construction and
//! its SSE endpoint shape.

use axum::{
    Router,
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json,
};
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::orchestrator::{ChatRequest, Orchestrator, StreamEvent};

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/task-manager/chat", post(chat))
        .route("/task-manager/chat-stream", get(chat_stream))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(150)))
        .layer(CorsLayer::permissive())
        .with_state(orchestrator)
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    query: String,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// §6.1: status 200 for all non-transport errors; the error body itself
/// carries a user-friendly message. 4xx is reserved for malformed bodies,
/// which axum's JSON extractor already rejects before this handler runs.
async fn chat(State(orchestrator): State<Arc<Orchestrator>>, Json(body): Json<ChatBody>) -> impl IntoResponse {
    let req = ChatRequest { query: body.query, session_id: body.session_id };
    match orchestrator.process(req).await {
        Ok(response) => Json(serde_json::to_value(response).unwrap_or_default()).into_response(),
        Err(e) => {
            let message = crate::error::PipelineError::from_anyhow(e).canonical_user_message()
                .unwrap_or_else(|| "Something went wrong. Please try again.".to_string());
            Json(serde_json::json!({ "answer": message, "error": true })).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    query: String,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn chat_stream(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(params): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let req = ChatRequest { query: params.query, session_id: params.session_id };
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        orchestrator
            .process_stream(req, |event| {
                let _ = tx.send(to_sse_event(&event));
            })
            .await;
    });

    let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx).map(Ok);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &StreamEvent) -> Event {
    let (kind, data) = match event {
        StreamEvent::Start => ("start", serde_json::json!({})),
        StreamEvent::Status { message } => ("status", serde_json::json!({ "message": message })),
        StreamEvent::Sources { sources } => ("sources", serde_json::json!({ "sources": sources })),
        StreamEvent::Chunk { text } => ("chunk", serde_json::json!({ "text": text })),
        StreamEvent::Complete { answer, sources, confidence, metadata } => (
            "complete",
            serde_json::json!({ "answer": answer, "sources": sources, "confidence": confidence, "metadata": metadata }),
        ),
        StreamEvent::Error { message } => ("error", serde_json::json!({ "message": message })),
    };
    Event::default().event(kind).data(data.to_string())
}
