//! `POST /chat`, `POST /chat/stream` and `GET /status`.

use crate::models::Message;
use crate::server::validation::{ChatRequest, validate_messages};
use crate::server::{ApiError, AppState};
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use chrono::{SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::convert::Infallible;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub timestamp: String,
}

/// Parse and validate a chat body.
fn chat_messages(
    state: &AppState,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Vec<Message>, ApiError> {
    let Json(request) = body.map_err(|rejection| {
        debug!(error = %rejection.body_text(), "Rejected chat body");
        ApiError::BadRequest("Invalid request: messages array is required".to_string())
    })?;

    Ok(validate_messages(request.messages, &state.config.server)?)
}

pub async fn chat(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let messages = chat_messages(&state, body)?;
    let (completion, decision) = state.router.route(&messages).await?;

    debug!(
        request_id = %decision.request_id,
        provider = %decision.provider,
        fallback = decision.is_fallback(),
        "Chat answered"
    );

    Ok(Json(ChatResponse {
        message: completion.content,
        timestamp: decision
            .decided_at
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

/// Stream the answer as server-sent events.
///
/// Each event carries `{"chunk": text}`; the stream ends with `[DONE]`, or
/// with a single `{"error": message}` event if the provider fails midway.
/// Failures before the first chunk answer with the same JSON errors as
/// `/chat`.
pub async fn chat_stream(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let messages = chat_messages(&state, body)?;
    let (chunks, decision) = state.router.route_stream(&messages).await?;

    debug!(
        request_id = %decision.request_id,
        provider = %decision.provider,
        fallback = decision.is_fallback(),
        "Chat stream opened"
    );

    let request_id = decision.request_id;
    let events = stream::unfold(Some(chunks), move |chunks| {
        let request_id = request_id.clone();
        async move {
            let mut chunks = chunks?;
            let event = match chunks.next().await {
                Some(Ok(text)) => {
                    let event = Event::default().data(json!({ "chunk": text }).to_string());
                    return Some((event, Some(chunks)));
                }
                Some(Err(e)) => {
                    warn!(request_id = %request_id, error = %e, "Chat stream failed midway");
                    Event::default().data(json!({ "error": e.to_string() }).to_string())
                }
                None => Event::default().data("[DONE]"),
            };
            Some((event, None))
        }
    })
    .map(Ok::<_, Infallible>);

    Ok((
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response())
}

/// Probe every provider, then report connections, usage and configuration.
pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let connections: BTreeMap<String, bool> = state
        .health
        .probe_all()
        .await
        .into_iter()
        .map(|(name, status)| (name, status.reachable))
        .collect();

    let now = Utc::now();
    let usage = state.metrics.snapshot_at(now);
    let current = state.metrics.model_info_at(now);

    let mut daily = Map::new();
    let mut minute = Map::new();
    let mut last = Map::new();
    let mut services = Map::new();
    let mut environment = Map::new();
    let mut flattened = Map::new();

    for p in &usage.providers {
        daily.insert(p.provider.clone(), json!(p.daily_count));
        minute.insert(p.provider.clone(), json!(p.minute_count));
        last.insert(
            p.provider.clone(),
            json!(
                p.last_request
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            ),
        );
        services.insert(p.provider.clone(), json!(p.available));
        environment.insert(format!("{}Configured", p.provider), json!(p.configured));
        flattened.insert(format!("{}DailyCount", p.provider), json!(p.daily_count));
        flattened.insert(format!("{}MinuteCount", p.provider), json!(p.minute_count));
    }

    let mut usage_body = Map::new();
    usage_body.insert("dailyCount".into(), Value::Object(daily));
    usage_body.insert("minuteCount".into(), Value::Object(minute));
    usage_body.insert("lastRequestTimestamp".into(), Value::Object(last));
    usage_body.insert("services".into(), Value::Object(services));
    for (key, value) in flattened {
        if usage_body.contains_key(&key) {
            return Err(ApiError::Status(format!(
                "provider name collides with usage field '{key}'"
            )));
        }
        usage_body.insert(key, value);
    }

    Ok(Json(json!({
        "status": "success",
        "connections": connections,
        "currentProvider": current,
        "usage": usage_body,
        "quota": state.limiter.stats(),
        "environment": environment,
    })))
}
