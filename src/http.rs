//! HTTP 接入层（axum）
//!
//! 路由：
//! - `POST /chat`：处理一条用户消息，返回回复与当前阶段
//! - `POST /chat/stream`：同上，以 NDJSON 逐行推送编排事件，最后一行为回复
//! - `POST /location`：更新会话的设备位置
//! - `GET /sessions`、`GET /session/:id`、`DELETE /session/:id`、`POST /session/:id/abort`
//! - `GET /health`

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::agent::{process_message, process_message_stream, AgentComponents, InboundMessage};
use crate::core::{
    BookingRecord, BusinessState, Coordinates, DispatchError, EngineEvent, Stage, StageChange,
    ToolInvocation,
};
use crate::session::SessionSummary;

#[derive(Clone)]
pub struct AppState {
    pub components: Arc<AgentComponents>,
}

impl AppState {
    pub fn new(components: Arc<AgentComponents>) -> Self {
        Self { components }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(api_chat))
        .route("/chat/stream", post(api_chat_stream))
        .route("/location", post(api_location))
        .route("/sessions", get(api_sessions_list))
        .route("/session/:id", get(api_session_get).delete(api_session_delete))
        .route("/session/:id/abort", post(api_session_abort))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl ChatRequest {
    fn into_inbound(self) -> Result<InboundMessage, ApiError> {
        let text = self.message.trim().to_string();
        if text.is_empty() {
            return Err(ApiError::bad_request("message is required"));
        }
        let mut msg = InboundMessage::new(self.session_id.as_deref(), text);
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => msg = msg.with_location(Coordinates::new(lat, lon)),
            (None, None) => {}
            _ => return Err(ApiError::bad_request("latitude and longitude must be sent together")),
        }
        Ok(msg)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub reply: String,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking: Option<BookingRecord>,
}

#[derive(Debug, Deserialize)]
pub struct LocationRequest {
    pub session_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// 会话详情：摘要、完整业务状态、阶段历史与执行日志。
/// 回合进行中（busy）只返回最近发布的摘要。
#[derive(Debug, Serialize)]
pub struct SessionDetail {
    pub summary: SessionSummary,
    pub busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<BusinessState>,
    pub history: Vec<StageChange>,
    pub invocations: Vec<ToolInvocation>,
}

/// 错误响应体 `{error, kind}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.to_string(),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let status = status_for(&err);
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message, "kind": self.kind });
        (self.status, Json(body)).into_response()
    }
}

fn status_for(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::SessionNotFound(_) | DispatchError::SessionExpired(_) => {
            StatusCode::NOT_FOUND
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn api_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let msg = req.into_inbound()?;
    let reply = process_message(&state.components, msg).await?;
    Ok(Json(ChatResponse {
        session_id: reply.session_id,
        reply: reply.assistant_text,
        stage: reply.stage,
        booking: reply.booking,
    }))
}

async fn api_chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let msg = req.into_inbound()?;
    let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
    let components = Arc::clone(&state.components);

    tokio::spawn(async move {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<EngineEvent>();
        let run = process_message_stream(&components, msg, event_tx);
        tokio::pin!(run);
        let result = loop {
            tokio::select! {
                Some(ev) = event_rx.recv() => {
                    let _ = line_tx.send(ndjson_line(&ev));
                }
                res = &mut run => break res,
            }
        };
        while let Ok(ev) = event_rx.try_recv() {
            let _ = line_tx.send(ndjson_line(&ev));
        }
        let last = match result {
            Ok(reply) => serde_json::json!({
                "type": "reply",
                "session_id": reply.session_id,
                "reply": reply.assistant_text,
                "stage": reply.stage,
                "booking": reply.booking,
            }),
            Err(e) => serde_json::json!({
                "type": "error",
                "error": e.to_string(),
                "kind": e.kind(),
            }),
        };
        let _ = line_tx.send(format!("{}\n", last));
    });

    let body = stream::unfold(line_rx, |mut rx| async move {
        rx.recv().await.map(|line| (Ok::<_, Infallible>(line), rx))
    });
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(body))
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: e.to_string(),
        })?)
}

fn ndjson_line<T: Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(s) => format!("{}\n", s),
        Err(e) => format!("{}\n", serde_json::json!({ "type": "encode_error", "error": e.to_string() })),
    }
}

async fn api_sessions_list(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.components.sessions.list().await)
}

async fn api_session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetail>, ApiError> {
    let handle = state.components.sessions.get(&id).await?;
    let detail = match handle.try_lock() {
        Some(session) => SessionDetail {
            summary: session.summary(),
            busy: false,
            state: Some(session.business.current().clone()),
            history: session.business.history().to_vec(),
            invocations: session.execution.log().to_vec(),
        },
        None => SessionDetail {
            summary: handle.summary(),
            busy: true,
            state: None,
            history: Vec::new(),
            invocations: Vec::new(),
        },
    };
    Ok(Json(detail))
}

async fn api_location(
    State(state): State<AppState>,
    Json(req): Json<LocationRequest>,
) -> Result<Json<SessionSummary>, ApiError> {
    let at = Coordinates::new(req.latitude, req.longitude);
    if !at.is_valid() {
        return Err(ApiError::bad_request("latitude or longitude out of range"));
    }
    let summary = state
        .components
        .sessions
        .set_device_location(&req.session_id, at)
        .await?;
    Ok(Json(summary))
}

/// 结束会话：非终态会话进入 Failed("expired") 并从会话表移除
async fn api_session_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    Ok(Json(state.components.sessions.expire(&id).await?))
}

async fn api_session_abort(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    Ok(Json(state.components.sessions.abort(&id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&DispatchError::SessionNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&DispatchError::SessionExpired("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&DispatchError::PlannerUnavailable("down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_chat_request_requires_both_coordinates() {
        let req = ChatRequest {
            session_id: None,
            message: "help".into(),
            latitude: Some(12.9),
            longitude: None,
        };
        assert!(req.into_inbound().is_err());

        let req = ChatRequest {
            session_id: None,
            message: "   ".into(),
            latitude: None,
            longitude: None,
        };
        assert!(req.into_inbound().is_err());
    }
}
