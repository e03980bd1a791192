//! HTTP 接口（axum，feature `web`）
//!
//! Execution API、Approval API、入站事件与 webhook 触发，以及终态事件的 SSE 推送。

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::approval::{ApprovalStatus, PendingApproval};
use crate::core::{AgentError, Engine, Execution, ExecutionResult, ExecutionStatus};
use crate::store::ExecutionFilter;
use crate::trigger::{InboundEvent, TriggerAdapter};

/// 未指定审批人时记录的名称
const DEFAULT_RESOLVER: &str = "operator";
/// `wait_ms` 上限
const MAX_WAIT_MS: u64 = 60_000;

type ApiError = (StatusCode, String);

fn error_response(e: AgentError) -> ApiError {
    let status = match &e {
        AgentError::NotFound(_) => StatusCode::NOT_FOUND,
        AgentError::Validation(_) => StatusCode::BAD_REQUEST,
        AgentError::AlreadyResolved(_) | AgentError::InvalidTransition { .. } => StatusCode::CONFLICT,
        AgentError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %e, "request failed");
    }
    (status, e.to_string())
}

#[derive(Clone)]
struct ApiState {
    triggers: TriggerAdapter,
}

impl ApiState {
    fn engine(&self) -> &Engine {
        self.triggers.engine()
    }
}

/// 构建路由
pub fn router(engine: Engine) -> Router {
    let state = ApiState {
        triggers: TriggerAdapter::new(engine),
    };
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/executions", get(list_executions).post(create_execution))
        .route("/executions/:id", get(get_execution))
        .route("/executions/:id/cancel", post(cancel_execution))
        .route("/approvals", get(list_approvals))
        .route("/approvals/:id", get(get_approval))
        .route("/approvals/:id/approve", post(approve))
        .route("/approvals/:id/deny", post(deny))
        .route("/events", post(post_event))
        .route("/events/stream", get(event_stream))
        .route("/webhooks/:agent_id", post(webhook))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CreateExecutionRequest {
    agent_id: String,
    #[serde(default)]
    input: Value,
    /// 等待到终态或挂起的毫秒数；0 表示立即返回
    #[serde(default)]
    wait_ms: u64,
}

#[derive(Debug, Serialize)]
struct CreateExecutionResponse {
    execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    execution: Option<Execution>,
}

/// POST /executions
async fn create_execution(
    State(state): State<ApiState>,
    Json(req): Json<CreateExecutionRequest>,
) -> Result<(StatusCode, Json<CreateExecutionResponse>), ApiError> {
    let execution_id = state
        .triggers
        .manual(&req.agent_id, req.input)
        .await
        .map_err(error_response)?;
    let execution = if req.wait_ms > 0 {
        let wait = Duration::from_millis(req.wait_ms.min(MAX_WAIT_MS));
        Some(
            state
                .engine()
                .wait_until_settled(&execution_id, wait)
                .await
                .map_err(error_response)?,
        )
    } else {
        None
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateExecutionResponse { execution_id, execution }),
    ))
}

#[derive(Debug, Deserialize)]
struct ListExecutionsQuery {
    agent_id: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
}

/// GET /executions?agent_id=&status=&limit=
async fn list_executions(
    State(state): State<ApiState>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<Vec<Execution>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            ExecutionStatus::parse(s).ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown status: {s}")))?,
        ),
        None => None,
    };
    let filter = ExecutionFilter {
        agent_id: query.agent_id,
        status,
        limit: query.limit,
    };
    state
        .engine()
        .list_executions(&filter)
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /executions/:id
async fn get_execution(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionResult>, ApiError> {
    state.engine().execution(&id).await.map(Json).map_err(error_response)
}

/// POST /executions/:id/cancel
async fn cancel_execution(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Execution>, ApiError> {
    state.engine().cancel(&id).await.map(Json).map_err(error_response)
}

#[derive(Debug, Deserialize)]
struct ListApprovalsQuery {
    status: Option<String>,
}

/// GET /approvals?status=pending
async fn list_approvals(
    State(state): State<ApiState>,
    Query(query): Query<ListApprovalsQuery>,
) -> Result<Json<Vec<PendingApproval>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            ApprovalStatus::parse(s).ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown status: {s}")))?,
        ),
        None => None,
    };
    state.engine().approvals(status).await.map(Json).map_err(error_response)
}

/// GET /approvals/:id
async fn get_approval(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<PendingApproval>, ApiError> {
    state.engine().approval(&id).await.map(Json).map_err(error_response)
}

#[derive(Debug, Default, Deserialize)]
struct ApproveRequest {
    resolver: Option<String>,
    notes: Option<String>,
}

/// POST /approvals/:id/approve
async fn approve(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<Json<ApproveRequest>>,
) -> Result<Json<PendingApproval>, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let resolver = req.resolver.unwrap_or_else(|| DEFAULT_RESOLVER.to_string());
    state
        .engine()
        .approve(&id, &resolver, req.notes)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
struct DenyRequest {
    resolver: Option<String>,
    reason: String,
}

/// POST /approvals/:id/deny
async fn deny(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<DenyRequest>,
) -> Result<Json<PendingApproval>, ApiError> {
    let reason = req.reason.trim();
    if reason.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "reason is required".to_string()));
    }
    let resolver = req.resolver.unwrap_or_else(|| DEFAULT_RESOLVER.to_string());
    state
        .engine()
        .deny(&id, &resolver, reason)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Serialize)]
struct DispatchResponse {
    execution_ids: Vec<String>,
}

/// POST /events
async fn post_event(
    State(state): State<ApiState>,
    Json(event): Json<InboundEvent>,
) -> Result<(StatusCode, Json<DispatchResponse>), ApiError> {
    let execution_ids = state.triggers.dispatch_event(&event).await.map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(DispatchResponse { execution_ids })))
}

/// POST /webhooks/:agent_id
async fn webhook(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<DispatchResponse>), ApiError> {
    let id = state.triggers.webhook(&agent_id, payload).await.map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(DispatchResponse { execution_ids: vec![id] })))
}

/// GET /events/stream：终态事件 SSE
async fn event_stream(
    State(state): State<ApiState>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.engine().subscribe();
    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    return Some((Ok(Event::default().event(event.topic.clone()).data(data)), rx));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::config::AppConfig;
    use crate::core::EngineBuilder;
    use crate::llm::ScriptedLlmClient;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn engine() -> Engine {
        let mut webhook_agent = AgentConfig::new("hooks", "Handle webhooks.");
        webhook_agent.triggers.webhook = true;
        EngineBuilder::new(AppConfig::default())
            .with_llm(Arc::new(ScriptedLlmClient::new().then_always(r#"{"final_answer": "done"}"#)))
            .with_agent(AgentConfig::new("helper", "You help."))
            .with_agent(webhook_agent)
            .build()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_fetch_execution() {
        let app = router(engine());
        let resp = app
            .clone()
            .oneshot(post_json(
                "/executions",
                json!({"agent_id": "helper", "input": "hi", "wait_ms": 2000}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        assert_eq!(body["execution"]["status"], "completed");
        let id = body["execution_id"].as_str().unwrap().to_string();

        let resp = app
            .oneshot(Request::builder().uri(format!("/executions/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["execution"]["output"], "done");
        assert_eq!(body["steps"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_404() {
        let resp = router(engine())
            .oneshot(post_json("/executions", json!({"agent_id": "ghost", "input": "hi"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_approval_status_is_400() {
        let resp = router(engine())
            .oneshot(Request::builder().uri("/approvals?status=maybe").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_deny_requires_reason() {
        let resp = router(engine())
            .oneshot(post_json("/approvals/abc/deny", json!({"reason": "  "})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_trigger() {
        let app = router(engine());
        let resp = app
            .clone()
            .oneshot(post_json("/webhooks/hooks", json!({"ref": "main"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["execution_ids"].as_array().unwrap().len(), 1);

        let resp = app
            .oneshot(post_json("/webhooks/helper", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
