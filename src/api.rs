//! REST API Server for the triage orchestrator
//!
//! Exposes question triage and the audit log via HTTP endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::agent::{Orchestrator, RunOptions};
use crate::models::Question;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QuestionRequest {
    pub question: String,
    #[serde(default)]
    pub context_ref: Option<String>,
    /// Whole-pipeline deadline for this request
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl QuestionRequest {
    fn into_question(self) -> Question {
        let question = Question::new(self.question);
        match self.context_ref {
            Some(context_ref) => question.with_context_ref(context_ref),
            None => question,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub questions: Vec<QuestionRequest>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "tools": state.orchestrator.tools(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Question Endpoints
/// =============================

async fn submit_question(
    State(state): State<ApiState>,
    Json(req): Json<QuestionRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.question.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("question must not be empty".into())),
        );
    }

    let mut options = RunOptions::default();
    if let Some(ms) = req.deadline_ms {
        options = options.with_deadline(Duration::from_millis(ms));
    }
    let question = req.into_question();
    info!(question_id = %question.question_id, "Received question");

    match state.orchestrator.run_with(question, options).await {
        Ok(result) => (StatusCode::OK, Json(ApiResponse::success(result))),
        Err(e) => {
            error!(error = %e, "Question processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("Orchestration failed: {}", e))),
            )
        }
    }
}

async fn submit_batch(
    State(state): State<ApiState>,
    Json(req): Json<BatchRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    info!(count = req.questions.len(), "Received question batch");

    let questions = req
        .questions
        .into_iter()
        .map(QuestionRequest::into_question)
        .collect();

    let results: Vec<serde_json::Value> = state
        .orchestrator
        .run_batch(questions)
        .await
        .into_iter()
        .map(|outcome| match outcome {
            Ok(result) => serde_json::to_value(result).unwrap_or_default(),
            Err(e) => serde_json::json!({ "error": e.to_string(), "reason_code": e.reason_code() }),
        })
        .collect();

    (StatusCode::OK, Json(ApiResponse::success(results)))
}

/// =============================
/// Audit Endpoint
/// =============================

async fn get_audit_record(
    State(state): State<ApiState>,
    Path(question_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    let Ok(question_id) = Uuid::parse_str(&question_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("question_id is not a UUID".into())),
        );
    };

    let audit_log = state.orchestrator.audit_log();
    let record = match audit_log.get(question_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error(format!("No record for {}", question_id))),
            )
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            )
        }
    };
    let verified = audit_log.verify_integrity(question_id).await.unwrap_or(false);

    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "integrity_verified": verified,
            "record": record,
        }))),
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/questions", post(submit_question))
        .route("/api/questions/batch", post(submit_batch))
        .route("/api/audit/:question_id", get(get_audit_record))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let orchestrator = Orchestrator::from_config(OrchestratorConfig::default()).unwrap();
        create_router(Arc::new(orchestrator))
    }

    async fn read_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = read_json(response).await;
        assert_eq!(json["tools"][0]["tool"], "context_search");
        assert_eq!(json["tools"][1]["tool"], "web_search");
    }

    #[tokio::test]
    async fn test_question_then_audit_lookup() {
        let app = app();
        let body = serde_json::json!({
            "question": "What is the current ratio given current assets = 1000 and current liabilities = 400?"
        });

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/questions")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = read_json(response).await;
        assert_eq!(json["data"]["status"], "completed");
        assert_eq!(json["data"]["specialist_result"]["final_value"], 2.5);

        let id = json["data"]["question_id"].as_str().unwrap().to_string();
        let audit = app
            .oneshot(
                Request::get(format!("/api/audit/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(audit.status(), StatusCode::OK);
        assert_eq!(read_json(audit).await["data"]["integrity_verified"], true);
    }

    #[tokio::test]
    async fn test_empty_question_is_bad_request() {
        let response = app()
            .oneshot(
                Request::post("/api/questions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"question": "  "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_audit_record() {
        let response = app()
            .oneshot(
                Request::get(format!("/api/audit/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
