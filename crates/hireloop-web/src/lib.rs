//! Axum routes over the Loxo sync pipeline.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hireloop_core::{ExternalCandidate, JobLink};
use hireloop_loxo::{validate_application, LoxoError};
use hireloop_sync::{SyncError, SyncPipeline};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "hireloop-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub status_code: u16,
    pub data: Option<T>,
    pub message: String,
    pub success: bool,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T, message: impl Into<String>) -> Response {
        Json(ApiResponse {
            status_code: StatusCode::OK.as_u16(),
            data: Some(data),
            message: message.into(),
            success: true,
        })
        .into_response()
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            status_code: status.as_u16(),
            data: None,
            message: message.into(),
            success: false,
        }),
    )
        .into_response()
}

fn loxo_status(err: &LoxoError) -> StatusCode {
    match err {
        LoxoError::Validation(_) => StatusCode::BAD_REQUEST,
        LoxoError::Status { status: 404, .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn loxo_failure(err: LoxoError) -> Response {
    let status = loxo_status(&err);
    if status.is_server_error() {
        error!(error = %err, "loxo request failed");
    }
    failure(status, err.to_string())
}

fn sync_failure(err: SyncError) -> Response {
    match err {
        SyncError::Stage(err) => failure(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
        SyncError::Upstream { source, .. } if source.is_client_error() => {
            failure(StatusCode::BAD_REQUEST, source.to_string())
        }
        other => {
            error!(error = %other, "loxo sync failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/loxo/sync", post(sync_handler))
        .route("/api/loxo/stages", get(stages_handler))
        .route("/api/loxo/candidates", get(candidates_handler))
        .route("/api/loxo/jobs", get(jobs_handler))
        .route("/api/loxo/jobs/{job_id}", get(job_handler))
        .route("/api/loxo/jobs/{job_id}/candidates", get(job_candidates_handler))
        .route("/api/loxo/apply", post(apply_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<SyncPipeline>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("HIRELOOP_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(Arc::new(SyncPipeline::from_env().await?)).await
}

#[derive(Debug, Default, Deserialize)]
struct StageQuery {
    stage: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncPayload {
    all_filtered: Vec<ExternalCandidate>,
    newly_added: Vec<JobLink>,
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StageQuery>,
) -> Response {
    match state.pipeline.run_once(query.stage.as_deref()).await {
        Ok(summary) => {
            let message = summary.message();
            ApiResponse::ok(
                SyncPayload {
                    all_filtered: summary.all_filtered,
                    newly_added: summary.newly_added,
                },
                message,
            )
        }
        Err(err) => sync_failure(err),
    }
}

async fn stages_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.workflow_stages().await {
        Ok(stages) => {
            let message = format!("{} workflow stages", stages.len());
            ApiResponse::ok(stages, message)
        }
        Err(err) => sync_failure(err),
    }
}

async fn candidates_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.all_candidates().await {
        Ok(aggregation) => {
            let message = format!(
                "{} candidates across {} jobs ({} failed)",
                aggregation.candidates.len(),
                aggregation.jobs_total,
                aggregation.failed_jobs.len()
            );
            ApiResponse::ok(aggregation.candidates, message)
        }
        Err(err) => sync_failure(err),
    }
}

async fn jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.api().list_jobs().await {
        Ok(jobs) => {
            let message = format!("{} jobs", jobs.len());
            ApiResponse::ok(jobs, message)
        }
        Err(err) => loxo_failure(err),
    }
}

async fn job_handler(State(state): State<Arc<AppState>>, Path(job_id): Path<i64>) -> Response {
    match state.pipeline.api().get_job(job_id).await {
        Ok(job) => ApiResponse::ok(job, "job fetched"),
        Err(err) => loxo_failure(err),
    }
}

async fn job_candidates_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<i64>,
    Query(query): Query<StageQuery>,
) -> Response {
    let stage = query
        .stage
        .unwrap_or_else(|| state.pipeline.config().target_stage.clone());
    match state
        .pipeline
        .candidates_for_job_in_stage(job_id, &stage)
        .await
    {
        Ok(candidates) => {
            let message = format!("{} candidates in stage '{}'", candidates.len(), stage);
            ApiResponse::ok(candidates, message)
        }
        Err(err) => sync_failure(err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApplyRequest {
    #[serde(rename = "jobId", default)]
    job_id: Option<JsonValue>,
    #[serde(default)]
    candidate: Option<JsonValue>,
}

fn job_id_from(value: Option<JsonValue>) -> Option<i64> {
    match value? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

async fn apply_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ApplyRequest>, JsonRejection>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let job_id = job_id_from(request.job_id);
    let (job_id, candidate) = match validate_application(job_id, request.candidate) {
        Ok(valid) => valid,
        Err(err) => return loxo_failure(err),
    };
    match state.pipeline.api().apply_to_job(job_id, &candidate).await {
        Ok(ack) => {
            info!(job_id, "application submitted");
            ApiResponse::ok(ack, "application submitted")
        }
        Err(err) => loxo_failure(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use hireloop_core::{LoxoJob, WorkflowStage};
    use hireloop_loxo::{FixtureRecruitingApi, LoxoFixture};
    use hireloop_storage::{CandidateStore, MemoryCandidateStore};
    use hireloop_sync::SyncConfig;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    fn test_fixture() -> LoxoFixture {
        let candidate = |id: i64, stage: i64, person: i64| -> ExternalCandidate {
            serde_json::from_value(json!({
                "id": id,
                "workflow_stage_id": stage,
                "person": {"id": person, "name": "Sam Rivera", "country": "US"}
            }))
            .unwrap()
        };
        LoxoFixture {
            jobs: vec![
                LoxoJob {
                    id: 1,
                    title: Some("Bookkeeper".into()),
                    published_name: None,
                },
                LoxoJob {
                    id: 2,
                    title: Some("Analyst".into()),
                    published_name: None,
                },
            ],
            candidates: [
                (1, vec![candidate(10, 2, 100), candidate(11, 1, 101)]),
                (2, vec![candidate(20, 2, 100)]),
            ]
            .into_iter()
            .collect(),
            workflow_stages: vec![
                WorkflowStage {
                    id: 1,
                    name: "Sourced".into(),
                },
                WorkflowStage {
                    id: 2,
                    name: "Pre Qualified".into(),
                },
            ],
            failing_jobs: vec![],
        }
    }

    fn test_app() -> (Router, Arc<MemoryCandidateStore>) {
        let store = Arc::new(MemoryCandidateStore::new());
        let pipeline = SyncPipeline::new(
            SyncConfig::default(),
            Arc::new(FixtureRecruitingApi::new(test_fixture())),
            store.clone(),
        );
        (app(AppState::new(Arc::new(pipeline))), store)
    }

    async fn body_json(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    async fn call(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn post_json(uri: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn sync_route_returns_filtered_and_new_links() {
        let (app, store) = test_app();
        let resp = call(&app, post_empty("/api/loxo/sync")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["statusCode"], 200);
        assert_eq!(body["data"]["allFiltered"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"]["newlyAdded"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"]["newlyAdded"][0]["loxoJobId"], 1);
        assert_eq!(store.persons().await.len(), 1);

        let again = call(&app, post_empty("/api/loxo/sync")).await;
        let body = body_json(again).await;
        assert_eq!(body["data"]["newlyAdded"].as_array().unwrap().len(), 0);
        assert_eq!(store.list_job_links().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sync_with_unknown_stage_is_unprocessable() {
        let (app, store) = test_app();
        let resp = call(&app, post_empty("/api/loxo/sync?stage=Placed")).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("Placed"));
        assert!(store.persons().await.is_empty());
    }

    #[tokio::test]
    async fn read_routes_pass_through_loxo_data() {
        let (app, _store) = test_app();

        let stages = body_json(call(&app, get("/api/loxo/stages")).await).await;
        assert_eq!(stages["data"].as_array().unwrap().len(), 2);

        let candidates = body_json(call(&app, get("/api/loxo/candidates")).await).await;
        assert_eq!(candidates["data"].as_array().unwrap().len(), 3);
        assert_eq!(candidates["data"][2]["jobTitle"], "Analyst");

        let job = body_json(call(&app, get("/api/loxo/jobs/2")).await).await;
        assert_eq!(job["data"]["title"], "Analyst");

        let missing = call(&app, get("/api/loxo/jobs/99")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let uri = "/api/loxo/jobs/1/candidates?stage=sourced";
        let sourced = body_json(call(&app, get(uri)).await).await;
        assert_eq!(sourced["data"].as_array().unwrap().len(), 1);
        assert_eq!(sourced["data"][0]["id"], 11);
    }

    #[tokio::test]
    async fn apply_requires_job_and_candidate() {
        let (app, _store) = test_app();

        let missing_job = call(
            &app,
            post_json("/api/loxo/apply", json!({"candidate": {"name": "Sam"}})),
        )
        .await;
        assert_eq!(missing_job.status(), StatusCode::BAD_REQUEST);

        let missing_candidate = call(&app, post_json("/api/loxo/apply", json!({"jobId": 1}))).await;
        assert_eq!(missing_candidate.status(), StatusCode::BAD_REQUEST);

        let body = json!({
            "jobId": "1",
            "candidate": {"name": "Sam", "email": "sam@example.com"}
        });
        let ok = call(&app, post_json("/api/loxo/apply", body)).await;
        assert_eq!(ok.status(), StatusCode::OK);
        let body = body_json(ok).await;
        assert_eq!(body["data"]["job_id"], 1);
    }
}
