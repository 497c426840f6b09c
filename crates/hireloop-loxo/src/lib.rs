//! Loxo recruiting API client: retrying HTTP, scroll pagination, and a
//! fixture-backed implementation of the same contract.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hireloop_core::{ExternalCandidate, LoxoJob, WorkflowStage};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "hireloop-loxo";

pub const DEFAULT_LOXO_DOMAIN: &str = "app.loxo.co";

#[derive(Debug, Error)]
pub enum LoxoError {
    #[error("request to {resource} failed: {source}")]
    Http {
        resource: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{resource} returned http status {status}: {body}")]
    Status {
        resource: String,
        status: u16,
        body: String,
    },
    #[error("malformed response from {resource}: {source}")]
    Decode {
        resource: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("paginating {resource} failed on page {page}: {source}")]
    Pagination {
        resource: String,
        page: usize,
        #[source]
        source: Box<LoxoError>,
    },
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("loxo configuration error: {0}")]
    Config(String),
}

impl LoxoError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, LoxoError::Validation(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct LoxoConfig {
    pub api_key: String,
    pub base_url: String,
    pub per_page: u32,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl LoxoConfig {
    pub fn from_env() -> Result<Self, LoxoError> {
        let api_key = std::env::var("LOXO_API_KEY")
            .map_err(|_| LoxoError::Config("LOXO_API_KEY is not set".to_string()))?;
        let base_url = match std::env::var("LOXO_BASE_URL") {
            Ok(url) => url,
            Err(_) => {
                let slug = std::env::var("LOXO_SLUG")
                    .map_err(|_| LoxoError::Config("LOXO_SLUG is not set".to_string()))?;
                let domain = std::env::var("LOXO_DOMAIN")
                    .unwrap_or_else(|_| DEFAULT_LOXO_DOMAIN.to_string());
                format!("https://{domain}/api/{slug}")
            }
        };
        Ok(Self {
            api_key,
            base_url,
            per_page: std::env::var("LOXO_PER_PAGE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            timeout: Duration::from_secs(
                std::env::var("LOXO_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            user_agent: Some(
                std::env::var("HIRELOOP_USER_AGENT")
                    .unwrap_or_else(|_| "hireloop-sync/0.1".to_string()),
            ),
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn for_base_url(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            per_page: 100,
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// The recruiting-API operations the sync pipeline depends on.
#[async_trait]
pub trait RecruitingApi: Send + Sync {
    async fn list_jobs(&self) -> Result<Vec<LoxoJob>, LoxoError>;

    async fn get_job(&self, job_id: i64) -> Result<JsonValue, LoxoError>;

    /// Candidates come back without job annotation; see `ExternalCandidate::with_job`.
    async fn list_job_candidates(&self, job_id: i64) -> Result<Vec<ExternalCandidate>, LoxoError>;

    async fn list_workflow_stages(&self) -> Result<Vec<WorkflowStage>, LoxoError>;

    async fn apply_to_job(&self, job_id: i64, candidate: &JsonValue)
        -> Result<JsonValue, LoxoError>;
}

/// Both input halves of an application are required.
pub fn validate_application(
    job_id: Option<i64>,
    candidate: Option<JsonValue>,
) -> Result<(i64, JsonValue), LoxoError> {
    let job_id = job_id
        .filter(|id| *id > 0)
        .ok_or_else(|| LoxoError::Validation("missing jobId".to_string()))?;
    let candidate = candidate
        .filter(|c| match c {
            JsonValue::Object(map) => !map.is_empty(),
            _ => false,
        })
        .ok_or_else(|| LoxoError::Validation("missing candidate information".to_string()))?;
    Ok((job_id, candidate))
}

#[derive(Debug, Deserialize)]
struct ScrollPage {
    #[serde(alias = "results", alias = "candidates", default = "Vec::new")]
    items: Vec<JsonValue>,
    #[serde(default, deserialize_with = "scroll_token")]
    scroll_id: Option<String>,
}

fn scroll_token<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug)]
pub struct LoxoClient {
    client: reqwest::Client,
    config: LoxoConfig,
}

impl LoxoClient {
    pub fn new(config: LoxoConfig) -> Result<Self, LoxoError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|err| LoxoError::Config(format!("building http client: {err}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LoxoConfig {
        &self.config
    }

    fn url(&self, resource: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            resource.trim_start_matches('/')
        )
    }

    /// Sends with retries when `idempotent`; non-idempotent writes get one attempt.
    async fn send(
        &self,
        resource: &str,
        request: reqwest::RequestBuilder,
        idempotent: bool,
    ) -> Result<reqwest::Response, LoxoError> {
        let max_retries = if idempotent {
            self.config.backoff.max_retries
        } else {
            0
        };
        let request = request.bearer_auth(&self.config.api_key);

        for attempt in 0..=max_retries {
            let Some(current) = request.try_clone() else {
                return Err(LoxoError::Config(format!(
                    "request body for {resource} cannot be replayed"
                )));
            };

            match current.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < max_retries
                    {
                        warn!(resource, status = status.as_u16(), attempt, "retrying loxo request");
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(LoxoError::Status {
                        resource: resource.to_string(),
                        status: status.as_u16(),
                        body: body.chars().take(512).collect(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < max_retries
                    {
                        warn!(resource, attempt, error = %err, "retrying loxo request");
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(LoxoError::Http {
                        resource: resource.to_string(),
                        source: err,
                    });
                }
            }
        }

        Err(LoxoError::Config(format!(
            "retry budget for {resource} exhausted"
        )))
    }

    async fn decode<T: DeserializeOwned>(
        resource: &str,
        resp: reqwest::Response,
    ) -> Result<T, LoxoError> {
        let bytes = resp.bytes().await.map_err(|source| LoxoError::Http {
            resource: resource.to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| LoxoError::Decode {
            resource: resource.to_string(),
            source,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        resource: &str,
        query: &[(&str, String)],
    ) -> Result<T, LoxoError> {
        let request = self.client.get(self.url(resource)).query(query);
        let resp = self.send(resource, request, true).await?;
        Self::decode(resource, resp).await
    }

    /// Follows `scroll_id` tokens until the server stops returning one and
    /// returns every item in server order. Any failed page or undecodable
    /// item aborts the whole fetch.
    pub async fn fetch_all_pages<T: DeserializeOwned>(
        &self,
        resource: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<T>, LoxoError> {
        let mut items = Vec::new();
        let mut scroll_id: Option<String> = None;
        let mut page_index = 0usize;

        loop {
            let mut query = params.to_vec();
            query.push(("per_page", self.config.per_page.to_string()));
            if let Some(token) = &scroll_id {
                query.push(("scroll_id", token.clone()));
            }

            let page_error = |source: LoxoError| LoxoError::Pagination {
                resource: resource.to_string(),
                page: page_index,
                source: Box::new(source),
            };
            let page: ScrollPage = self.get_json(resource, &query).await.map_err(page_error)?;

            let fetched = page.items.len();
            for (index, raw) in page.items.into_iter().enumerate() {
                let item = serde_json::from_value::<T>(raw).map_err(|source| {
                    page_error(LoxoError::Decode {
                        resource: format!("{resource} item {index}"),
                        source,
                    })
                })?;
                items.push(item);
            }
            debug!(resource, page = page_index, fetched, total = items.len(), "fetched page");

            match page.scroll_id {
                Some(next) if fetched > 0 => {
                    scroll_id = Some(next);
                    page_index += 1;
                }
                _ => break,
            }
        }

        Ok(items)
    }
}

#[async_trait]
impl RecruitingApi for LoxoClient {
    async fn list_jobs(&self) -> Result<Vec<LoxoJob>, LoxoError> {
        self.fetch_all_pages("/jobs", &[]).await
    }

    async fn get_job(&self, job_id: i64) -> Result<JsonValue, LoxoError> {
        self.get_json(&format!("/jobs/{job_id}"), &[]).await
    }

    async fn list_job_candidates(&self, job_id: i64) -> Result<Vec<ExternalCandidate>, LoxoError> {
        self.fetch_all_pages(&format!("/jobs/{job_id}/candidates"), &[])
            .await
    }

    async fn list_workflow_stages(&self) -> Result<Vec<WorkflowStage>, LoxoError> {
        self.get_json("/workflow_stages", &[]).await
    }

    async fn apply_to_job(
        &self,
        job_id: i64,
        candidate: &JsonValue,
    ) -> Result<JsonValue, LoxoError> {
        let (job_id, candidate) = validate_application(Some(job_id), Some(candidate.clone()))?;
        let resource = format!("/jobs/{job_id}/apply");
        let request = self
            .client
            .post(self.url(&resource))
            .json(&serde_json::json!({ "person": candidate }));
        let resp = self.send(&resource, request, false).await?;
        Self::decode(&resource, resp).await
    }
}

/// Recorded Loxo data: the job list, candidates keyed by job id, the stage
/// taxonomy and job ids whose candidate fetch should fail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoxoFixture {
    #[serde(default)]
    pub jobs: Vec<LoxoJob>,
    #[serde(default)]
    pub candidates: HashMap<i64, Vec<ExternalCandidate>>,
    #[serde(default)]
    pub workflow_stages: Vec<WorkflowStage>,
    #[serde(default)]
    pub failing_jobs: Vec<i64>,
}

pub fn load_fixture(path: impl AsRef<Path>) -> anyhow::Result<LoxoFixture> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub job_id: i64,
    pub person: JsonValue,
}

/// In-process `RecruitingApi` backed by a `LoxoFixture`.
#[derive(Debug, Default)]
pub struct FixtureRecruitingApi {
    fixture: LoxoFixture,
    failing_jobs: HashSet<i64>,
    submissions: Mutex<Vec<Submission>>,
}

impl FixtureRecruitingApi {
    pub fn new(fixture: LoxoFixture) -> Self {
        let failing_jobs = fixture.failing_jobs.iter().copied().collect();
        Self {
            fixture,
            failing_jobs,
            submissions: Mutex::new(Vec::new()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(load_fixture(path)?))
    }

    pub async fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().await.clone()
    }

    fn unavailable(resource: String) -> LoxoError {
        LoxoError::Status {
            resource,
            status: 503,
            body: "fixture marks this job as failing".to_string(),
        }
    }
}

#[async_trait]
impl RecruitingApi for FixtureRecruitingApi {
    async fn list_jobs(&self) -> Result<Vec<LoxoJob>, LoxoError> {
        Ok(self.fixture.jobs.clone())
    }

    async fn get_job(&self, job_id: i64) -> Result<JsonValue, LoxoError> {
        let resource = format!("/jobs/{job_id}");
        let job = self
            .fixture
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .ok_or_else(|| LoxoError::Status {
                resource: resource.clone(),
                status: 404,
                body: "job not found".to_string(),
            })?;
        serde_json::to_value(job).map_err(|source| LoxoError::Decode { resource, source })
    }

    async fn list_job_candidates(&self, job_id: i64) -> Result<Vec<ExternalCandidate>, LoxoError> {
        if self.failing_jobs.contains(&job_id) {
            return Err(Self::unavailable(format!("/jobs/{job_id}/candidates")));
        }
        Ok(self
            .fixture
            .candidates
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_workflow_stages(&self) -> Result<Vec<WorkflowStage>, LoxoError> {
        Ok(self.fixture.workflow_stages.clone())
    }

    async fn apply_to_job(
        &self,
        job_id: i64,
        candidate: &JsonValue,
    ) -> Result<JsonValue, LoxoError> {
        let (job_id, person) = validate_application(Some(job_id), Some(candidate.clone()))?;
        let mut submissions = self.submissions.lock().await;
        submissions.push(Submission { job_id, person });
        Ok(serde_json::json!({
            "job_id": job_id,
            "status": "applied",
            "submission": submissions.len()
        }))
    }
}
