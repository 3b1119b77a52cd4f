//! REST client for the generation backend plus the seam traits the
//! streaming state machines consume.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::auth::TokenProvider;
use crate::config::ClientConfig;
use crate::errors::ApiError;
use crate::generation::{GenerationOptions, GenerationRequest, GenerationSession};
use crate::transport::{EventStreamTransport, StreamHandle, StreamRequest};

/// Job lifecycle states reported by the status endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    /// Terminal states admit no further transitions; once observed, log
    /// subscriptions stop reconnecting.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Opaque reference to a submitted backend job.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: String,
}

/// Snapshot of a job returned by the status endpoint.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: String,
    pub status: JobState,
    #[serde(default)]
    pub current_round: Option<u32>,
    #[serde(default)]
    pub max_rounds: Option<u32>,
    #[serde(default)]
    pub contract_locked: Option<bool>,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default)]
    pub sandbox_url: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

/// Request body for submitting a generation job.
#[derive(Clone, Debug, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    pub requirement: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_spec_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rounds: Option<u32>,
}

impl SubmitJobRequest {
    pub fn new(requirement: impl Into<String>) -> Self {
        Self {
            requirement: requirement.into(),
            ..Self::default()
        }
    }
}

/// Artifact listing entry for a job.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSummary {
    pub id: String,
    pub file_path: String,
    #[serde(default)]
    pub generated_by: Option<String>,
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub has_errors: bool,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Full artifact record including its content.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactContent {
    pub id: String,
    pub file_path: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub compiler_output: Option<String>,
    #[serde(default)]
    pub has_errors: bool,
}

/// Response envelope every REST endpoint wraps its payload in.
#[derive(Debug, serde::Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct ApiEnvelope<T> {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<T>,
}

/// Connects log-stream sessions for a job id.
///
/// `Client` is the production implementation; tests substitute fakes.
#[async_trait]
pub trait LogStreamConnector: Send + Sync {
    async fn connect_logs(&self, job_id: &str) -> StreamHandle;
}

/// Re-fetches job status, used to decide whether a reconnect is warranted.
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn job_status(&self, job_id: &str) -> Result<JobStatus, ApiError>;
}

/// Sandbox keep-alive and release operations.
#[async_trait]
pub trait SandboxApi: Send + Sync {
    async fn ping(&self, sandbox_id: &str) -> Result<(), ApiError>;
    async fn release(&self, sandbox_id: &str) -> Result<(), ApiError>;
}

/// Backend API client.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    config: ClientConfig,
    tokens: Arc<dyn TokenProvider>,
    transport: EventStreamTransport,
}

impl Client {
    pub fn new(config: ClientConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::request(format!("failed to build http client: {e}")))?;
        // Streams outlive the REST timeout, so they get their own client.
        let stream_http = reqwest::Client::builder()
            .build()
            .map_err(|e| ApiError::request(format!("failed to build http client: {e}")))?;
        let transport = EventStreamTransport::new(stream_http, tokens.clone());
        Ok(Self {
            http,
            config,
            tokens,
            transport,
        })
    }

    /// The streaming transport sharing this client's auth.
    pub fn transport(&self) -> &EventStreamTransport {
        &self.transport
    }

    /// Submits a generation job and returns its handle.
    pub async fn submit_job(&self, request: SubmitJobRequest) -> Result<JobHandle, ApiError> {
        debug!(requirement_len = request.requirement.len(), "submitting job");
        self.post_json("/v1/g3/jobs", serde_json::to_value(&request).unwrap_or_default())
            .await
    }

    /// Fetches the current status snapshot for a job.
    pub async fn job_status(&self, job_id: &str) -> Result<JobStatus, ApiError> {
        self.get_json(&format!("/v1/g3/jobs/{job_id}")).await
    }

    /// Lists artifacts produced by a job.
    pub async fn list_artifacts(&self, job_id: &str) -> Result<Vec<ArtifactSummary>, ApiError> {
        self.get_json(&format!("/v1/g3/jobs/{job_id}/artifacts")).await
    }

    /// Fetches one artifact including its content.
    pub async fn artifact_content(
        &self,
        job_id: &str,
        artifact_id: &str,
    ) -> Result<ArtifactContent, ApiError> {
        self.get_json(&format!("/v1/g3/jobs/{job_id}/artifacts/{artifact_id}/content"))
            .await
    }

    /// Sends one sandbox keep-alive ping.
    pub async fn ping_sandbox(&self, sandbox_id: &str) -> Result<(), ApiError> {
        self.post_unit(
            "/v1/openlovable/heartbeat",
            serde_json::json!({ "sandboxId": sandbox_id }),
        )
        .await
    }

    /// Opens a code-generation stream session for an app spec.
    pub fn start_generation(
        &self,
        request: GenerationRequest,
        options: GenerationOptions,
    ) -> GenerationSession {
        let url = self.config.endpoint("/v1/code-generation/stream");
        let body = serde_json::to_value(&request).unwrap_or_default();
        GenerationSession::attach(self.transport.open(StreamRequest::post(url, body)), options)
    }

    /// Releases a sandbox. One-shot; safe to fire and forget.
    pub async fn release_sandbox(&self, sandbox_id: &str) -> Result<(), ApiError> {
        self.post_unit(
            "/v1/openlovable/cleanup",
            serde_json::json!({ "sandboxId": sandbox_id }),
        )
        .await
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.tokens.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.config.endpoint(path);
        let response = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .map_err(|e| ApiError::request(e.to_string()))?;
        unwrap_envelope(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, ApiError> {
        let url = self.config.endpoint(path);
        let response = self
            .authorize(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::request(e.to_string()))?;
        unwrap_envelope(response).await
    }

    async fn post_unit(&self, path: &str, body: serde_json::Value) -> Result<(), ApiError> {
        let url = self.config.endpoint(path);
        let response = self
            .authorize(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

async fn unwrap_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ApiError::Http {
            status: status.as_u16(),
            message,
        });
    }
    let envelope: ApiEnvelope<T> = response
        .json()
        .await
        .map_err(|e| ApiError::decode(e.to_string()))?;
    if envelope.success == Some(false) {
        return Err(ApiError::rejected(
            envelope.message.unwrap_or_else(|| "request rejected".into()),
        ));
    }
    envelope
        .data
        .ok_or_else(|| ApiError::decode("envelope carried no data"))
}

#[async_trait]
impl LogStreamConnector for Client {
    async fn connect_logs(&self, job_id: &str) -> StreamHandle {
        let url = self.config.endpoint(&format!("/v1/g3/jobs/{job_id}/logs"));
        self.transport.open(StreamRequest::get(url))
    }
}

#[async_trait]
impl JobStatusSource for Client {
    async fn job_status(&self, job_id: &str) -> Result<JobStatus, ApiError> {
        Client::job_status(self, job_id).await
    }
}

#[async_trait]
impl SandboxApi for Client {
    async fn ping(&self, sandbox_id: &str) -> Result<(), ApiError> {
        self.ping_sandbox(sandbox_id).await
    }

    async fn release(&self, sandbox_id: &str) -> Result<(), ApiError> {
        self.release_sandbox(sandbox_id).await
    }
}
