use std::time::Duration;

use base64::Engine;
use chrono::NaiveDate;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;

use invoice_sync::{
    ClientError, CreatedJob, Direction, ExternalSyncClient, JobVerification, SubjectId,
};

use crate::wire::{
    CreateJobBody, CreateJobResponse, ErrorBody, PackageResponse, VerifyJobResponse,
};

const QUOTA_EXCEEDED: &str = "quota_exceeded";

/// Configuration for the bulk-download gateway.
#[derive(Debug, Clone)]
pub struct HttpSyncClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl HttpSyncClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Talks JSON to the bulk-download gateway.
pub struct HttpSyncClient {
    base_url: Url,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpSyncClient {
    pub fn new(config: HttpSyncClientConfig) -> Result<Self, ClientError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ClientError::Protocol(format!("invalid gateway URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Protocol(format!(
                "gateway URL {base_url} cannot carry a path"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("invoice-sync")
            .build()
            .map_err(|e| ClientError::Protocol(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            token: config.token,
            client,
        })
    }

    /// `{base}/subjects/{subject}/{segments...}` with every segment escaped.
    fn url(&self, subject: &SubjectId, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .push("subjects")
                .push(subject.as_str())
                .extend(segments);
        }
        url
    }

    fn build_request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);

        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        req
    }

    async fn send<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, ClientError> {
        let response = req.send().await.map_err(|e| transport_error(what, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body: ErrorBody = response.json().await.unwrap_or_default();
            return Err(status_error(what, status, body));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::Protocol(format!("{what}: unreadable response: {e}")))
    }
}

fn transport_error(what: &str, e: &reqwest::Error) -> ClientError {
    if e.is_builder() {
        ClientError::Protocol(format!("{what}: {e}"))
    } else if e.is_timeout() {
        ClientError::TransientNetwork(format!("{what}: timed out"))
    } else {
        ClientError::TransientNetwork(format!("{what}: {e}"))
    }
}

fn status_error(what: &str, status: StatusCode, body: ErrorBody) -> ClientError {
    let message = body
        .message
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("no reason").to_owned());

    if status == StatusCode::TOO_MANY_REQUESTS || body.code.as_deref() == Some(QUOTA_EXCEEDED) {
        ClientError::PolicyRejected(message)
    } else if status.is_server_error() {
        ClientError::TransientNetwork(format!("{what} returned HTTP {status}: {message}"))
    } else {
        ClientError::Protocol(format!("{what} returned HTTP {status}: {message}"))
    }
}

#[async_trait::async_trait]
impl ExternalSyncClient for HttpSyncClient {
    fn label(&self) -> &str {
        self.base_url.host_str().unwrap_or("gateway")
    }

    async fn create_job(
        &self,
        subject: &SubjectId,
        from: NaiveDate,
        to: NaiveDate,
        direction: Direction,
    ) -> Result<CreatedJob, ClientError> {
        tracing::debug!(subject = %subject, %from, %to, %direction, "creating job");

        let body = CreateJobBody {
            from,
            to,
            direction: direction.as_str(),
        };
        let req = self
            .build_request(Method::POST, self.url(subject, &["jobs"]))
            .json(&body);
        let created: CreateJobResponse = self.send(req, "job creation").await?;

        Ok(CreatedJob {
            job_id: created.job_id,
            raw_status: created.status.into_string(),
            package_ids: created.package_ids,
        })
    }

    async fn verify_job(
        &self,
        subject: &SubjectId,
        job_id: &str,
    ) -> Result<JobVerification, ClientError> {
        let req = self.build_request(Method::GET, self.url(subject, &["jobs", job_id]));
        let verified: VerifyJobResponse = self.send(req, "job verification").await?;

        Ok(JobVerification {
            raw_status: verified.status.into_string(),
            package_ids: verified.package_ids,
            error: verified.message,
        })
    }

    async fn fetch_package(
        &self,
        subject: &SubjectId,
        package_id: &str,
    ) -> Result<Vec<u8>, ClientError> {
        let req = self.build_request(Method::GET, self.url(subject, &["packages", package_id]));
        let package: PackageResponse = self.send(req, "package download").await?;

        if package.package_id != package_id {
            return Err(ClientError::Protocol(format!(
                "asked for package {package_id}, got {}",
                package.package_id
            )));
        }

        // Gateways may wrap base64 across lines.
        let cleaned: String = package
            .content
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&cleaned)
            .map_err(|e| ClientError::Protocol(format!("package {package_id}: bad base64: {e}")))?;

        tracing::debug!(subject = %subject, package = package_id, bytes = bytes.len(), "package fetched");
        Ok(bytes)
    }
}
