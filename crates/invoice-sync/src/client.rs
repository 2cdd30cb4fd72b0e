use std::sync::Arc;

use chrono::NaiveDate;

use crate::error::ClientError;
use crate::request::{Direction, SubjectId};

/// Provider answer to a job creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedJob {
    pub job_id: String,
    pub raw_status: String,
    pub package_ids: Option<Vec<String>>,
}

/// Provider answer to a job status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobVerification {
    pub raw_status: String,
    pub package_ids: Option<Vec<String>>,
    pub error: Option<String>,
}

/// Client for the tax authority's bulk-download service.
///
/// Implementations own their timeouts and must surface them as
/// [`ClientError::TransientNetwork`].
#[async_trait::async_trait]
pub trait ExternalSyncClient: Send + Sync {
    /// Human-readable label identifying the endpoint.
    fn label(&self) -> &str;

    /// Ask the provider to prepare the documents of a date range.
    async fn create_job(
        &self,
        subject: &SubjectId,
        from: NaiveDate,
        to: NaiveDate,
        direction: Direction,
    ) -> Result<CreatedJob, ClientError>;

    /// Poll a previously created job.
    async fn verify_job(
        &self,
        subject: &SubjectId,
        job_id: &str,
    ) -> Result<JobVerification, ClientError>;

    /// Download the raw archive of one package.
    async fn fetch_package(
        &self,
        subject: &SubjectId,
        package_id: &str,
    ) -> Result<Vec<u8>, ClientError>;
}

#[async_trait::async_trait]
impl<T: ExternalSyncClient + ?Sized> ExternalSyncClient for Arc<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    async fn create_job(
        &self,
        subject: &SubjectId,
        from: NaiveDate,
        to: NaiveDate,
        direction: Direction,
    ) -> Result<CreatedJob, ClientError> {
        (**self).create_job(subject, from, to, direction).await
    }

    async fn verify_job(
        &self,
        subject: &SubjectId,
        job_id: &str,
    ) -> Result<JobVerification, ClientError> {
        (**self).verify_job(subject, job_id).await
    }

    async fn fetch_package(
        &self,
        subject: &SubjectId,
        package_id: &str,
    ) -> Result<Vec<u8>, ClientError> {
        (**self).fetch_package(subject, package_id).await
    }
}
