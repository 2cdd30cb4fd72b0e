use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RepositoryError;
use crate::request::{RequestId, SubjectId, SyncRequest};

/// Severity of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Pipeline step an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Create,
    Verify,
    Download,
    Import,
    Edit,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Verify => "verify",
            Self::Download => "download",
            Self::Import => "import",
            Self::Edit => "edit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "verify" => Some(Self::Verify),
            "download" => Some(Self::Download),
            "import" => Some(Self::Import),
            "edit" => Some(Self::Edit),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only record of a stage transition or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub subject_id: SubjectId,
    pub request_id: Option<RequestId>,
    pub job_id: Option<String>,
    pub stage: Stage,
    pub level: AuditLevel,
    pub message: String,
    pub details: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        subject_id: SubjectId,
        stage: Stage,
        level: AuditLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            subject_id,
            request_id: None,
            job_id: None,
            stage,
            level,
            message: message.into(),
            details: serde_json::Value::Null,
            recorded_at: Utc::now(),
        }
    }

    /// Entry attached to a request, carrying its subject and job id.
    pub fn for_request(
        request: &SyncRequest,
        stage: Stage,
        level: AuditLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Some(request.id.clone()),
            job_id: request.external_job_id.clone(),
            ..Self::new(request.subject_id.clone(), stage, level, message)
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == AuditLevel::Error
    }
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            AuditLevel::Info => write!(f, "[{}] {}", self.stage, self.message),
            AuditLevel::Warning => write!(f, "[{}] warning: {}", self.stage, self.message),
            AuditLevel::Error => write!(f, "[{}] error: {}", self.stage, self.message),
        }
    }
}

/// Append-only audit trail.
#[async_trait::async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<(), RepositoryError>;

    /// Entries attached to one request, in the order they were appended.
    async fn entries_for(&self, request_id: &RequestId) -> Result<Vec<AuditEntry>, RepositoryError>;
}

/// Mirror an entry to tracing and append it to the trail.
///
/// A failing audit write is logged and dropped so it never fails the stage
/// that produced the entry.
pub(crate) async fn record(log: &dyn AuditLog, entry: AuditEntry) {
    let request_id = entry.request_id.as_ref().map(RequestId::as_str).unwrap_or("-");
    match entry.level {
        AuditLevel::Info => tracing::info!(
            subject = %entry.subject_id,
            request = request_id,
            stage = %entry.stage,
            "{}",
            entry.message
        ),
        AuditLevel::Warning => tracing::warn!(
            subject = %entry.subject_id,
            request = request_id,
            stage = %entry.stage,
            "{}",
            entry.message
        ),
        AuditLevel::Error => tracing::error!(
            subject = %entry.subject_id,
            request = request_id,
            stage = %entry.stage,
            "{}",
            entry.message
        ),
    }

    if let Err(e) = log.append(entry).await {
        tracing::warn!(error = %e, "failed to append audit entry");
    }
}
