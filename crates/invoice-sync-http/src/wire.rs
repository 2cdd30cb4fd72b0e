use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Body of `POST /subjects/{subject}/jobs`.
#[derive(Debug, Serialize)]
pub struct CreateJobBody<'a> {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub direction: &'a str,
}

/// Answer to a job creation.
#[derive(Debug, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: String,
    pub status: RawStatus,
    #[serde(default)]
    pub package_ids: Option<Vec<String>>,
}

/// Answer to `GET /subjects/{subject}/jobs/{job_id}`.
#[derive(Debug, Deserialize)]
pub struct VerifyJobResponse {
    pub status: RawStatus,
    #[serde(default)]
    pub package_ids: Option<Vec<String>>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Answer to `GET /subjects/{subject}/packages/{package_id}`.
/// `content` is the base64-encoded archive.
#[derive(Debug, Deserialize)]
pub struct PackageResponse {
    pub package_id: String,
    pub content: String,
}

/// Error body returned with non-success statuses.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Provider status, sent either as a numeric code or as text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RawStatus {
    Code(i64),
    Text(String),
}

impl RawStatus {
    pub fn into_string(self) -> String {
        match self {
            Self::Code(code) => code.to_string(),
            Self::Text(text) => text,
        }
    }
}
