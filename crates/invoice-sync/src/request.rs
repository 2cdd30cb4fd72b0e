use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::job_state::JobState;

/// Raw status written on a freshly reserved request, before the provider
/// has answered.
pub const RAW_STATUS_REQUESTED: &str = "requested";

/// Raw status of a reservation whose creation call failed without a
/// definite answer. The provider may or may not have accepted the job.
pub const RAW_STATUS_UNCONFIRMED: &str = "unconfirmed";

/// Identifier of a persisted sync request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Taxpayer identifier (RFC) a sync runs for. Stored upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against an RFC read from a document.
    pub fn matches(&self, rfc: &str) -> bool {
        self.0.eq_ignore_ascii_case(rfc.trim())
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the invoice the subject is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Issued,
    Received,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::Received => "received",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "issued" | "emitidos" | "emitted" => Some(Self::Issued),
            "received" | "recibidos" => Some(Self::Received),
            _ => None,
        }
    }

    pub fn all() -> [Direction; 2] {
        [Self::Issued, Self::Received]
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown direction '{s}' (expected issued or received)"))
    }
}

/// Verbatim error strings, one slot per stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageErrors {
    pub request_error: Option<String>,
    pub verify_error: Option<String>,
    pub download_error: Option<String>,
    pub processing_error: Option<String>,
}

impl StageErrors {
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Populated slots in stage order, labelled by stage.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("request", self.request_error.as_deref()),
            ("verify", self.verify_error.as_deref()),
            ("download", self.download_error.as_deref()),
            ("processing", self.processing_error.as_deref()),
        ]
        .into_iter()
        .filter_map(|(stage, message)| message.map(|m| (stage, m)))
    }
}

/// Totals of the latest import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCounts {
    pub processed_count: u64,
    pub existing_count: u64,
    pub total_errors: u64,
}

impl ImportCounts {
    /// Documents that parsed and are now present in the store.
    pub fn imported(&self) -> u64 {
        self.processed_count + self.existing_count
    }
}

impl std::ops::AddAssign for ImportCounts {
    fn add_assign(&mut self, other: Self) {
        self.processed_count += other.processed_count;
        self.existing_count += other.existing_count;
        self.total_errors += other.total_errors;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// One bulk-download job and everything the pipeline learned about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub id: RequestId,
    pub subject_id: SubjectId,
    pub external_job_id: Option<String>,
    pub direction: Direction,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub raw_status: String,
    pub package_ids: Option<Vec<String>>,
    pub completed: bool,
    pub packages_downloaded: bool,
    pub packages_processed: bool,
    pub processed_with_errors: bool,
    pub stage_errors: StageErrors,
    pub counts: ImportCounts,
    pub timestamps: Timestamps,
}

impl SyncRequest {
    /// A fresh reservation for the given range. The external job id is
    /// filled in once the provider accepts the job.
    pub fn new(
        subject_id: SubjectId,
        direction: Direction,
        date_from: NaiveDate,
        date_to: NaiveDate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RequestId::generate(),
            subject_id,
            external_job_id: None,
            direction,
            date_from,
            date_to,
            raw_status: RAW_STATUS_REQUESTED.to_owned(),
            package_ids: None,
            completed: false,
            packages_downloaded: false,
            packages_processed: false,
            processed_with_errors: false,
            stage_errors: StageErrors::default(),
            counts: ImportCounts::default(),
            timestamps: Timestamps {
                created_at: now,
                updated_at: now,
                downloaded_at: None,
                processed_at: None,
            },
        }
    }

    pub fn job_state(&self) -> JobState {
        JobState::normalize(&self.raw_status)
    }

    /// Package ids reported by verification, empty when none are known.
    pub fn packages(&self) -> &[String] {
        self.package_ids.as_deref().unwrap_or(&[])
    }

    /// The provider finished the job and there was nothing to download.
    pub fn is_empty_completion(&self) -> bool {
        self.completed && self.package_ids.as_ref().is_some_and(|ids| ids.is_empty())
    }

    /// Failures that end the job for good: creation failed, the provider
    /// rejected or expired the job, or no document could be imported.
    pub fn has_fatal_error(&self) -> bool {
        self.stage_errors.request_error.is_some()
            || self.stage_errors.processing_error.is_some()
            || self.job_state() == JobState::Error
    }

    /// Terminal requests no longer count against the provider quota.
    pub fn is_terminal(&self) -> bool {
        self.packages_processed || self.is_empty_completion() || self.has_fatal_error()
    }

    /// Holds a quota slot without a provider job id: creation timed out,
    /// or the process stopped before the job id was saved. Nothing can
    /// verify it, so an operator has to attach the job or abandon it.
    pub fn needs_resolution(&self) -> bool {
        self.external_job_id.is_none() && !self.is_terminal()
    }

    /// Inclusive date-range overlap.
    pub fn overlaps(&self, from: NaiveDate, to: NaiveDate) -> bool {
        self.date_from <= to && from <= self.date_to
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.timestamps.updated_at = now;
    }
}
