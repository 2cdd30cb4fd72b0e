use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;

use crate::job_state::{ExternalStatus, JobState};
use crate::request::{Direction, ImportCounts, RequestId, SubjectId, SyncRequest};

/// Single observable status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLabel {
    Processed,
    ProcessedWithErrors,
    DownloadError,
    AwaitingImport,
    NoInvoicesInRange,
    Error,
    InProgress,
    Requested,
}

impl StatusLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::ProcessedWithErrors => "processed with errors",
            Self::DownloadError => "download error",
            Self::AwaitingImport => "downloaded, awaiting import",
            Self::NoInvoicesInRange => "no invoices in range",
            Self::Error => "error",
            Self::InProgress => "in progress",
            Self::Requested => "requested",
        }
    }
}

impl fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the label of a request. The first matching rule wins.
pub fn aggregate(request: &SyncRequest) -> StatusLabel {
    let errors = &request.stage_errors;

    if request.packages_processed && !request.processed_with_errors {
        StatusLabel::Processed
    } else if request.processed_with_errors {
        StatusLabel::ProcessedWithErrors
    } else if errors.download_error.is_some() {
        StatusLabel::DownloadError
    } else if request.packages_downloaded {
        StatusLabel::AwaitingImport
    } else if request.is_empty_completion() {
        StatusLabel::NoInvoicesInRange
    } else if !errors.is_empty() || request.job_state() == JobState::Error {
        StatusLabel::Error
    } else if request.completed
        || ExternalStatus::classify(&request.raw_status) == ExternalStatus::InProgress
    {
        StatusLabel::InProgress
    } else {
        StatusLabel::Requested
    }
}

/// What operators see for one request: label, counts and verbatim errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub id: RequestId,
    pub subject_id: SubjectId,
    pub direction: Direction,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub label: StatusLabel,
    pub raw_status: String,
    pub package_count: usize,
    pub counts: ImportCounts,
    pub errors: Vec<(String, String)>,
    /// See [`SyncRequest::needs_resolution`].
    pub needs_resolution: bool,
}

impl StatusReport {
    pub fn from_request(request: &SyncRequest) -> Self {
        Self {
            id: request.id.clone(),
            subject_id: request.subject_id.clone(),
            direction: request.direction,
            date_from: request.date_from,
            date_to: request.date_to,
            label: aggregate(request),
            raw_status: request.raw_status.clone(),
            package_count: request.packages().len(),
            counts: request.counts,
            errors: request
                .stage_errors
                .iter()
                .map(|(stage, message)| (stage.to_owned(), message.to_owned()))
                .collect(),
            needs_resolution: request.needs_resolution(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn base() -> SyncRequest {
        SyncRequest::new(
            SubjectId::new("RFC123"),
            Direction::Received,
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            Utc::now(),
        )
    }

    /// Every combination of the fields the aggregator reads.
    fn all_variants() -> Vec<SyncRequest> {
        let statuses = ["requested", "2", "3", "5"];
        let mut variants = Vec::new();

        for bits in 0u32..(1 << 9) {
            for status in statuses {
                let flag = |n: u32| bits & (1 << n) != 0;
                let mut request = base();
                request.raw_status = status.to_owned();
                request.packages_processed = flag(0);
                request.processed_with_errors = flag(1);
                request.packages_downloaded = flag(2);
                request.completed = flag(3);
                request.package_ids = if flag(4) { Some(vec!["P1".into()]) } else { Some(vec![]) };
                request.stage_errors.download_error = flag(5).then(|| "download".to_owned());
                request.stage_errors.verify_error = flag(6).then(|| "verify".to_owned());
                request.stage_errors.request_error = flag(7).then(|| "request".to_owned());
                request.stage_errors.processing_error = flag(8).then(|| "processing".to_owned());
                variants.push(request);
            }
        }

        variants
    }

    #[test]
    fn aggregation_is_deterministic() {
        for request in all_variants() {
            let first = aggregate(&request);
            for _ in 0..3 {
                assert_eq!(aggregate(&request.clone()), first);
            }
        }
    }

    #[test]
    fn processed_outranks_everything() {
        for mut request in all_variants() {
            request.packages_processed = true;
            request.processed_with_errors = false;
            assert_eq!(aggregate(&request), StatusLabel::Processed);
        }
    }

    #[test]
    fn processed_with_errors_outranks_download_state() {
        for mut request in all_variants() {
            request.packages_processed = true;
            request.processed_with_errors = true;
            assert_eq!(aggregate(&request), StatusLabel::ProcessedWithErrors);
        }
    }

    #[test]
    fn download_error_outranks_downloaded() {
        let mut request = base();
        request.packages_downloaded = true;
        request.stage_errors.download_error = Some("package P2: timeout".into());
        assert_eq!(aggregate(&request), StatusLabel::DownloadError);

        request.stage_errors.download_error = None;
        assert_eq!(aggregate(&request), StatusLabel::AwaitingImport);
    }

    #[test]
    fn empty_completion_reads_no_invoices() {
        let mut request = base();
        request.raw_status = "3".into();
        request.completed = true;
        request.package_ids = Some(vec![]);
        assert_eq!(aggregate(&request), StatusLabel::NoInvoicesInRange);
        assert_eq!(aggregate(&request).as_str(), "no invoices in range");
    }

    #[test]
    fn stage_errors_outrank_progress() {
        let mut request = base();
        request.raw_status = "2".into();
        assert_eq!(aggregate(&request), StatusLabel::InProgress);

        request.stage_errors.verify_error = Some("timeout".into());
        assert_eq!(aggregate(&request), StatusLabel::Error);
    }

    #[test]
    fn provider_rejection_reads_as_error() {
        let mut request = base();
        request.raw_status = "Rejected".into();
        assert_eq!(aggregate(&request), StatusLabel::Error);
    }

    #[test]
    fn fresh_request_reads_requested() {
        assert_eq!(aggregate(&base()), StatusLabel::Requested);
    }

    #[test]
    fn report_flags_reservation_without_job() {
        let mut request = base();
        assert!(StatusReport::from_request(&request).needs_resolution);

        request.external_job_id = Some("JOB-1".into());
        assert!(!StatusReport::from_request(&request).needs_resolution);
    }

    #[test]
    fn report_keeps_errors_verbatim() {
        let mut request = base();
        request.stage_errors.verify_error = Some("network error: timed out".into());
        let report = StatusReport::from_request(&request);
        assert_eq!(report.label, StatusLabel::Error);
        assert_eq!(
            report.errors,
            vec![("verify".to_owned(), "network error: timed out".to_owned())]
        );
    }
}
