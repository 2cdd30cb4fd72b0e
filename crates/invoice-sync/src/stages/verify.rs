use chrono::Utc;

use super::{dedup_preserving_order, load};
use crate::audit::{self, AuditEntry, AuditLevel, AuditLog, Stage};
use crate::client::ExternalSyncClient;
use crate::error::SyncError;
use crate::job_state::{ExternalStatus, JobState};
use crate::repository::RequestRepository;
use crate::request::{RequestId, SyncRequest};

/// Polls the provider and records what it says about a job.
pub struct VerificationStage<'a> {
    client: &'a dyn ExternalSyncClient,
    requests: &'a dyn RequestRepository,
    audit: &'a dyn AuditLog,
}

impl<'a> VerificationStage<'a> {
    pub fn new(
        client: &'a dyn ExternalSyncClient,
        requests: &'a dyn RequestRepository,
        audit: &'a dyn AuditLog,
    ) -> Self {
        Self {
            client,
            requests,
            audit,
        }
    }

    pub async fn run(&self, id: &RequestId) -> Result<SyncRequest, SyncError> {
        let mut request = load(self.requests, id).await?;

        let Some(job_id) = request.external_job_id.clone() else {
            return Err(SyncError::invalid_state(
                id,
                "job was never created with the provider",
            ));
        };

        let entry = match self.client.verify_job(&request.subject_id, &job_id).await {
            Err(e) => {
                request.stage_errors.verify_error = Some(e.to_string());
                AuditEntry::for_request(&request, Stage::Verify, AuditLevel::Warning, e.to_string())
            }
            Ok(answer) => {
                let status = ExternalStatus::classify(&answer.raw_status);
                if status == ExternalStatus::Unrecognized {
                    tracing::warn!(
                        job = %job_id,
                        raw_status = %answer.raw_status,
                        "unrecognized job status, treating as pending"
                    );
                }

                if request.completed {
                    // Already ready: never regress download or import state.
                    if status.state() == JobState::Ready {
                        request.raw_status = answer.raw_status;
                    }
                    request.stage_errors.verify_error = None;
                    return self.finish(request, "job already verified".into()).await;
                }

                match status.state() {
                    JobState::Pending => {
                        request.raw_status = answer.raw_status;
                        request.stage_errors.verify_error = None;
                        AuditEntry::for_request(
                            &request,
                            Stage::Verify,
                            AuditLevel::Info,
                            format!("job still pending (status {})", request.raw_status),
                        )
                    }
                    JobState::Ready => {
                        let packages =
                            dedup_preserving_order(answer.package_ids.unwrap_or_default());
                        let message = if packages.is_empty() {
                            "job finished with no invoices in range".to_owned()
                        } else {
                            format!("job ready with {} package(s)", packages.len())
                        };

                        request.raw_status = answer.raw_status;
                        request.package_ids = Some(packages);
                        request.completed = true;
                        request.stage_errors.verify_error = None;

                        AuditEntry::for_request(&request, Stage::Verify, AuditLevel::Info, message)
                            .with_details(serde_json::json!({ "package_ids": request.package_ids }))
                    }
                    JobState::Error => {
                        let message = answer
                            .error
                            .filter(|m| !m.trim().is_empty())
                            .unwrap_or_else(|| format!("job reported status {}", answer.raw_status));

                        request.raw_status = answer.raw_status;
                        request.stage_errors.verify_error = Some(message.clone());
                        AuditEntry::for_request(&request, Stage::Verify, AuditLevel::Error, message)
                    }
                }
            }
        };

        self.save(request, entry).await
    }

    async fn finish(&self, request: SyncRequest, message: String) -> Result<SyncRequest, SyncError> {
        let entry = AuditEntry::for_request(&request, Stage::Verify, AuditLevel::Info, message);
        self.save(request, entry).await
    }

    async fn save(&self, mut request: SyncRequest, entry: AuditEntry) -> Result<SyncRequest, SyncError> {
        request.touch(Utc::now());
        self.requests.update(&request).await?;
        audit::record(self.audit, entry).await;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::status::{StatusLabel, aggregate};
    use crate::test_support::{Harness, verification};

    async fn created(harness: &Harness) -> SyncRequest {
        harness.created_request("JOB-1").await
    }

    fn stage(harness: &Harness) -> VerificationStage<'_> {
        VerificationStage::new(
            harness.client.as_ref(),
            harness.requests.as_ref(),
            harness.audit.as_ref(),
        )
    }

    #[tokio::test]
    async fn ready_with_packages_marks_completed() {
        let harness = Harness::new();
        let request = created(&harness).await;
        harness
            .client
            .push_verification(Ok(verification("3", Some(&["P1", "P2", "P1"]))));

        let verified = stage(&harness).run(&request.id).await.unwrap();
        assert!(verified.completed);
        assert_eq!(verified.packages(), ["P1", "P2"]);
        assert_eq!(verified.stage_errors.verify_error, None);
        assert_eq!(harness.requests.stored(&request.id), Some(verified));
    }

    #[tokio::test]
    async fn ready_without_packages_is_empty_completion() {
        let harness = Harness::new();
        let request = created(&harness).await;
        harness
            .client
            .push_verification(Ok(verification("Finished", Some(&[]))));

        let verified = stage(&harness).run(&request.id).await.unwrap();
        assert!(verified.is_empty_completion());
        assert_eq!(aggregate(&verified), StatusLabel::NoInvoicesInRange);
    }

    #[tokio::test]
    async fn pending_clears_previous_error() {
        let harness = Harness::new();
        let request = created(&harness).await;
        harness
            .client
            .push_verification(Err(ClientError::TransientNetwork("timed out".into())));
        harness
            .client
            .push_verification(Ok(verification("2", None)));

        let failed = stage(&harness).run(&request.id).await.unwrap();
        assert_eq!(
            failed.stage_errors.verify_error.as_deref(),
            Some("network error: timed out")
        );
        assert_eq!(failed.raw_status, "1");
        assert!(!failed.is_terminal());

        let pending = stage(&harness).run(&request.id).await.unwrap();
        assert_eq!(pending.stage_errors.verify_error, None);
        assert_eq!(pending.raw_status, "2");
        assert_eq!(aggregate(&pending), StatusLabel::InProgress);
    }

    #[tokio::test]
    async fn provider_error_is_terminal() {
        let harness = Harness::new();
        let request = created(&harness).await;
        harness
            .client
            .push_verification(Ok(verification("5", None)));

        let rejected = stage(&harness).run(&request.id).await.unwrap();
        assert_eq!(
            rejected.stage_errors.verify_error.as_deref(),
            Some("job reported status 5")
        );
        assert!(rejected.is_terminal());
        assert_eq!(aggregate(&rejected), StatusLabel::Error);
    }

    #[tokio::test]
    async fn unknown_status_stays_pending() {
        let harness = Harness::new();
        let request = created(&harness).await;
        harness
            .client
            .push_verification(Ok(verification("Queued", None)));

        let pending = stage(&harness).run(&request.id).await.unwrap();
        assert_eq!(pending.raw_status, "Queued");
        assert!(!pending.completed);
        assert!(!pending.is_terminal());
    }

    #[tokio::test]
    async fn verified_request_is_not_regressed() {
        let harness = Harness::new();
        let mut request = created(&harness).await;
        request.raw_status = "3".into();
        request.completed = true;
        request.package_ids = Some(vec!["P1".into()]);
        request.packages_downloaded = true;
        harness.requests.update(&request).await.unwrap();

        harness
            .client
            .push_verification(Ok(verification("finished", Some(&["P9"]))));

        let again = stage(&harness).run(&request.id).await.unwrap();
        assert_eq!(again.raw_status, "finished");
        assert_eq!(again.packages(), ["P1"]);
        assert!(again.packages_downloaded);
    }

    #[tokio::test]
    async fn request_without_job_is_rejected() {
        let harness = Harness::new();
        let request = harness.reserved_request().await;

        let result = stage(&harness).run(&request.id).await;
        assert!(matches!(result, Err(SyncError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn missing_request_is_not_found() {
        let harness = Harness::new();
        let result = stage(&harness).run(&RequestId::new("nope")).await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn verification_is_audited() {
        let harness = Harness::new();
        let request = created(&harness).await;
        harness
            .client
            .push_verification(Ok(verification("3", Some(&["P1"]))));

        stage(&harness).run(&request.id).await.unwrap();
        let entries = harness.audit.entries_for(&request.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].to_string(), "[verify] job ready with 1 package(s)");
    }
}
