use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;

use crate::admission::{Admission, AdmissionGuard, MAX_IN_FLIGHT_JOBS};
use crate::audit::{self, AuditEntry, AuditLevel, AuditLog, Stage};
use crate::client::ExternalSyncClient;
use crate::edits::ManualEditor;
use crate::error::SyncError;
use crate::invoice::{NaturalKey, ParsedInvoice};
use crate::parser::DocumentParser;
use crate::planner::{PlannedRange, SyncPlanner};
use crate::repository::{DedupStore, PackageStore, RequestRepository, WatermarkStore};
use crate::request::{
    Direction, RAW_STATUS_REQUESTED, RAW_STATUS_UNCONFIRMED, RequestId, SubjectId, SyncRequest,
};
use crate::retry::RetryPolicy;
use crate::stages::{DownloadStage, ImportStage, VerificationStage};
use crate::status::StatusReport;
use crate::throttle::Throttle;

/// Everything the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub client: Arc<dyn ExternalSyncClient>,
    pub requests: Arc<dyn RequestRepository>,
    pub packages: Arc<dyn PackageStore>,
    pub invoices: Arc<dyn DedupStore>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub audit: Arc<dyn AuditLog>,
    pub parser: Arc<dyn DocumentParser>,
}

/// How an operator settles a reservation that has no provider job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The provider did accept the job; continue with this id.
    Attach(String),
    /// The provider has no job for it; free the slot.
    Abandon(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    pub max_in_flight: usize,
    pub import_concurrency: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_in_flight: MAX_IN_FLIGHT_JOBS,
            import_concurrency: 1,
        }
    }
}

/// Entry point of the pipeline. Built once per process and shared by
/// reference; holds no global state.
pub struct SyncService {
    deps: Collaborators,
    settings: ServiceSettings,
    throttle: Throttle,
    /// Serialises admission decisions inside this process.
    admission: Mutex<()>,
}

impl SyncService {
    pub fn new(deps: Collaborators, settings: ServiceSettings, throttle: Throttle) -> Self {
        Self {
            deps,
            settings,
            throttle,
            admission: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> ServiceSettings {
        self.settings
    }

    pub fn client_label(&self) -> &str {
        self.deps.client.label()
    }

    /// The range a new job for this subject should cover, if any.
    pub async fn plan(
        &self,
        subject: &SubjectId,
        direction: Direction,
        today: NaiveDate,
    ) -> Result<Option<PlannedRange>, SyncError> {
        let planner = SyncPlanner::new(self.deps.requests.as_ref(), self.deps.watermarks.as_ref());
        Ok(planner.plan(subject, direction, today).await?)
    }

    /// Create a job for an explicit range.
    ///
    /// Fails with [`SyncError::PolicyViolation`] without recording anything
    /// when the quota is exhausted or a job in flight covers the range.
    pub async fn create(
        &self,
        subject: &SubjectId,
        direction: Direction,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<SyncRequest, SyncError> {
        if from > to {
            return Err(SyncError::InvalidRange { from, to });
        }

        let request = {
            let _admission = self.admission.lock().await;
            self.reserve(subject, direction, from, to).await?
        };
        self.submit(request).await
    }

    /// Plan and create in one admission decision. Returns `None` when the
    /// subject is already current.
    pub async fn create_planned(
        &self,
        subject: &SubjectId,
        direction: Direction,
        today: NaiveDate,
    ) -> Result<Option<SyncRequest>, SyncError> {
        let request = {
            let _admission = self.admission.lock().await;
            let Some(range) = self.plan(subject, direction, today).await? else {
                tracing::info!(subject = %subject, %direction, "nothing to sync");
                return Ok(None);
            };
            self.reserve(subject, direction, range.from, range.to).await?
        };
        self.submit(request).await.map(Some)
    }

    pub async fn verify(&self, id: &RequestId) -> Result<SyncRequest, SyncError> {
        VerificationStage::new(
            self.deps.client.as_ref(),
            self.deps.requests.as_ref(),
            self.deps.audit.as_ref(),
        )
        .run(id)
        .await
    }

    pub async fn download(&self, id: &RequestId) -> Result<SyncRequest, SyncError> {
        DownloadStage::new(
            self.deps.client.as_ref(),
            self.deps.requests.as_ref(),
            self.deps.packages.as_ref(),
            self.deps.audit.as_ref(),
            &self.throttle,
        )
        .run(id)
        .await
    }

    pub async fn import(&self, id: &RequestId) -> Result<SyncRequest, SyncError> {
        ImportStage::new(
            self.deps.requests.as_ref(),
            self.deps.packages.as_ref(),
            self.deps.invoices.as_ref(),
            self.deps.watermarks.as_ref(),
            self.deps.parser.as_ref(),
            self.deps.audit.as_ref(),
        )
        .with_concurrency(self.settings.import_concurrency)
        .run(id)
        .await
    }

    pub async fn status(&self, id: &RequestId) -> Result<StatusReport, SyncError> {
        let request = self.request(id).await?;
        Ok(StatusReport::from_request(&request))
    }

    /// Reports for every request, optionally of one subject, oldest first.
    pub async fn list(&self, subject: Option<&SubjectId>) -> Result<Vec<StatusReport>, SyncError> {
        let requests = self.requests(subject).await?;
        Ok(requests.iter().map(StatusReport::from_request).collect())
    }

    pub async fn requests(&self, subject: Option<&SubjectId>) -> Result<Vec<SyncRequest>, SyncError> {
        Ok(self.deps.requests.list(subject).await?)
    }

    pub async fn request(&self, id: &RequestId) -> Result<SyncRequest, SyncError> {
        self.deps
            .requests
            .get(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(id.clone()))
    }

    pub async fn audit_trail(&self, id: &RequestId) -> Result<Vec<AuditEntry>, SyncError> {
        Ok(self.deps.audit.entries_for(id).await?)
    }

    pub async fn invoice(
        &self,
        subject: &SubjectId,
        key: &NaturalKey,
    ) -> Result<Option<ParsedInvoice>, SyncError> {
        Ok(self.deps.invoices.get(subject, key).await?)
    }

    /// An editor writing through this service's invoice store.
    pub fn editor(&self, retry: RetryPolicy, debounce: Duration) -> ManualEditor {
        ManualEditor::new(
            Arc::clone(&self.deps.invoices),
            Arc::clone(&self.deps.audit),
            retry,
            debounce,
        )
    }

    /// Settle a reservation that holds a quota slot without a job id.
    pub async fn resolve(
        &self,
        id: &RequestId,
        resolution: Resolution,
    ) -> Result<SyncRequest, SyncError> {
        let _admission = self.admission.lock().await;
        let mut request = self.request(id).await?;
        if !request.needs_resolution() {
            return Err(SyncError::invalid_state(
                id,
                "request already has a provider job or is finished",
            ));
        }

        let (level, message) = match resolution {
            Resolution::Attach(job_id) => {
                let message = format!("attached provider job {job_id}");
                request.external_job_id = Some(job_id);
                request.raw_status = RAW_STATUS_REQUESTED.to_owned();
                (AuditLevel::Info, message)
            }
            Resolution::Abandon(reason) => {
                let message = format!("reservation abandoned: {reason}");
                request.stage_errors.request_error = Some(reason);
                (AuditLevel::Warning, message)
            }
        };

        request.touch(Utc::now());
        self.deps.requests.update(&request).await?;
        let entry = AuditEntry::for_request(&request, Stage::Create, level, message);
        audit::record(self.deps.audit.as_ref(), entry).await;

        Ok(request)
    }

    /// Check the quota and persist a reservation. Callers hold the
    /// admission lock.
    async fn reserve(
        &self,
        subject: &SubjectId,
        direction: Direction,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<SyncRequest, SyncError> {
        let limit = self.settings.max_in_flight;
        let guard = AdmissionGuard::with_limit(self.deps.requests.as_ref(), limit);

        let decision = guard.admit(subject, direction, from, to).await?;
        if !decision.is_allowed() {
            return Err(refuse(subject, direction, &decision));
        }

        let request = SyncRequest::new(subject.clone(), direction, from, to, Utc::now());
        if !self.deps.requests.create_within_quota(&request, limit).await? {
            let decision = Admission::QuotaExhausted {
                in_flight: limit,
                limit,
            };
            return Err(refuse(subject, direction, &decision));
        }

        Ok(request)
    }

    /// Ask the provider for the reserved job and record its answer.
    async fn submit(&self, mut request: SyncRequest) -> Result<SyncRequest, SyncError> {
        let outcome = self
            .deps
            .client
            .create_job(
                &request.subject_id,
                request.date_from,
                request.date_to,
                request.direction,
            )
            .await;
        request.touch(Utc::now());

        match outcome {
            Ok(job) => {
                // Package ids are only trusted from verification.
                request.external_job_id = Some(job.job_id);
                request.raw_status = job.raw_status;
                self.deps.requests.update(&request).await?;

                let message = format!(
                    "job created for {}..{}",
                    request.date_from, request.date_to
                );
                let entry = AuditEntry::for_request(&request, Stage::Create, AuditLevel::Info, message);
                audit::record(self.deps.audit.as_ref(), entry).await;

                Ok(request)
            }
            Err(e) if e.is_definite_rejection() => {
                request.stage_errors.request_error = Some(e.to_string());
                self.deps.requests.update(&request).await?;

                let entry =
                    AuditEntry::for_request(&request, Stage::Create, AuditLevel::Error, e.to_string());
                audit::record(self.deps.audit.as_ref(), entry).await;

                Err(SyncError::Client(e))
            }
            Err(e) => {
                // The job may exist on the provider side; keep the slot.
                request.raw_status = RAW_STATUS_UNCONFIRMED.to_owned();
                self.deps.requests.update(&request).await?;

                let entry = AuditEntry::for_request(
                    &request,
                    Stage::Create,
                    AuditLevel::Warning,
                    format!("job creation unconfirmed: {e}"),
                );
                audit::record(self.deps.audit.as_ref(), entry).await;

                Err(SyncError::Client(e))
            }
        }
    }
}

fn refuse(subject: &SubjectId, direction: Direction, decision: &Admission) -> SyncError {
    tracing::warn!(subject = %subject, %direction, reason = %decision, "job creation refused");
    SyncError::PolicyViolation {
        subject_id: subject.clone(),
        direction,
        reason: decision.to_string(),
    }
}
