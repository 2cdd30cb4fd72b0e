pub mod admission;
pub mod archive;
pub mod audit;
pub mod cfdi;
pub mod client;
pub mod debounce;
pub mod edits;
pub mod error;
pub mod invoice;
pub mod job_state;
pub mod parser;
pub mod planner;
pub mod repository;
pub mod request;
pub mod retry;
pub mod service;
pub mod stages;
pub mod status;
pub mod throttle;

pub use admission::{Admission, AdmissionGuard, MAX_IN_FLIGHT_JOBS};
pub use audit::{AuditEntry, AuditLevel, AuditLog, Stage};
pub use cfdi::CfdiParser;
pub use client::{CreatedJob, ExternalSyncClient, JobVerification};
pub use debounce::Debouncer;
pub use edits::{EditOutcome, ManualEdit, ManualEditor};
pub use error::{ArchiveError, ClientError, ParseError, RepositoryError, SyncError};
pub use invoice::{Amount, DerivedAmounts, InvoicePayload, NaturalKey, ParsedInvoice};
pub use job_state::{ExternalStatus, JobState};
pub use parser::DocumentParser;
pub use planner::{PlannedRange, SyncPlanner};
pub use repository::{
    DedupStore, Package, PackageStore, RequestRepository, SaveOutcome, WatermarkStore,
};
pub use request::{Direction, ImportCounts, RequestId, StageErrors, SubjectId, SyncRequest};
pub use retry::RetryPolicy;
pub use service::{Collaborators, Resolution, ServiceSettings, SyncService};
pub use stages::{DownloadStage, ImportStage, VerificationStage};
pub use status::{StatusLabel, StatusReport};
pub use throttle::Throttle;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
