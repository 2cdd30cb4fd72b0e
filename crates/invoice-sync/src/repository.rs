use chrono::{DateTime, NaiveDate, Utc};

use crate::error::RepositoryError;
use crate::invoice::{DerivedAmounts, NaturalKey, ParsedInvoice};
use crate::request::{Direction, RequestId, SubjectId, SyncRequest};

/// Raw archive of one downloaded package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub package_id: String,
    pub request_id: RequestId,
    pub content: Vec<u8>,
    pub downloaded_at: DateTime<Utc>,
}

/// Result of saving an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    AlreadyPresent,
}

/// Persisted sync requests. Records are never deleted by the pipeline.
#[async_trait::async_trait]
pub trait RequestRepository: Send + Sync {
    async fn create(&self, request: &SyncRequest) -> Result<(), RepositoryError>;

    /// Insert `request` only while fewer than `limit` non-terminal requests
    /// exist for its subject and direction. Counting and inserting happen in
    /// one atomic step. Returns whether the request was inserted.
    async fn create_within_quota(
        &self,
        request: &SyncRequest,
        limit: usize,
    ) -> Result<bool, RepositoryError>;

    async fn get(&self, id: &RequestId) -> Result<Option<SyncRequest>, RepositoryError>;

    /// Overwrite a stored request with `request`.
    async fn update(&self, request: &SyncRequest) -> Result<(), RepositoryError>;

    /// All requests of one subject and direction, oldest first.
    async fn list_for(
        &self,
        subject: &SubjectId,
        direction: Direction,
    ) -> Result<Vec<SyncRequest>, RepositoryError>;

    /// All requests, optionally restricted to one subject, oldest first.
    async fn list(&self, subject: Option<&SubjectId>) -> Result<Vec<SyncRequest>, RepositoryError>;
}

/// Raw package archives, keyed by request and package id.
#[async_trait::async_trait]
pub trait PackageStore: Send + Sync {
    /// Insert or replace the archive of one package.
    async fn save(&self, package: &Package) -> Result<(), RepositoryError>;

    async fn list_ids(&self, request_id: &RequestId) -> Result<Vec<String>, RepositoryError>;

    async fn load(&self, request_id: &RequestId) -> Result<Vec<Package>, RepositoryError>;
}

/// Imported invoices, unique per subject and natural key.
#[async_trait::async_trait]
pub trait DedupStore: Send + Sync {
    async fn exists(&self, subject: &SubjectId, key: &NaturalKey) -> Result<bool, RepositoryError>;

    /// Store the invoice unless its key is already present. Never overwrites.
    async fn save(&self, invoice: &ParsedInvoice) -> Result<SaveOutcome, RepositoryError>;

    async fn get(
        &self,
        subject: &SubjectId,
        key: &NaturalKey,
    ) -> Result<Option<ParsedInvoice>, RepositoryError>;

    /// Replace the derived amounts of a stored invoice and flag it as
    /// manually modified. Returns the updated invoice.
    async fn apply_manual_edit(
        &self,
        subject: &SubjectId,
        key: &NaturalKey,
        derived: DerivedAmounts,
    ) -> Result<ParsedInvoice, RepositoryError>;
}

/// Last date fully covered by a successful import, per subject and direction.
#[async_trait::async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(
        &self,
        subject: &SubjectId,
        direction: Direction,
    ) -> Result<Option<NaiveDate>, RepositoryError>;

    /// Move the watermark forward to `date`. Never moves it backwards.
    /// Returns the watermark now in effect.
    async fn advance(
        &self,
        subject: &SubjectId,
        direction: Direction,
        date: NaiveDate,
    ) -> Result<NaiveDate, RepositoryError>;
}
