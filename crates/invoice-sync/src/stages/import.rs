use std::collections::HashSet;

use chrono::Utc;
use futures::stream::{self, StreamExt};

use super::load;
use crate::archive;
use crate::audit::{self, AuditEntry, AuditLevel, AuditLog, Stage};
use crate::error::{RepositoryError, SyncError};
use crate::parser::DocumentParser;
use crate::repository::{
    DedupStore, Package, PackageStore, RequestRepository, SaveOutcome, WatermarkStore,
};
use crate::request::{ImportCounts, RequestId, SubjectId, SyncRequest};

/// Result of importing one package.
#[derive(Debug, Default)]
struct PackageTally {
    counts: ImportCounts,
    /// Set when the archive could not be opened at all.
    failure: Option<String>,
}

/// Unpacks stored archives, parses their documents and saves new invoices.
///
/// Counts are recomputed from scratch on every run, so re-running on an
/// imported request only moves invoices from "processed" to "existing".
/// While a listed package is still missing the request is imported as far
/// as possible but neither marked processed nor allowed to move the
/// watermark.
pub struct ImportStage<'a> {
    requests: &'a dyn RequestRepository,
    packages: &'a dyn PackageStore,
    invoices: &'a dyn DedupStore,
    watermarks: &'a dyn WatermarkStore,
    parser: &'a dyn DocumentParser,
    audit: &'a dyn AuditLog,
    concurrency: usize,
}

impl<'a> ImportStage<'a> {
    pub fn new(
        requests: &'a dyn RequestRepository,
        packages: &'a dyn PackageStore,
        invoices: &'a dyn DedupStore,
        watermarks: &'a dyn WatermarkStore,
        parser: &'a dyn DocumentParser,
        audit: &'a dyn AuditLog,
    ) -> Self {
        Self {
            requests,
            packages,
            invoices,
            watermarks,
            parser,
            audit,
            concurrency: 1,
        }
    }

    /// Number of packages processed at once. Defaults to one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn run(&self, id: &RequestId) -> Result<SyncRequest, SyncError> {
        let mut request = load(self.requests, id).await?;

        if !request.packages_downloaded {
            return Err(SyncError::invalid_state(id, "no downloaded packages to import"));
        }

        let archives = self.packages.load(id).await?;
        let subject = &request.subject_id;

        let stored: HashSet<&str> = archives.iter().map(|p| p.package_id.as_str()).collect();
        let missing: Vec<String> = request
            .packages()
            .iter()
            .filter(|p| !stored.contains(p.as_str()))
            .cloned()
            .collect();
        let incomplete = !missing.is_empty() || request.stage_errors.download_error.is_some();

        let tallies: Vec<Result<PackageTally, RepositoryError>> = stream::iter(&archives)
            .map(|package| self.import_package(subject, package))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut counts = ImportCounts::default();
        let mut archive_failures = Vec::new();
        for tally in tallies {
            let tally = tally?;
            counts += tally.counts;
            archive_failures.extend(tally.failure);
        }

        let now = Utc::now();
        request.counts = counts;
        request.timestamps.processed_at = Some(now);

        if incomplete {
            // Stays retryable until every listed package has been imported.
            request.packages_processed = false;
            request.processed_with_errors = true;
            request.stage_errors.processing_error = None;
        } else if counts.total_errors == 0 || counts.imported() > 0 {
            request.packages_processed = true;
            request.processed_with_errors = counts.total_errors > 0;
            request.stage_errors.processing_error = None;
        } else {
            request.packages_processed = false;
            request.processed_with_errors = false;
            request.stage_errors.processing_error = Some(format!(
                "no document could be imported ({} errors)",
                counts.total_errors
            ));
        }

        request.touch(now);
        self.requests.update(&request).await?;

        let details = serde_json::json!({
            "processed": counts.processed_count,
            "existing": counts.existing_count,
            "errors": counts.total_errors,
            "archive_failures": archive_failures,
            "missing_packages": missing,
        });
        let entry = if incomplete {
            AuditEntry::for_request(
                &request,
                Stage::Import,
                AuditLevel::Warning,
                format!(
                    "{} new, {} existing, {} errors; {} package(s) not downloaded yet",
                    counts.processed_count,
                    counts.existing_count,
                    counts.total_errors,
                    missing.len().max(1)
                ),
            )
        } else if request.packages_processed {
            let watermark = self
                .watermarks
                .advance(&request.subject_id, request.direction, request.date_to)
                .await?;
            let level = if request.processed_with_errors {
                AuditLevel::Warning
            } else {
                AuditLevel::Info
            };
            AuditEntry::for_request(
                &request,
                Stage::Import,
                level,
                format!(
                    "{} new, {} existing, {} errors; synced through {watermark}",
                    counts.processed_count, counts.existing_count, counts.total_errors
                ),
            )
        } else {
            AuditEntry::for_request(
                &request,
                Stage::Import,
                AuditLevel::Error,
                request
                    .stage_errors
                    .processing_error
                    .clone()
                    .unwrap_or_default(),
            )
        };
        audit::record(self.audit, entry.with_details(details)).await;

        Ok(request)
    }

    async fn import_package(
        &self,
        subject: &SubjectId,
        package: &Package,
    ) -> Result<PackageTally, RepositoryError> {
        let documents = match archive::unpack(&package.content) {
            Ok(documents) => documents,
            Err(e) => {
                tracing::warn!(package = %package.package_id, error = %e, "cannot open package");
                return Ok(PackageTally {
                    counts: ImportCounts {
                        total_errors: 1,
                        ..Default::default()
                    },
                    failure: Some(format!("package {}: {e}", package.package_id)),
                });
            }
        };

        let mut counts = ImportCounts::default();

        for document in documents {
            let invoice = match self.parser.parse(&document.content, subject) {
                Ok(invoice) => invoice,
                Err(e) => {
                    tracing::debug!(
                        package = %package.package_id,
                        document = %document.name,
                        error = %e,
                        "document skipped"
                    );
                    counts.total_errors += 1;
                    continue;
                }
            };

            if self.invoices.exists(subject, &invoice.natural_key).await? {
                counts.existing_count += 1;
                continue;
            }

            match self.invoices.save(&invoice).await? {
                SaveOutcome::Inserted => counts.processed_count += 1,
                SaveOutcome::AlreadyPresent => counts.existing_count += 1,
            }
        }

        tracing::debug!(
            package = %package.package_id,
            processed = counts.processed_count,
            existing = counts.existing_count,
            errors = counts.total_errors,
            "package imported"
        );

        Ok(PackageTally {
            counts,
            failure: None,
        })
    }
}
