use std::collections::HashSet;

use chrono::Utc;

use super::load;
use crate::audit::{self, AuditEntry, AuditLevel, AuditLog, Stage};
use crate::client::ExternalSyncClient;
use crate::error::SyncError;
use crate::repository::{Package, PackageStore, RequestRepository};
use crate::request::{RequestId, SyncRequest};
use crate::throttle::Throttle;

/// Fetches the package archives of a ready job.
///
/// A failing package does not stop the loop, and packages stored by an
/// earlier run are not fetched again, so the stage can simply be re-run.
pub struct DownloadStage<'a> {
    client: &'a dyn ExternalSyncClient,
    requests: &'a dyn RequestRepository,
    packages: &'a dyn PackageStore,
    audit: &'a dyn AuditLog,
    throttle: &'a Throttle,
}

impl<'a> DownloadStage<'a> {
    pub fn new(
        client: &'a dyn ExternalSyncClient,
        requests: &'a dyn RequestRepository,
        packages: &'a dyn PackageStore,
        audit: &'a dyn AuditLog,
        throttle: &'a Throttle,
    ) -> Self {
        Self {
            client,
            requests,
            packages,
            audit,
            throttle,
        }
    }

    pub async fn run(&self, id: &RequestId) -> Result<SyncRequest, SyncError> {
        let mut request = load(self.requests, id).await?;

        if !request.completed {
            return Err(SyncError::invalid_state(id, "job is not ready yet"));
        }
        if request.packages().is_empty() {
            return Err(SyncError::invalid_state(id, "job has no packages to download"));
        }

        let stored: HashSet<String> = self.packages.list_ids(id).await?.into_iter().collect();
        let wanted = request.packages().to_vec();

        let mut fetched = 0usize;
        let mut failures = Vec::new();

        for package_id in &wanted {
            if stored.contains(package_id) {
                tracing::debug!(request = %id, package = %package_id, "package already stored");
                continue;
            }

            self.throttle.until_ready().await;

            match self
                .client
                .fetch_package(&request.subject_id, package_id)
                .await
            {
                Ok(content) => {
                    tracing::debug!(
                        request = %id,
                        package = %package_id,
                        bytes = content.len(),
                        "package downloaded"
                    );
                    self.packages
                        .save(&Package {
                            package_id: package_id.clone(),
                            request_id: id.clone(),
                            content,
                            downloaded_at: Utc::now(),
                        })
                        .await?;
                    fetched += 1;
                }
                Err(e) => {
                    tracing::warn!(request = %id, package = %package_id, error = %e, "package download failed");
                    failures.push(format!("package {package_id}: {e}"));
                }
            }
        }

        let available = wanted
            .iter()
            .filter(|p| stored.contains(*p))
            .count()
            + fetched;

        let now = Utc::now();
        request.packages_downloaded = available > 0;
        request.stage_errors.download_error = failures.first().cloned();
        if fetched > 0 {
            request.timestamps.downloaded_at = Some(now);
        }

        let entry = if failures.is_empty() {
            AuditEntry::for_request(
                &request,
                Stage::Download,
                AuditLevel::Info,
                format!("{available} of {} packages stored", wanted.len()),
            )
        } else {
            AuditEntry::for_request(
                &request,
                Stage::Download,
                AuditLevel::Warning,
                format!(
                    "{available} of {} packages stored, {} failed",
                    wanted.len(),
                    failures.len()
                ),
            )
            .with_details(serde_json::json!({ "failures": failures }))
        };

        request.touch(now);
        self.requests.update(&request).await?;
        audit::record(self.audit, entry).await;

        Ok(request)
    }
}
