use anyhow::{Result, bail};
use chrono::NaiveDate;
use invoice_sync::{Direction, StatusReport, SubjectId, SyncError, SyncRequest, SyncService};

use super::stage::Step;

/// The stage that would move `request` forward, if any.
///
/// A failed download is retried before importing so no package is left
/// behind once the request is marked processed.
pub fn next_step(request: &SyncRequest) -> Option<Step> {
    if request.is_terminal() || request.external_job_id.is_none() {
        return None;
    }
    if !request.completed {
        return Some(Step::Verify);
    }
    if request.packages().is_empty() {
        return None;
    }
    if !request.packages_downloaded || request.stage_errors.download_error.is_some() {
        return Some(Step::Download);
    }
    (!request.packages_processed).then_some(Step::Import)
}

/// Run stages until the request stops making progress. Each stage runs
/// at most once per call. When a download keeps failing, the packages that
/// did arrive are imported; the request stays open for the next run.
pub async fn advance(service: &SyncService, mut request: SyncRequest) -> Result<SyncRequest, SyncError> {
    let mut tried = Vec::new();
    loop {
        let step = match next_step(&request) {
            Some(step) if !tried.contains(&step) => step,
            Some(Step::Download)
                if request.packages_downloaded && !tried.contains(&Step::Import) =>
            {
                Step::Import
            }
            _ => break,
        };
        tracing::debug!(request = %request.id, step = step.label(), "advancing");
        request = step.apply(service, &request.id).await?;
        tried.push(step);
    }
    Ok(request)
}

pub async fn run(
    service: &SyncService,
    subject: &SubjectId,
    directions: &[Direction],
    today: NaiveDate,
) -> Result<()> {
    let mut failed = 0usize;

    let requests: Vec<SyncRequest> = service
        .requests(Some(subject))
        .await?
        .into_iter()
        .filter(|r| directions.contains(&r.direction))
        .collect();

    for request in requests.iter().filter(|r| r.needs_resolution()) {
        eprintln!(
            "warning: {} ({}, {} to {}) holds a job slot but has no provider job; \
             run `invoice-sync resolve {} --job <JOB-ID>` or `--abandon`",
            request.id, request.direction, request.date_from, request.date_to, request.id
        );
    }

    let pending: Vec<SyncRequest> = requests
        .into_iter()
        .filter(|r| next_step(r).is_some())
        .collect();

    for request in pending {
        let id = request.id.clone();
        match advance(service, request).await {
            Ok(request) => {
                let report = StatusReport::from_request(&request);
                println!("{id} ({}): {}", request.direction, report.label);
            }
            Err(e) => {
                eprintln!("warning: could not advance {id}: {e}");
                failed += 1;
            }
        }
    }

    for direction in directions {
        match service.create_planned(subject, *direction, today).await {
            Ok(Some(request)) => println!(
                "Requested {direction} invoices {} to {} as {}.",
                request.date_from, request.date_to, request.id
            ),
            Ok(None) => println!("{direction}: nothing new to request."),
            Err(SyncError::PolicyViolation { reason, .. }) => {
                println!("{direction}: not requesting a new job, {reason}.");
            }
            Err(SyncError::Client(e)) if e.is_definite_rejection() => {
                eprintln!("warning: {direction} job was rejected: {e}");
                failed += 1;
            }
            Err(SyncError::Client(e)) => {
                eprintln!(
                    "warning: {direction} job creation is unconfirmed ({e}); \
                     the reservation keeps its slot until resolved"
                );
                failed += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if failed > 0 {
        bail!("{failed} step(s) failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use invoice_sync::{ClientError, StatusLabel};
    use invoice_sync::test_support::{
        CfdiFixture, Harness, build_package, cfdi_document, verification,
    };

    use super::*;

    fn archive(uuid: &str) -> Vec<u8> {
        let xml = cfdi_document(&CfdiFixture::issued(uuid));
        build_package(&[("doc.xml", xml.as_bytes())])
    }

    #[tokio::test]
    async fn reservation_without_job_is_left_alone() {
        let harness = Harness::new();
        let request = harness.reserved_request().await;
        assert_eq!(next_step(&request), None);
    }

    #[tokio::test]
    async fn steps_follow_the_pipeline() {
        let harness = Harness::new();
        let created = harness.created_request("JOB-1").await;
        assert_eq!(next_step(&created), Some(Step::Verify));

        let ready = harness.ready_request(&["P1"]).await;
        assert_eq!(next_step(&ready), Some(Step::Download));

        let mut downloaded = harness.downloaded_request(&[("P1", archive("U-1"))]).await;
        assert_eq!(next_step(&downloaded), Some(Step::Import));

        downloaded.stage_errors.download_error = Some("package P2: timed out".into());
        assert_eq!(next_step(&downloaded), Some(Step::Download));

        let empty = harness.ready_request(&[]).await;
        assert_eq!(next_step(&empty), None);
    }

    #[tokio::test]
    async fn advance_runs_ready_job_to_completion() {
        let harness = Harness::new();
        let service = harness.service();
        let created = harness.created_request("JOB-1").await;
        harness
            .client
            .push_verification(Ok(verification("3", Some(&["P1"]))));
        harness.client.add_package("P1", archive("U-1"));

        let done = advance(&service, created).await.unwrap();
        assert!(done.packages_processed);
        assert_eq!(done.counts.processed_count, 1);
        assert_eq!(
            service.status(&done.id).await.unwrap().label,
            StatusLabel::Processed
        );
    }

    #[tokio::test]
    async fn failing_download_still_imports_what_arrived() {
        let harness = Harness::new();
        let service = harness.service();
        let created = harness.created_request("JOB-1").await;
        harness
            .client
            .push_verification(Ok(verification("3", Some(&["P1", "P2"]))));
        harness.client.add_package("P1", archive("U-1"));
        harness
            .client
            .fail_package("P2", ClientError::TransientNetwork("timed out".into()));

        let partial = advance(&service, created).await.unwrap();
        assert_eq!(partial.counts.processed_count, 1);
        assert!(!partial.packages_processed);
        assert!(!partial.is_terminal());
        assert_eq!(next_step(&partial), Some(Step::Download));

        harness.client.add_package("P2", archive("U-2"));
        let done = advance(&service, partial).await.unwrap();
        assert!(done.packages_processed);
        assert_eq!(done.counts.processed_count, 1);
        assert_eq!(done.counts.existing_count, 1);
        assert_eq!(harness.client.fetches(), ["P1", "P2", "P2"]);
        assert_eq!(
            service.status(&done.id).await.unwrap().label,
            StatusLabel::Processed
        );
    }

    #[tokio::test]
    async fn advance_stops_while_provider_is_busy() {
        let harness = Harness::new();
        let service = harness.service();
        let created = harness.created_request("JOB-1").await;
        harness
            .client
            .push_verification(Ok(verification("2", None)));

        let pending = advance(&service, created).await.unwrap();
        assert!(!pending.completed);
        assert!(harness.client.fetches().is_empty());
    }
}
