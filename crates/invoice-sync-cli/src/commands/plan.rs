use anyhow::Result;
use chrono::NaiveDate;
use invoice_sync::{Direction, SubjectId, SyncService};

pub async fn run(
    service: &SyncService,
    subject: &SubjectId,
    direction: Direction,
    today: NaiveDate,
) -> Result<()> {
    match service.plan(subject, direction, today).await? {
        Some(range) => println!("{subject} {direction}: next job covers {} to {}", range.from, range.to),
        None => println!("{subject} {direction}: up to date or a job is already in flight"),
    }
    Ok(())
}
