use anyhow::Result;
use chrono::NaiveDate;
use invoice_sync::{Direction, StatusReport, SubjectId, SyncService};

use super::format;

pub async fn run(
    service: &SyncService,
    subject: &SubjectId,
    direction: Direction,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<()> {
    let request = service.create(subject, direction, from, to).await?;
    println!("Created job {}.", request.id);
    format::print_report(&StatusReport::from_request(&request));
    Ok(())
}
