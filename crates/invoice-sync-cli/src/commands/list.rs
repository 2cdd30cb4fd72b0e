use anyhow::Result;
use invoice_sync::{SubjectId, SyncService};

use super::format;

pub async fn run(service: &SyncService, subject: Option<&SubjectId>, json: bool) -> Result<()> {
    let reports = service.list(subject).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        format::print_report_table(&reports);
    }
    Ok(())
}
