use anyhow::Result;
use invoice_sync::{RequestId, SyncService};

use super::format;

pub async fn run(service: &SyncService, id: &RequestId, json: bool) -> Result<()> {
    let report = service.status(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        format::print_report(&report);
    }
    Ok(())
}
