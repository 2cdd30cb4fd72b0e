use anyhow::Result;
use invoice_sync::{RequestId, Resolution, StatusReport, SyncService};

use super::format;

pub async fn run(service: &SyncService, id: &RequestId, resolution: Resolution) -> Result<()> {
    let request = service.resolve(id, resolution).await?;
    format::print_report(&StatusReport::from_request(&request));
    Ok(())
}
