use anyhow::{Result, bail};
use invoice_sync::{RequestId, SyncService};

use super::format;

pub async fn run(service: &SyncService, id: &RequestId) -> Result<()> {
    // Fails with NotFound for unknown ids instead of printing nothing.
    service.request(id).await?;

    let entries = service.audit_trail(id).await?;
    if entries.is_empty() {
        bail!("no audit entries for {id}");
    }
    format::print_entries(&entries);
    Ok(())
}
