use anyhow::Result;
use invoice_sync::{RequestId, StatusReport, SyncError, SyncRequest, SyncService};

use super::format;

/// One pipeline stage a caller can run on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Verify,
    Download,
    Import,
}

impl Step {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Download => "download",
            Self::Import => "import",
        }
    }

    pub async fn apply(
        &self,
        service: &SyncService,
        id: &RequestId,
    ) -> Result<SyncRequest, SyncError> {
        match self {
            Self::Verify => service.verify(id).await,
            Self::Download => service.download(id).await,
            Self::Import => service.import(id).await,
        }
    }
}

pub async fn run(service: &SyncService, step: Step, id: &RequestId) -> Result<()> {
    let request = step.apply(service, id).await?;
    format::print_report(&StatusReport::from_request(&request));
    Ok(())
}
