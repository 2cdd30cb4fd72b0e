//! The three independently retryable pipeline stages.
//!
//! Each stage loads the persisted request, works on a copy and writes it
//! back once. Collaborator failures end up in the request's stage error
//! slots; only storage failures and out-of-order calls are returned.

mod download;
mod import;
mod verify;

pub use download::DownloadStage;
pub use import::ImportStage;
pub use verify::VerificationStage;

use crate::error::SyncError;
use crate::repository::RequestRepository;
use crate::request::{RequestId, SyncRequest};

async fn load(requests: &dyn RequestRepository, id: &RequestId) -> Result<SyncRequest, SyncError> {
    requests
        .get(id)
        .await?
        .ok_or_else(|| SyncError::NotFound(id.clone()))
}

/// Drop repeated ids, keeping the first occurrence.
fn dedup_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence() {
        let ids = vec!["B".into(), "A".into(), "B".into(), "C".into(), "A".into()];
        assert_eq!(dedup_preserving_order(ids), vec!["B", "A", "C"]);
    }
}
