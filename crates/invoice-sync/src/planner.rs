use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::error::RepositoryError;
use crate::repository::{RequestRepository, WatermarkStore};
use crate::request::{Direction, SubjectId, SyncRequest};

/// Inclusive date range a new job should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlannedRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Compute the range still uncovered.
///
/// Without a watermark the sync starts on January 1st of `today`'s year.
/// The range ends yesterday because the provider only guarantees complete
/// days. Returns `None` when already current or when a non-terminal request
/// overlaps the range.
pub fn plan_range(
    watermark: Option<NaiveDate>,
    existing: &[SyncRequest],
    today: NaiveDate,
) -> Option<PlannedRange> {
    let from = match watermark {
        Some(mark) => mark.succ_opt()?,
        None => NaiveDate::from_ymd_opt(today.year(), 1, 1)?,
    };
    let to = today.pred_opt()?;

    if from > to {
        return None;
    }

    let overlapping = existing
        .iter()
        .any(|r| !r.is_terminal() && r.overlaps(from, to));
    if overlapping {
        return None;
    }

    Some(PlannedRange { from, to })
}

/// Decides whether a subject needs a new job.
pub struct SyncPlanner<'a> {
    requests: &'a dyn RequestRepository,
    watermarks: &'a dyn WatermarkStore,
}

impl<'a> SyncPlanner<'a> {
    pub fn new(requests: &'a dyn RequestRepository, watermarks: &'a dyn WatermarkStore) -> Self {
        Self {
            requests,
            watermarks,
        }
    }

    pub async fn plan(
        &self,
        subject: &SubjectId,
        direction: Direction,
        today: NaiveDate,
    ) -> Result<Option<PlannedRange>, RepositoryError> {
        let watermark = self.watermarks.get(subject, direction).await?;
        let existing = self.requests.list_for(subject, direction).await?;
        Ok(plan_range(watermark, &existing, today))
    }
}
