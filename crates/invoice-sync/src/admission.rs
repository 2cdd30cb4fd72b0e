use std::fmt;

use chrono::NaiveDate;

use crate::error::RepositoryError;
use crate::repository::RequestRepository;
use crate::request::{Direction, SubjectId, SyncRequest};

/// Concurrent jobs the provider tolerates per subject and direction.
/// Exceeding it gets the subject blocked by the provider for days.
pub const MAX_IN_FLIGHT_JOBS: usize = 2;

/// Number of requests still holding a provider slot.
pub fn count_in_flight(requests: &[SyncRequest]) -> usize {
    requests.iter().filter(|r| !r.is_terminal()).count()
}

/// Outcome of an admission check for a concrete range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The subject already has `in_flight` jobs holding provider slots.
    QuotaExhausted { in_flight: usize, limit: usize },
    /// A job still in flight covers part of the requested range.
    Overlapping { from: NaiveDate, to: NaiveDate },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allowed => f.write_str("allowed"),
            Self::QuotaExhausted { in_flight, limit } => {
                write!(f, "{in_flight} jobs already in flight (limit {limit})")
            }
            Self::Overlapping { from, to } => {
                write!(f, "a job in flight already covers {from}..{to}")
            }
        }
    }
}

/// Read-only quota check run before any job creation.
pub struct AdmissionGuard<'a> {
    requests: &'a dyn RequestRepository,
    limit: usize,
}

impl<'a> AdmissionGuard<'a> {
    pub fn new(requests: &'a dyn RequestRepository) -> Self {
        Self::with_limit(requests, MAX_IN_FLIGHT_JOBS)
    }

    pub fn with_limit(requests: &'a dyn RequestRepository, limit: usize) -> Self {
        Self { requests, limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn in_flight(
        &self,
        subject: &SubjectId,
        direction: Direction,
    ) -> Result<usize, RepositoryError> {
        let requests = self.requests.list_for(subject, direction).await?;
        Ok(count_in_flight(&requests))
    }

    pub async fn can_create(
        &self,
        subject: &SubjectId,
        direction: Direction,
    ) -> Result<bool, RepositoryError> {
        Ok(self.in_flight(subject, direction).await? < self.limit)
    }

    /// Full admission decision for a job covering `from..=to`: the quota
    /// must have room and no in-flight job may cover the same days.
    pub async fn admit(
        &self,
        subject: &SubjectId,
        direction: Direction,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Admission, RepositoryError> {
        let requests = self.requests.list_for(subject, direction).await?;

        let in_flight = count_in_flight(&requests);
        if in_flight >= self.limit {
            return Ok(Admission::QuotaExhausted {
                in_flight,
                limit: self.limit,
            });
        }

        let overlapping = requests
            .iter()
            .find(|r| !r.is_terminal() && r.overlaps(from, to));
        if let Some(existing) = overlapping {
            return Ok(Admission::Overlapping {
                from: existing.date_from,
                to: existing.date_to,
            });
        }

        Ok(Admission::Allowed)
    }
}
