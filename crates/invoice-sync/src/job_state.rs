/// Normalized job state the pipeline acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Ready,
    Error,
}

impl JobState {
    /// Map a raw provider status onto the three states the pipeline cares about.
    pub fn normalize(raw: &str) -> Self {
        ExternalStatus::classify(raw).state()
    }
}

/// Equivalence classes of the provider's status vocabulary.
///
/// The provider reports the same state with numeric codes and with
/// English words in either case (`"3"`, `"Finished"`, `"finished"`), so
/// statuses are compared by class, never by literal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalStatus {
    Accepted,
    InProgress,
    Finished,
    Failed,
    Unrecognized,
}

impl ExternalStatus {
    pub fn classify(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "1" | "accepted" | "requested" => Self::Accepted,
            "2" | "inprogress" | "in_progress" | "in progress" | "processing" => Self::InProgress,
            "3" | "finished" => Self::Finished,
            "4" | "5" | "6" | "error" | "rejected" | "expired" => Self::Failed,
            _ => Self::Unrecognized,
        }
    }

    /// Unrecognized statuses stay pending; nothing is assumed terminal
    /// without an explicit signal.
    pub fn state(self) -> JobState {
        match self {
            Self::Accepted | Self::InProgress | Self::Unrecognized => JobState::Pending,
            Self::Finished => JobState::Ready,
            Self::Failed => JobState::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_spellings_are_equivalent() {
        for raw in ["3", "Finished", "finished", " FINISHED "] {
            assert_eq!(JobState::normalize(raw), JobState::Ready, "{raw}");
        }
    }

    #[test]
    fn failure_codes_map_to_error() {
        for raw in ["4", "5", "6", "Rejected", "expired", "Error"] {
            assert_eq!(JobState::normalize(raw), JobState::Error, "{raw}");
        }
    }

    #[test]
    fn in_flight_codes_stay_pending() {
        assert_eq!(ExternalStatus::classify("1"), ExternalStatus::Accepted);
        assert_eq!(ExternalStatus::classify("InProgress"), ExternalStatus::InProgress);
        assert_eq!(JobState::normalize("2"), JobState::Pending);
    }

    #[test]
    fn unknown_status_is_pending() {
        assert_eq!(ExternalStatus::classify("7"), ExternalStatus::Unrecognized);
        assert_eq!(JobState::normalize("7"), JobState::Pending);
    }
}
