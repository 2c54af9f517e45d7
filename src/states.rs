use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// Jobs start in [`Created`](JobState::Created) and move forward only:
/// `created → active → {completed | failed | cancelled | expired}`. The single
/// backward edge is the retry requeue from `failed` or `expired` to `created`.
/// Terminal rows are later moved to the archive table and eventually deleted;
/// neither step is a state of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be claimed.
    Created,
    /// Claimed by exactly one worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Failed; terminal once retries are exhausted.
    Failed,
    /// Cancelled by request before completion.
    Cancelled,
    /// Abandoned by its worker past `expire_in`; routed through retry.
    Expired,
}

impl JobState {
    /// The state's wire representation, as stored in the `state` column.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Expired => "expired",
        }
    }

    /// Whether the job has reached an outcome. Terminal jobs are never
    /// dispatched again; `failed` and `expired` leave terminality only through
    /// the retry requeue.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Expired
        )
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition(self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Created, JobState::Active | JobState::Cancelled) => true,
            (
                JobState::Active,
                JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Expired,
            ) => true,
            // retry requeue
            (JobState::Failed | JobState::Expired, JobState::Created) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
