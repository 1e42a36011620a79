//! State machine error types.

use std::fmt;

use thiserror::Error;

use crate::job::JobStatus;

/// Operation attempted on a job snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Start,
    Progress,
    AttachMetadata,
    Complete,
    Fail,
    Requeue,
    Pause,
    Resume,
    Cancel,
    RecoverStalled,
}

impl JobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Start => "start",
            JobAction::Progress => "update progress of",
            JobAction::AttachMetadata => "attach metadata to",
            JobAction::Complete => "complete",
            JobAction::Fail => "fail",
            JobAction::Requeue => "requeue",
            JobAction::Pause => "pause",
            JobAction::Resume => "resume",
            JobAction::Cancel => "cancel",
            JobAction::RecoverStalled => "recover",
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition that is not allowed from the job's current status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {action} job in status {from}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub action: JobAction,
}

impl TransitionError {
    pub fn new(from: JobStatus, action: JobAction) -> Self {
        Self { from, action }
    }
}
