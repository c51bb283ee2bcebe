//! Per-object job lifecycle

use std::fmt;

use crate::error::FailureKind;
use crate::object::{ObjectRef, Versioned};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Decrypting,
    Resealing,
    Updating,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Pending => "pending",
            JobState::Decrypting => "decrypting",
            JobState::Resealing => "resealing",
            JobState::Updating => "updating",
            JobState::Done => "done",
            JobState::Failed => "failed",
        })
    }
}

/// One object queued for re-encryption
#[derive(Debug)]
pub struct ReencryptionJob {
    pub object: ObjectRef,
    /// Snapshot taken at list time, replaced on conflict re-fetch
    pub current: Versioned,
    pub state: JobState,
    /// Decrypt/update passes started, including conflict retries
    pub attempts: u32,
    pub last_error: Option<(FailureKind, String)>,
}

impl ReencryptionJob {
    pub fn new(current: Versioned) -> Self {
        Self {
            object: current.object.object_ref(),
            current,
            state: JobState::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    /// Move to `next`. Terminal states are final.
    pub fn enter(&mut self, next: JobState) {
        if self.state.is_terminal() {
            return;
        }
        if next == JobState::Decrypting {
            self.attempts += 1;
        }
        self.state = next;
    }

    pub fn fail(&mut self, kind: FailureKind, detail: impl Into<String>) {
        self.last_error = Some((kind, detail.into()));
        self.enter(JobState::Failed);
    }
}
