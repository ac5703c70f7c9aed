//! Node execution status and the transition graph between statuses

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status of a node execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Created, waiting for its start event
    Queued,
    /// Started and not yet finished
    Running,
    Succeeded,
    Failed,
    /// Internal or plan error
    Errored,
    Expired,
    Rejected,
    Aborted,
    Skipped,
    /// Suspended by a pause interrupt
    Paused,
    /// Pause requested, waiting for the next safe point
    Pausing,
    /// Waiting for manual intervention
    InputWaiting,
    /// Resumed after a pause, behaves like RUNNING
    Resumed,
}

/// Rejected attempt to move a node between two statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal status transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: Status,
    pub to: Status,
}

const FROM_QUEUED: &[Status] = &[
    Status::Running,
    Status::Paused,
    Status::Aborted,
    Status::Skipped,
    Status::Errored,
    Status::Expired,
];

const FROM_RUNNING: &[Status] = &[
    Status::Succeeded,
    Status::Failed,
    Status::Errored,
    Status::Expired,
    Status::Rejected,
    Status::Aborted,
    Status::Skipped,
    Status::Pausing,
    Status::Paused,
    Status::InputWaiting,
    Status::Resumed,
];

const FROM_PAUSING: &[Status] = &[
    Status::Paused,
    Status::Resumed,
    Status::Aborted,
    Status::Errored,
];

const FROM_PAUSED: &[Status] = &[Status::Resumed, Status::Queued, Status::Aborted];

const FROM_INPUT_WAITING: &[Status] = &[
    Status::Succeeded,
    Status::Failed,
    Status::Errored,
    Status::Expired,
    Status::Rejected,
    Status::Aborted,
];

// Adviser re-classification of a finished failure.
const FROM_BROKEN: &[Status] = &[Status::InputWaiting, Status::Succeeded];

impl Status {
    pub const ALL: [Status; 13] = [
        Status::Queued,
        Status::Running,
        Status::Succeeded,
        Status::Failed,
        Status::Errored,
        Status::Expired,
        Status::Rejected,
        Status::Aborted,
        Status::Skipped,
        Status::Paused,
        Status::Pausing,
        Status::InputWaiting,
        Status::Resumed,
    ];

    /// Statuses reachable from this one in a single write
    pub fn successors(self) -> &'static [Status] {
        match self {
            Status::Queued => FROM_QUEUED,
            Status::Running | Status::Resumed => FROM_RUNNING,
            Status::Pausing => FROM_PAUSING,
            Status::Paused => FROM_PAUSED,
            Status::InputWaiting => FROM_INPUT_WAITING,
            Status::Failed | Status::Errored | Status::Expired | Status::Rejected => FROM_BROKEN,
            Status::Succeeded | Status::Skipped | Status::Aborted => &[],
        }
    }

    pub fn can_transition_to(self, to: Status) -> bool {
        self.successors().contains(&to)
    }

    /// Check a transition, returning the rejection when it is not in the graph
    pub fn check_transition(self, to: Status) -> Result<(), IllegalTransition> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(IllegalTransition { from: self, to })
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Status::Succeeded | Status::Skipped)
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Status::Failed | Status::Errored | Status::Expired | Status::Rejected | Status::Aborted
        )
    }

    /// Success or failure family
    pub fn is_final(self) -> bool {
        self.is_success() || self.is_failure()
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            Status::Queued
                | Status::Running
                | Status::Resumed
                | Status::Paused
                | Status::Pausing
                | Status::InputWaiting
        )
    }

    /// Running or resumed, i.e. a step outcome may be applied
    pub fn is_executing(self) -> bool {
        matches!(self, Status::Running | Status::Resumed)
    }

    /// Failures that advisers may act on; aborted nodes are never advised
    pub fn is_adviseable_failure(self) -> bool {
        self.is_failure() && self != Status::Aborted
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Errored => "ERRORED",
            Status::Expired => "EXPIRED",
            Status::Rejected => "REJECTED",
            Status::Aborted => "ABORTED",
            Status::Skipped => "SKIPPED",
            Status::Paused => "PAUSED",
            Status::Pausing => "PAUSING",
            Status::InputWaiting => "INPUT_WAITING",
            Status::Resumed => "RESUMED",
        }
    }

    pub fn parse(value: &str) -> Option<Status> {
        Status::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a container from the final statuses of its children.
///
/// Each entry is `(status, failure_ignored)`. An aborted child wins, then the
/// first failure that was not ignored; otherwise the container succeeds, or is
/// skipped when every child was skipped.
pub fn aggregate<I>(children: I) -> Status
where
    I: IntoIterator<Item = (Status, bool)>,
{
    let mut first_failure = None;
    let mut all_skipped = true;
    let mut any = false;

    for (status, ignored) in children {
        any = true;
        if status == Status::Aborted {
            return Status::Aborted;
        }
        if status.is_failure() && !ignored && first_failure.is_none() {
            first_failure = Some(status);
        }
        if status != Status::Skipped {
            all_skipped = false;
        }
    }

    match first_failure {
        Some(status) => status,
        None if any && all_skipped => Status::Skipped,
        None => Status::Succeeded,
    }
}
