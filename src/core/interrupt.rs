//! Interrupt documents: external control signals against a run

use crate::advise::AdviseType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    Abort,
    Pause,
    Resume,
    Retry,
    MarkSuccess,
    Ignore,
}

impl InterruptType {
    /// Interrupts that resolve a manual intervention wait
    pub fn is_intervention(self) -> bool {
        self.decision().is_some()
    }

    /// Adviser decision an intervention stands for
    pub fn decision(self) -> Option<AdviseType> {
        match self {
            InterruptType::Retry => Some(AdviseType::Retry),
            InterruptType::MarkSuccess => Some(AdviseType::MarkSuccess),
            InterruptType::Ignore => Some(AdviseType::Ignore),
            InterruptType::Abort | InterruptType::Pause | InterruptType::Resume => None,
        }
    }
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterruptType::Abort => "ABORT",
            InterruptType::Pause => "PAUSE",
            InterruptType::Resume => "RESUME",
            InterruptType::Retry => "RETRY",
            InterruptType::MarkSuccess => "MARK_SUCCESS",
            InterruptType::Ignore => "IGNORE",
        };
        f.write_str(name)
    }
}

/// Processing state; PROCESSED and DISCARDED are final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    Processed,
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: Uuid,
    pub interrupt_type: InterruptType,
    pub plan_execution_id: Uuid,
    /// Target node; the whole run when absent
    pub node_execution_id: Option<Uuid>,
    pub state: InterruptState,
    /// Why the interrupt was discarded
    #[serde(default)]
    pub rejection: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Interrupt {
    pub fn new(
        interrupt_type: InterruptType,
        plan_execution_id: Uuid,
        node_execution_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            interrupt_type,
            plan_execution_id,
            node_execution_id,
            state: InterruptState::Registered,
            rejection: None,
            version: 0,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    /// Already consumed, never touched again
    pub fn is_consumed(&self) -> bool {
        matches!(
            self.state,
            InterruptState::Processed | InterruptState::Discarded
        )
    }

    pub fn mark_processed(&mut self) {
        self.state = InterruptState::Processed;
        self.processed_at = Some(Utc::now());
    }

    pub fn mark_discarded(&mut self, reason: impl Into<String>) {
        self.state = InterruptState::Discarded;
        self.rejection = Some(reason.into());
        self.processed_at = Some(Utc::now());
    }
}
