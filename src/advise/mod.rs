//! Adviser framework
//!
//! After a node finishes, its advisers are consulted in priority order. The
//! first adviser whose [`Adviser::can_advise`] holds produces the decision
//! ([`AdviserResponse`]) that the engine applies. When none applies, the
//! node's outcome is handed to its parent unchanged.

pub mod adviser;
pub mod params;
pub mod response;

pub use adviser::{resolve, Adviser, AdviserChain};
pub use response::{AdviseType, AdviserResponse};

use crate::core::ambiance::Ambiance;
use crate::core::failure::FailureInfo;
use crate::core::status::Status;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Built-in adviser kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserType {
    OnSuccess,
    OnFail,
    Ignore,
    Retry,
    ManualIntervention,
    MarkSuccess,
    EndPlan,
}

/// Adviser reference in a compiled plan: the type plus its encoded parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdviserObtainment {
    pub adviser_type: AdviserType,

    /// JSON-encoded parameters; empty means defaults
    #[serde(default)]
    pub parameters: Vec<u8>,
}

impl AdviserObtainment {
    pub fn new(adviser_type: AdviserType) -> Self {
        Self {
            adviser_type,
            parameters: Vec::new(),
        }
    }

    pub fn with_parameters<P: Serialize>(
        adviser_type: AdviserType,
        parameters: &P,
    ) -> Result<Self, AdviserError> {
        let parameters =
            serde_json::to_vec(parameters).map_err(|source| AdviserError::InvalidParameters {
                adviser_type,
                source,
            })?;
        Ok(Self {
            adviser_type,
            parameters,
        })
    }
}

/// What an adviser sees when asked for a decision
#[derive(Debug, Clone)]
pub struct AdvisingEvent {
    pub ambiance: Ambiance,
    pub from_status: Status,
    pub to_status: Status,
    pub failure_info: Option<FailureInfo>,
    /// Set when a previous manual intervention wait timed out
    pub previous_adviser_expired: bool,
    /// Ids of the earlier attempts of this node
    pub retry_ids: Vec<Uuid>,
}

/// Errors raised while building or dispatching advisers
#[derive(Debug, Error)]
pub enum AdviserError {
    #[error("invalid parameters for adviser {adviser_type:?}: {source}")]
    InvalidParameters {
        adviser_type: AdviserType,
        #[source]
        source: serde_json::Error,
    },

    #[error("no handler for advise type {0:?}")]
    UnknownAdviseType(AdviseType),
}
