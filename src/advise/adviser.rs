//! The built-in advisers and chain resolution

use crate::advise::params::*;
use crate::advise::{AdviserError, AdviserObtainment, AdviserResponse, AdviserType, AdvisingEvent};
use crate::core::failure::{filter_matches, FailureType};
use serde::de::DeserializeOwned;
use tracing::debug;

/// A built adviser with decoded parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adviser {
    OnSuccess(OnSuccessParams),
    OnFail(OnFailParams),
    Ignore(IgnoreParams),
    Retry(RetryParams),
    ManualIntervention(ManualInterventionParams),
    MarkSuccess(MarkSuccessParams),
    EndPlan(EndPlanParams),
}

fn decode<P: DeserializeOwned + Default>(
    adviser_type: AdviserType,
    bytes: &[u8],
) -> Result<P, AdviserError> {
    if bytes.is_empty() {
        return Ok(P::default());
    }
    serde_json::from_slice(bytes)
        .map_err(|source| AdviserError::InvalidParameters { adviser_type, source })
}

impl Adviser {
    pub fn from_obtainment(obtainment: &AdviserObtainment) -> Result<Self, AdviserError> {
        let t = obtainment.adviser_type;
        let bytes = obtainment.parameters.as_slice();
        Ok(match t {
            AdviserType::OnSuccess => Adviser::OnSuccess(decode(t, bytes)?),
            AdviserType::OnFail => Adviser::OnFail(decode(t, bytes)?),
            AdviserType::Ignore => Adviser::Ignore(decode(t, bytes)?),
            AdviserType::Retry => Adviser::Retry(decode(t, bytes)?),
            AdviserType::ManualIntervention => Adviser::ManualIntervention(decode(t, bytes)?),
            AdviserType::MarkSuccess => Adviser::MarkSuccess(decode(t, bytes)?),
            AdviserType::EndPlan => Adviser::EndPlan(decode(t, bytes)?),
        })
    }

    pub fn adviser_type(&self) -> AdviserType {
        match self {
            Adviser::OnSuccess(_) => AdviserType::OnSuccess,
            Adviser::OnFail(_) => AdviserType::OnFail,
            Adviser::Ignore(_) => AdviserType::Ignore,
            Adviser::Retry(_) => AdviserType::Retry,
            Adviser::ManualIntervention(_) => AdviserType::ManualIntervention,
            Adviser::MarkSuccess(_) => AdviserType::MarkSuccess,
            Adviser::EndPlan(_) => AdviserType::EndPlan,
        }
    }

    /// Sibling this adviser continues with, if it routes at all
    pub fn next_node_id(&self) -> Option<&str> {
        match self {
            Adviser::OnSuccess(p) => p.next_node_id.as_deref(),
            Adviser::OnFail(p) => p.next_node_id.as_deref(),
            Adviser::Ignore(p) => p.next_node_id.as_deref(),
            Adviser::MarkSuccess(p) => p.next_node_id.as_deref(),
            Adviser::Retry(_) | Adviser::ManualIntervention(_) | Adviser::EndPlan(_) => None,
        }
    }

    fn failure_filter(&self) -> &[FailureType] {
        match self {
            Adviser::OnSuccess(_) => &[],
            Adviser::OnFail(p) => &p.failure_types,
            Adviser::Ignore(p) => &p.failure_types,
            Adviser::Retry(p) => &p.failure_types,
            Adviser::ManualIntervention(p) => &p.failure_types,
            Adviser::MarkSuccess(p) => &p.failure_types,
            Adviser::EndPlan(p) => &p.failure_types,
        }
    }

    pub fn can_advise(&self, event: &AdvisingEvent) -> bool {
        if let Adviser::OnSuccess(_) = self {
            return event.to_status.is_success();
        }

        if !event.to_status.is_adviseable_failure()
            || !filter_matches(event.failure_info.as_ref(), self.failure_filter())
        {
            return false;
        }

        match self {
            Adviser::Retry(p) => event.retry_ids.len() < p.retry_count as usize,
            Adviser::ManualIntervention(_) => !event.previous_adviser_expired,
            _ => true,
        }
    }

    pub fn on_advise_event(&self, event: &AdvisingEvent) -> AdviserResponse {
        match self {
            Adviser::OnSuccess(p) => AdviserResponse::NextStep {
                next_node_id: p.next_node_id.clone(),
            },
            Adviser::OnFail(p) => AdviserResponse::NextStep {
                next_node_id: p.next_node_id.clone(),
            },
            Adviser::Ignore(p) => AdviserResponse::Ignore {
                next_node_id: p.next_node_id.clone(),
            },
            Adviser::Retry(p) => AdviserResponse::Retry {
                wait_secs: p.wait_for_attempt(event.retry_ids.len()),
                retry_ids: event.retry_ids.clone(),
            },
            Adviser::ManualIntervention(p) => AdviserResponse::InterventionWait {
                timeout_secs: p.timeout_secs,
            },
            Adviser::MarkSuccess(p) => AdviserResponse::MarkSuccess {
                next_node_id: p.next_node_id.clone(),
            },
            Adviser::EndPlan(_) => AdviserResponse::EndPlan,
        }
    }
}

/// Advisers of one node, in priority order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdviserChain {
    advisers: Vec<Adviser>,
}

impl AdviserChain {
    /// Decode every obtainment up front so malformed parameters surface before
    /// the node runs.
    pub fn build(obtainments: &[AdviserObtainment]) -> Result<Self, AdviserError> {
        let advisers = obtainments
            .iter()
            .map(Adviser::from_obtainment)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { advisers })
    }

    pub fn advisers(&self) -> &[Adviser] {
        &self.advisers
    }

    /// First applicable adviser and its decision
    pub fn advise(&self, event: &AdvisingEvent) -> Option<(AdviserType, AdviserResponse)> {
        for adviser in &self.advisers {
            if adviser.can_advise(event) {
                let response = adviser.on_advise_event(event);
                debug!(
                    adviser = ?adviser.adviser_type(),
                    decision = ?response.advise_type(),
                    "adviser selected"
                );
                return Some((adviser.adviser_type(), response));
            }
        }
        None
    }

    /// Sibling an intervention continues with, taken from the success adviser
    pub fn success_next_node(&self) -> Option<String> {
        self.advisers.iter().find_map(|a| match a {
            Adviser::OnSuccess(p) => p.next_node_id.clone(),
            _ => None,
        })
    }
}

/// Build the chain and resolve a decision in one go
pub fn resolve(
    obtainments: &[AdviserObtainment],
    event: &AdvisingEvent,
) -> Result<Option<(AdviserType, AdviserResponse)>, AdviserError> {
    Ok(AdviserChain::build(obtainments)?.advise(event))
}
