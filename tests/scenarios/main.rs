//! Scenario-based tests for the execution engine

mod helpers;

mod concurrent_consumers;
mod interrupts;
mod manual_intervention;
mod pause_resume;
mod plan_errors;
mod step_execution;
mod strategy_expansion;
mod success_chain;
