//! CLI output formatting

use crate::core::{BarrierSetupInfo, NodeExecution, RunSummary, Status};
use crate::execution::ExecutionEvent;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Spinner shown while a run is pumped
pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Format a node status for display
pub fn format_status(status: Status) -> String {
    let text = status.as_str();
    match status {
        Status::Succeeded => style(text).green().to_string(),
        Status::Skipped | Status::Queued => style(text).dim().to_string(),
        Status::Running | Status::Resumed => style(text).yellow().to_string(),
        Status::Paused | Status::Pausing | Status::InputWaiting => style(text).blue().to_string(),
        _ => style(text).red().to_string(),
    }
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format a run summary for history listings
pub fn format_run_summary(summary: &RunSummary) -> String {
    let icon = if summary.status.is_success() {
        CHECK
    } else if summary.ended_at.is_none() {
        SPINNER
    } else {
        CROSS
    };
    let mut line = format!(
        "{} {} - {} - {}",
        icon,
        style(short_id(&summary.plan_execution_id)).dim(),
        style(&summary.plan_name).bold(),
        format_status(summary.status)
    );
    if let Some(message) = &summary.failure_message {
        line.push_str(&format!(" ({})", style(message).dim()));
    }
    line
}

/// One node execution, indented by depth
pub fn format_node(node: &NodeExecution) -> String {
    let indent = "  ".repeat(node.ambiance.depth().saturating_sub(1));
    let mut line = format!(
        "{}{} {}",
        indent,
        style(node.ambiance.fqn()).cyan(),
        format_status(node.status)
    );
    if !node.retry_ids.is_empty() {
        line.push_str(&format!(" (attempt {})", node.retry_ids.len() + 1));
    }
    if node.old_retry {
        line.push_str(&style(" [retried]").dim().to_string());
    }
    if node.failure_ignored {
        line.push_str(&style(" [ignored]").dim().to_string());
    }
    line
}

pub fn format_barrier(info: &BarrierSetupInfo) -> String {
    let mut out = format!("{} {}", INFO, style(&info.identifier).bold());
    for position in &info.positions {
        let mut parts = Vec::new();
        if let Some(stage) = &position.stage_setup_id {
            parts.push(format!("stage={}", stage));
        }
        if let Some(group) = &position.step_group_setup_id {
            parts.push(format!("group={}", group));
        }
        if let Some(strategy) = &position.strategy_setup_id {
            parts.push(format!("strategy={}", strategy));
        }
        out.push_str(&format!(
            "\n  {} {}",
            style(&position.step_setup_id).cyan(),
            style(parts.join(" ")).dim()
        ));
    }
    out
}

/// Format an execution event for display; status changes of containers and
/// queueing are left to the logs
pub fn format_execution_event(event: &ExecutionEvent) -> Option<String> {
    match event {
        ExecutionEvent::RunStarted {
            plan_execution_id,
            plan_id,
        } => Some(format!(
            "{} Starting plan {} ({})",
            ROCKET,
            style(plan_id).bold(),
            style(short_id(plan_execution_id)).dim()
        )),
        ExecutionEvent::NodeStatusChanged { identifier, to, .. } => match to {
            Status::Running => Some(format!("{} {}", SPINNER, style(identifier).cyan())),
            s if s.is_success() => Some(format!("{} {}", CHECK, style(identifier).green())),
            s if s.is_failure() => Some(format!(
                "{} {} {}",
                CROSS,
                style(identifier).red(),
                format_status(*s)
            )),
            Status::InputWaiting | Status::Paused => Some(format!(
                "{} {} {}",
                WARN,
                style(identifier).yellow(),
                format_status(*to)
            )),
            _ => None,
        },
        ExecutionEvent::AdviserDecision { advise_type, .. } => {
            Some(format!("{}   adviser: {:?}", INFO, advise_type))
        }
        ExecutionEvent::BarrierReleased {
            identifier,
            released,
            ..
        } => Some(format!(
            "{} Barrier {} released {} branches",
            INFO,
            style(identifier).bold(),
            released
        )),
        ExecutionEvent::InterruptProcessed { interrupt_type, .. } => {
            Some(format!("{} {} interrupt applied", INFO, interrupt_type))
        }
        ExecutionEvent::InterruptRejected {
            interrupt_type,
            reason,
            ..
        } => Some(format!(
            "{} {} interrupt rejected: {}",
            WARN,
            interrupt_type,
            style(reason).dim()
        )),
        ExecutionEvent::RunCompleted { status, .. } => {
            Some(format!("{} Run finished {}", INFO, format_status(*status)))
        }
    }
}

/// Human readable duration
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
