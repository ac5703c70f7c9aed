//! CLI command definitions

use clap::Args;

/// Dry-run a plan
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to plan YAML or JSON file
    #[arg(short, long)]
    pub file: String,

    /// Setup abstraction overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub set: Vec<(String, String)>,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,

    /// Fail steps that run longer than this
    #[arg(long)]
    pub step_timeout_secs: Option<u64>,
}

/// Validate a plan document
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to plan YAML or JSON file
    #[arg(short, long)]
    pub file: String,

    /// Print the compiled plan as JSON
    #[arg(long)]
    pub json: bool,
}

/// Show barrier setup info
#[derive(Debug, Args, Clone)]
pub struct BarriersCommand {
    /// Path to plan YAML or JSON file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show the node executions of one run
    #[arg(long)]
    pub run_id: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}
