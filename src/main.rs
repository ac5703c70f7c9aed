use anyhow::{Context, Result};
use pipeline_engine::cli::commands::{BarriersCommand, HistoryCommand, RunCommand, ValidateCommand};
use pipeline_engine::cli::output::*;
use pipeline_engine::cli::{Cli, Command};
use pipeline_engine::core::config::PlanConfig;
use pipeline_engine::core::RunSummary;
use pipeline_engine::execution::{Engine, EngineConfig, InMemoryQueue};
use pipeline_engine::persistence::{
    ExecutionStore, InMemoryStore, NodeExecutionStore, RunStore, SqliteStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_plan(cmd).await?,
        Command::Validate(cmd) => validate_plan(cmd)?,
        Command::Barriers(cmd) => show_barriers(cmd)?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

async fn run_plan(cmd: &RunCommand) -> Result<()> {
    let mut config = PlanConfig::from_file(&cmd.file).context("Failed to load plan")?;
    for (key, value) in &cmd.set {
        config.setup.insert(key.clone(), value.clone());
        println!(
            "{} Setup override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }
    let plan = config.to_plan().context("Failed to compile plan")?;

    let store: Arc<dyn ExecutionStore> = if cmd.no_history {
        Arc::new(InMemoryStore::new())
    } else {
        Arc::new(SqliteStore::with_default_path().await?)
    };

    let mut engine_config = EngineConfig::default();
    if let Some(secs) = cmd.step_timeout_secs {
        engine_config = engine_config.with_step_timeout(Duration::from_secs(secs));
    }

    let spinner = create_spinner(&format!("Running {}", plan.name));
    let printer = spinner.clone();
    let engine = Engine::builder(store, Arc::new(InMemoryQueue::new()))
        .with_config(engine_config)
        .with_event_handler(move |event| {
            if let Some(line) = format_execution_event(&event) {
                printer.println(line);
            }
        })
        .build();

    let plan_name = plan.name.clone();
    let plan_execution_id = engine.start_run(plan).await?;
    let mut run = engine.run_to_completion(plan_execution_id).await?;
    spinner.finish_and_clear();

    if !run.is_finished() {
        println!(
            "{} Run is waiting for input that a dry run cannot provide",
            WARN
        );
        engine
            .error_out_run(plan_execution_id, "dry run stalled waiting for external input")
            .await?;
        run = engine
            .run(plan_execution_id)
            .await?
            .context("Run disappeared from the store")?;
    }

    if !cmd.no_history {
        println!(
            "{} Run saved to history (ID: {})",
            INFO,
            style(plan_execution_id.to_string()).dim()
        );
    }

    if run.status.is_success() {
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(&plan_name).bold(),
            style("successfully").green()
        );
        Ok(())
    } else {
        println!(
            "\n{} {} {}",
            CROSS,
            style(&plan_name).bold(),
            format_status(run.status)
        );
        if let Some(failure) = &run.failure_info {
            error!("{}", failure.message);
        }
        std::process::exit(1);
    }
}

fn validate_plan(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating plan...", INFO);

    let compiled = PlanConfig::from_file(&cmd.file).and_then(|config| {
        let plan = config.to_plan()?;
        Ok((config, plan))
    });

    match compiled {
        Ok((config, plan)) => {
            println!("{} Plan is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Nodes: {}", style(config.nodes.len()).cyan());
            println!("  Barriers: {}", style(plan.barrier_setup_info().len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&plan)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

fn show_barriers(cmd: &BarriersCommand) -> Result<()> {
    let plan = PlanConfig::from_file(&cmd.file)
        .and_then(|config| config.to_plan())
        .context("Failed to load plan")?;
    let barriers = plan.barrier_setup_info();

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&barriers)?);
        return Ok(());
    }
    if barriers.is_empty() {
        println!("{} Plan {} has no barriers", INFO, style(&plan.name).bold());
        return Ok(());
    }
    for info in &barriers {
        println!("{}", format_barrier(info));
    }
    Ok(())
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = SqliteStore::with_default_path().await?;

    if let Some(run_id) = &cmd.run_id {
        let run_id = uuid::Uuid::parse_str(run_id).context("Invalid run ID format")?;
        let Some(run) = store.get_run(run_id).await? else {
            println!("{} Run not found", WARN);
            return Ok(());
        };
        let nodes = store.list_nodes(run_id).await?;

        if cmd.json {
            let data = serde_json::json!({ "run": RunSummary::from(&run), "nodes": nodes });
            println!("{}", serde_json::to_string_pretty(&data)?);
            return Ok(());
        }

        println!("{}", format_run_summary(&RunSummary::from(&run)));
        if let Some(ended) = run.ended_at {
            if let Ok(duration) = ended.signed_duration_since(run.started_at).to_std() {
                println!("  Duration: {}", style(format_duration(duration)).dim());
            }
        }
        for node in &nodes {
            println!("  {}", format_node(node));
        }
        return Ok(());
    }

    let runs = store.list_runs(cmd.limit).await?;
    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    let summaries: Vec<RunSummary> = runs.iter().map(RunSummary::from).collect();
    if cmd.json {
        let data = serde_json::json!({ "runs": summaries });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Run history (showing latest {}):", INFO, cmd.limit);
        for summary in &summaries {
            println!("  {}", format_run_summary(summary));
        }
    }
    Ok(())
}
