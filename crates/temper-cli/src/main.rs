//! CLI binary for driving temper pipelines.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use temper_pipeline::{
    LaunchConfig, PipelineController, PipelineEvent, ProcessSupervisor, QuantPreset, RunOutcome,
    Settings, StageGraph,
};

#[derive(Parser)]
#[command(
    name = "temper",
    version,
    about = "Artifact-driven model fine-tuning pipeline runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the settings file (created with defaults if missing)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Override the models root from the settings file
    #[arg(short, long, global = true)]
    models_root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List workflow instances under the models root
    List,

    /// Create a new workflow instance folder
    New {
        /// Instance name (one folder per model)
        name: String,
    },

    /// Show per-stage pipeline status for an instance
    Status { instance: String },

    /// Show the stage catalogue and its artifact dependencies
    Stages,

    /// Run one stage, with classification and bounded retries on failure
    Run {
        instance: String,
        stage: String,

        /// Re-run even if the stage's outputs are already valid
        #[arg(long)]
        force: bool,

        /// Quantization preset for the export stage (Q4_K_M, Q6_K, Q8_0)
        #[arg(long)]
        quant: Option<String>,
    },

    /// Summarize recorded calibration answers
    Summary { instance: String },

    /// Print run-log records for an instance
    Log {
        instance: String,

        /// Restrict to one stage
        stage: Option<String>,
    },
}

fn default_settings_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("temper")
        .join("settings.json")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings_path = cli.settings.unwrap_or_else(default_settings_path);
    let mut settings = Settings::load_or_init(&settings_path).await?;
    if let Some(root) = cli.models_root {
        settings.models_root = root;
    }

    match cli.command {
        Commands::List => cmd_list(settings).await?,
        Commands::New { name } => cmd_new(settings, &name).await?,
        Commands::Status { instance } => cmd_status(settings, &instance).await?,
        Commands::Stages => cmd_stages(),
        Commands::Run {
            instance,
            stage,
            force,
            quant,
        } => cmd_run(settings, &instance, &stage, force, quant.as_deref()).await?,
        Commands::Summary { instance } => cmd_summary(settings, &instance).await?,
        Commands::Log { instance, stage } => cmd_log(settings, &instance, stage.as_deref()).await?,
    }

    Ok(())
}

async fn cmd_list(settings: Settings) -> anyhow::Result<()> {
    let controller = PipelineController::with_defaults(settings);
    let instances = controller.store().list_instances().await?;
    if instances.is_empty() {
        println!(
            "No instances under {}",
            controller.store().models_root().display()
        );
        println!("Create one with: temper new <name>");
        return Ok(());
    }
    for name in instances {
        println!("{name}");
    }
    Ok(())
}

async fn cmd_new(settings: Settings, name: &str) -> anyhow::Result<()> {
    let controller = PipelineController::with_defaults(settings);
    let root = controller.store().create_instance(name).await?;
    println!("Created instance at {}", root.display());
    println!("Seed it with a question set and a base-model reference, then run:");
    println!("  temper run {name} calibrate");
    Ok(())
}

async fn cmd_status(settings: Settings, instance: &str) -> anyhow::Result<()> {
    let controller = PipelineController::with_defaults(settings);
    let status = controller.status(instance).await?;

    println!("Instance: {}", status.instance);
    for entry in &status.stages {
        let exit = entry
            .last_exit_code
            .map(|c| format!("exit {c}"))
            .unwrap_or_else(|| "-".to_string());
        let attempts = if entry.attempts_used > 0 {
            format!("{} attempt(s)", entry.attempts_used)
        } else {
            "never ran".to_string()
        };
        println!(
            "  {:<12} {:<18} {:<10} {}",
            entry.stage,
            entry.state.to_string(),
            exit,
            attempts
        );
    }
    Ok(())
}

fn cmd_stages() {
    let graph = StageGraph::default_graph();
    println!("Pipeline stages:");
    for stage in graph.stages() {
        println!("  {} — {}", stage.name, stage.label);
        println!("    inputs:  {}", stage.inputs.join(", "));
        println!("    outputs: {}", stage.outputs.join(", "));
        println!(
            "    retries: {}  timeout: {}s  retryable: {}",
            stage.attempt_budget(),
            stage.timeout.as_secs(),
            stage.retryable
        );
    }
    println!("\nArtifacts:");
    for artifact in graph.artifacts() {
        let producer = graph.producer_of(&artifact.name).unwrap_or("(seeded)");
        println!("  {:<16} {:<44} {}", artifact.name, artifact.rel_path, producer);
    }
}

async fn cmd_run(
    settings: Settings,
    instance: &str,
    stage: &str,
    force: bool,
    quant: Option<&str>,
) -> anyhow::Result<()> {
    let mut launch = LaunchConfig::for_settings(&settings);
    if let Some(q) = quant {
        launch.quant = q.parse::<QuantPreset>()?;
    }
    let controller = Arc::new(PipelineController::new(
        settings,
        launch,
        StageGraph::default_graph(),
        Arc::new(ProcessSupervisor),
    ));

    // Progress lines from the event stream.
    let mut events = controller.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    // Ctrl-C cancels the in-flight stage instead of orphaning the worker.
    {
        let controller = controller.clone();
        let instance = instance.to_string();
        let stage = stage.to_string();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("cancelling '{stage}'...");
                controller.cancel_stage(&instance, &stage);
            }
        });
    }

    match controller.run_stage(instance, stage, force).await? {
        RunOutcome::Succeeded { attempts } => {
            println!("Stage '{stage}' succeeded after {attempts} attempt(s)");
        }
        RunOutcome::AlreadyComplete => {
            println!("Stage '{stage}' outputs are already valid; use --force to re-run");
        }
        RunOutcome::Cancelled => {
            println!("Stage '{stage}' cancelled; it remains eligible and unpenalized");
        }
    }
    Ok(())
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::StageStarted { stage, attempt, .. } => {
            println!("[{stage}] attempt {attempt} started");
        }
        PipelineEvent::StageAttemptFailed {
            stage,
            attempt,
            signature,
            exit_code,
            timed_out,
            ..
        } => {
            let how = if *timed_out {
                "timed out".to_string()
            } else {
                format!("exit {exit_code}")
            };
            println!("[{stage}] attempt {attempt} failed ({signature}, {how})");
        }
        PipelineEvent::RemediationApplied { stage, detail, .. } => {
            println!("[{stage}] remediation: {detail}");
        }
        PipelineEvent::StageRetrying {
            stage, next_attempt, ..
        } => {
            println!("[{stage}] retrying (attempt {next_attempt})");
        }
        PipelineEvent::StageSucceeded {
            stage,
            attempts,
            duration_ms,
            ..
        } => {
            println!("[{stage}] succeeded after {attempts} attempt(s) in {duration_ms}ms");
        }
        PipelineEvent::StageFailed { stage, error, .. } => {
            println!("[{stage}] failed: {error}");
        }
        PipelineEvent::StageCancelled { stage, .. } => {
            println!("[{stage}] cancelled");
        }
    }
}

async fn cmd_summary(settings: Settings, instance: &str) -> anyhow::Result<()> {
    let controller = PipelineController::with_defaults(settings);
    let spec = controller
        .graph()
        .artifact("user_answers")
        .ok_or_else(|| anyhow::anyhow!("pipeline has no user_answers artifact"))?;
    let answers = controller.store().read_json(instance, spec).await?;

    let responses = answers
        .get("responses")
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default();
    let total = responses.len();
    let mut choice_a = 0usize;
    let mut choice_b = 0usize;
    let mut free_form = 0usize;
    for item in &responses {
        match item.get("choice").and_then(|c| c.as_str()) {
            Some("A") => choice_a += 1,
            Some("B") => choice_b += 1,
            _ => {}
        }
        if item
            .get("response")
            .and_then(|r| r.as_str())
            .map(|r| !r.trim().is_empty())
            .unwrap_or(false)
        {
            free_form += 1;
        }
    }

    println!("Total responses: {total}");
    println!("Choice A: {choice_a}");
    println!("Choice B: {choice_b}");
    println!("Free-form answers: {free_form}");
    Ok(())
}

async fn cmd_log(settings: Settings, instance: &str, stage: Option<&str>) -> anyhow::Result<()> {
    let controller = PipelineController::with_defaults(settings);
    controller.store().require_instance(instance).await?;
    let records =
        temper_pipeline::read_records(&controller.store().instance_root(instance)).await?;

    let mut shown = 0usize;
    for record in records {
        if let Some(filter) = stage {
            if record.stage != filter {
                continue;
            }
        }
        shown += 1;
        let exit = record
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} {:<12} attempt {} exit {} {:?}{}{}",
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            record.stage,
            record.attempt,
            exit,
            record.disposition,
            record
                .signature
                .as_deref()
                .map(|s| format!(" signature={s}"))
                .unwrap_or_default(),
            if record.remediations.is_empty() {
                String::new()
            } else {
                format!(" remediations=[{}]", record.remediations.join("; "))
            }
        );
    }
    if shown == 0 {
        println!("No run-log records");
    }
    Ok(())
}
