//! `dockcheck` command-line entry point.
//!
//! Evaluates commands, paths and diffs against a deployment policy and runs
//! agent pipelines whose verdict becomes the process exit code.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, warn};

use dockcheck::core::agent::AgentKind;
use dockcheck::core::diff;
use dockcheck::core::layers::{group_by_parallel, resolve_layers};
use dockcheck::core::metrics::MetricsCollector;
use dockcheck::core::policy::{EvaluationInput, EvaluationResult, Policy, PolicyEngine};
use dockcheck::core::types::{PipelineResult, RunContext};
use dockcheck::exit_codes;
use dockcheck::io::config::{
    DEFAULT_CONFIG_PATH, DockcheckConfig, find_policy, load_config, load_pipeline, load_policy,
    load_services,
};
use dockcheck::io::dispatch::CliDispatcher;
use dockcheck::io::fanout::{FanOutResult, ParallelDispatcher};
use dockcheck::io::notify::{Notifier, NullNotifier, notifier_from_policy};
use dockcheck::io::prompt::PromptBuilder;
use dockcheck::logging;
use dockcheck::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(
    name = "dockcheck",
    version,
    about = "Policy-gated deployment checks driven by AI agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate commands, file paths and a diff against the policy.
    Check {
        /// Policy file (default: .dockcheck/policy.yaml, then policy.yaml).
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Command to check against hard stops. Repeatable.
        #[arg(long = "commands")]
        commands: Vec<String>,
        /// File path to check against critical paths. Repeatable.
        #[arg(long = "files")]
        files: Vec<String>,
        /// Unified diff file, or `-` for stdin.
        #[arg(long)]
        diff: Option<String>,
        /// Print the evaluation as JSON.
        #[arg(long, alias = "json-output")]
        json: bool,
    },
    /// Load the policy and report its contents and threshold warnings.
    Validate {
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Print the execution layers and parallel groups of a pipeline.
    Plan {
        #[arg(long)]
        pipeline: PathBuf,
    },
    /// Run a pipeline and exit with its decision.
    Run {
        #[arg(long)]
        pipeline: PathBuf,
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Runtime settings (default: .dockcheck/config.toml).
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long = "commands")]
        commands: Vec<String>,
        #[arg(long = "files")]
        files: Vec<String>,
        #[arg(long)]
        diff: Option<String>,
        /// Print the pipeline result as JSON.
        #[arg(long, alias = "json-output")]
        json: bool,
        /// Executable used for `claude` steps.
        #[arg(long)]
        claude_bin: Option<String>,
        /// Executable used for `codex` steps.
        #[arg(long)]
        codex_bin: Option<String>,
    },
    /// Run one templated prompt per service, concurrently.
    Fanout {
        /// YAML list of service maps, e.g. `- {name: api, path: services/api}`.
        #[arg(long)]
        services: PathBuf,
        /// Prompt template; `{field}` is replaced from each service map.
        #[arg(long)]
        template: String,
        #[arg(long, value_enum, default_value = "claude")]
        agent: AgentKind,
        #[arg(long, default_value_t = 10)]
        max_turns: u32,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, alias = "json-output")]
        json: bool,
        /// Executable used for the selected agent.
        #[arg(long)]
        agent_bin: Option<String>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAIL);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Check {
            policy,
            commands,
            files,
            diff,
            json,
        } => cmd_check(policy.as_deref(), commands, files, diff.as_deref(), json),
        Command::Validate { policy } => cmd_validate(policy.as_deref()),
        Command::Plan { pipeline } => cmd_plan(&pipeline),
        Command::Run {
            pipeline,
            policy,
            config,
            commands,
            files,
            diff,
            json,
            claude_bin,
            codex_bin,
        } => {
            let options = RunOptions {
                pipeline,
                policy,
                config,
                commands,
                files,
                diff,
                json,
                claude_bin,
                codex_bin,
            };
            cmd_run(options)
        }
        Command::Fanout {
            services,
            template,
            agent,
            max_turns,
            config,
            json,
            agent_bin,
        } => cmd_fanout(
            &services,
            &template,
            agent,
            max_turns,
            config,
            json,
            agent_bin,
        ),
    }
}

fn cmd_check(
    policy: Option<&Path>,
    commands: Vec<String>,
    mut files: Vec<String>,
    diff_source: Option<&str>,
    json: bool,
) -> Result<i32> {
    let policy_path = resolve_policy_path(policy)?;
    let engine = PolicyEngine::new(load_policy(&policy_path)?)?;

    let mut file_deletes = 0;
    if let Some(source) = diff_source {
        let text = read_diff(source)?;
        files.extend(diff::file_paths(&text));
        file_deletes = diff::deleted_file_count(&text);
    }

    let result = engine.evaluate(&EvaluationInput {
        commands,
        file_paths: files,
        file_deletes,
        ..EvaluationInput::default()
    });

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("serialize evaluation")?
        );
    } else {
        print_evaluation(&result);
    }
    Ok(exit_codes::for_verdict(result.verdict))
}

fn cmd_validate(policy: Option<&Path>) -> Result<i32> {
    let policy_path = resolve_policy_path(policy)?;
    let policy = load_policy(&policy_path)?;
    PolicyEngine::new(policy.clone())
        .with_context(|| format!("compile policy {}", policy_path.display()))?;

    println!("Policy valid: {}", policy_path.display());
    println!("  Version: {}", policy.version);
    println!("  Hard stop commands: {}", policy.hard_stops.commands.len());
    println!("  Critical paths: {}", policy.hard_stops.critical_paths.len());
    println!(
        "  Notification channels: {}",
        policy.notifications.channels.len()
    );
    for warning in policy.validate_thresholds() {
        println!("  Warning: {warning}");
    }
    Ok(exit_codes::PASS)
}

fn cmd_plan(pipeline_path: &Path) -> Result<i32> {
    let pipeline = load_pipeline(pipeline_path)?;
    let layers = resolve_layers(&pipeline.steps)?;

    for (idx, layer) in layers.iter().enumerate() {
        println!("Layer {idx}:");
        for group in group_by_parallel(layer) {
            let names: Vec<&str> = group.iter().map(|s| s.name.as_str()).collect();
            match group.first().and_then(|s| s.parallel_group.as_deref()) {
                Some(tag) => println!("  - [parallel: {tag}] {}", names.join(", ")),
                None => println!("  - {}", names.join(", ")),
            }
        }
    }
    Ok(exit_codes::PASS)
}

struct RunOptions {
    pipeline: PathBuf,
    policy: Option<PathBuf>,
    config: Option<PathBuf>,
    commands: Vec<String>,
    files: Vec<String>,
    diff: Option<String>,
    json: bool,
    claude_bin: Option<String>,
    codex_bin: Option<String>,
}

fn cmd_run(options: RunOptions) -> Result<i32> {
    let pipeline = load_pipeline(&options.pipeline)?;
    let policy = match options.policy.as_deref() {
        Some(path) => load_policy(&resolve_policy_path(Some(path))?)?,
        None => match find_policy(Path::new(".")) {
            Some(path) => load_policy(&path)?,
            None => {
                warn!("no policy file found; using built-in defaults");
                Policy::default()
            }
        },
    };
    let config = load_config_or_default(options.config)?;

    let mut context = RunContext {
        commands: options.commands,
        file_paths: options.files,
        diff: None,
    };
    if let Some(source) = options.diff.as_deref() {
        let text = read_diff(source)?;
        context.file_paths.extend(diff::file_paths(&text));
        context.diff = Some(text);
    }

    let mut dispatcher = CliDispatcher::new().with_output_limit(config.output_limit_bytes);
    if let Some(program) = options.claude_bin {
        dispatcher = dispatcher.with_program(AgentKind::Claude, program);
    }
    if let Some(program) = options.codex_bin {
        dispatcher = dispatcher.with_program(AgentKind::Codex, program);
    }

    // JSON output owns stdout; stdout notifications would corrupt it.
    let notifier: Box<dyn Notifier> = if options.json {
        Box::new(NullNotifier)
    } else {
        Box::new(notifier_from_policy(&policy.notifications))
    };

    let engine = PolicyEngine::new(policy)?;
    let metrics = Arc::new(MetricsCollector::new());
    let orchestrator = Orchestrator::new(engine, dispatcher, config.scorer(), notifier)
        .with_max_retries(config.max_retries)
        .with_prompt_builder(PromptBuilder::new(config.prompt_budget_bytes))
        .with_metrics(Arc::clone(&metrics));

    let result = block_on(orchestrator.run_pipeline(&pipeline, &context))??;
    debug!(summary = ?metrics.summary(), "run metrics");

    if options.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("serialize pipeline result")?
        );
    } else {
        print_pipeline_result(&result);
    }
    Ok(exit_codes::for_decision(result.decision))
}

fn cmd_fanout(
    services_path: &Path,
    template: &str,
    agent: AgentKind,
    max_turns: u32,
    config: Option<PathBuf>,
    json: bool,
    agent_bin: Option<String>,
) -> Result<i32> {
    let services = load_services(services_path)?;
    let config = load_config_or_default(config)?;
    let mut dispatcher = CliDispatcher::new().with_output_limit(config.output_limit_bytes);
    if let Some(program) = agent_bin {
        dispatcher = dispatcher.with_program(agent, program);
    }
    let fan_out = ParallelDispatcher::new(dispatcher).with_max_concurrent(config.max_concurrent);
    let result = block_on(fan_out.fan_out_services(&services, template, agent, max_turns))??;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("serialize fan-out result")?
        );
    } else {
        print_fan_out_result(&result);
    }
    Ok(if result.all_completed {
        exit_codes::PASS
    } else {
        exit_codes::FAIL
    })
}

fn load_config_or_default(explicit: Option<PathBuf>) -> Result<DockcheckConfig> {
    let path = explicit.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    load_config(&path)
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    Ok(runtime.block_on(future))
}

fn resolve_policy_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) if path.is_file() => Ok(path.to_path_buf()),
        Some(path) => bail!("policy file not found at {}", path.display()),
        None => find_policy(Path::new("."))
            .context("no policy.yaml found in .dockcheck/ or the current directory"),
    }
}

fn read_diff(source: &str) -> Result<String> {
    if source == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("read diff from stdin")?;
        return Ok(text);
    }
    fs::read_to_string(source).with_context(|| format!("read diff {source}"))
}

fn print_evaluation(result: &EvaluationResult) {
    let verdict = result.verdict.as_str().to_uppercase();
    println!("[{verdict}] Policy evaluation: {verdict}");
    if !result.reasons.is_empty() {
        println!("Reasons:");
        for reason in &result.reasons {
            println!("  - {reason}");
        }
    }
    if !result.blocked_commands.is_empty() {
        println!("Blocked commands: {}", result.blocked_commands.len());
    }
    if !result.blocked_paths.is_empty() {
        println!("Blocked paths: {}", result.blocked_paths.len());
    }
    if !result.breaker_violations.is_empty() {
        println!(
            "Circuit breaker violations: {}",
            result.breaker_violations.len()
        );
    }
}

fn print_pipeline_result(result: &PipelineResult) {
    println!(
        "[{}] confidence {:.2}",
        result.decision.as_str().to_uppercase(),
        result.confidence
    );
    for (name, step) in &result.step_results {
        println!(
            "  {name}: completed={} confidence={:.2} action={}",
            step.completed,
            step.confidence,
            step.action_needed.as_str()
        );
    }
    for reason in &result.block_reasons {
        println!("  - {reason}");
    }
}

fn print_fan_out_result(result: &FanOutResult) {
    println!(
        "Fan-out: {} succeeded, {} failed ({:.1}s)",
        result.success_count(),
        result.failure_count(),
        result.total_elapsed.as_secs_f64()
    );
    for task in &result.results {
        match (&task.result, &task.error) {
            (Some(res), _) => println!(
                "  {}: completed={} confidence={:.2}",
                task.task_id, res.completed, res.confidence
            ),
            (None, Some(err)) => println!("  {}: error: {err}", task.task_id),
            (None, None) => println!("  {}: no result", task.task_id),
        }
    }
}
