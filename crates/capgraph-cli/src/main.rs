//! CLI binary for validating, measuring, and running capability graphs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use capgraph_engine::{
    calculate_metrics, to_mermaid, validate, validate_skills, AutoApprovePresenter,
    CapabilityGraph, ConsolePresenter, ExecutionStatus, Executor, ExecutorConfig, IoType,
    Presenter, Severity, SimulatedSkillRepository, SkillInfo, SkillRepository,
    StaticSkillRepository, ValidationReport,
};
use capgraph_types::{ExecutionContext, PreferredDepth};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "capgraph", version, about = "Capability graph validator and runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a capability graph document
    Validate {
        /// Path to the graph .json file
        graph: PathBuf,

        /// Skill catalog to resolve skill ids and IO types against
        #[arg(long)]
        skills: Option<PathBuf>,
    },

    /// Show information about a capability graph
    Info {
        /// Path to the graph .json file
        graph: PathBuf,
    },

    /// Print complexity metrics
    Metrics {
        /// Path to the graph .json file
        graph: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a Mermaid diagram of the graph
    Diagram {
        /// Path to the graph .json file
        graph: PathBuf,
    },

    /// Execute a capability graph
    Run {
        /// Path to the graph .json file
        graph: PathBuf,

        /// Initial variables as a JSON object
        #[arg(long)]
        vars: Option<String>,

        /// What the user wants the capability to achieve
        #[arg(long, default_value = "")]
        intent: String,

        /// Preferred depth: quick, balanced or thorough
        #[arg(long, default_value = "balanced")]
        depth: String,

        /// Answer every interaction with its default instead of prompting
        #[arg(long)]
        auto_approve: bool,

        /// Skill catalog with canned responses (default: simulate every skill)
        #[arg(long)]
        skills: Option<PathBuf>,

        /// Maximum number of node dispatches before aborting. Prevents runaway cycles.
        #[arg(long, default_value = "1000")]
        max_node_visits: usize,

        /// Print the full execution result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { graph, skills } => {
            cmd_validate(&graph, skills.as_deref()).await?;
        }
        Commands::Info { graph } => {
            cmd_info(&graph)?;
        }
        Commands::Metrics { graph, json } => {
            cmd_metrics(&graph, json)?;
        }
        Commands::Diagram { graph } => {
            let graph = load_graph(&graph)?;
            println!("{}", to_mermaid(&graph));
        }
        Commands::Run {
            graph,
            vars,
            intent,
            depth,
            auto_approve,
            skills,
            max_node_visits,
            json,
        } => {
            let options = RunOptions {
                vars,
                intent,
                depth,
                auto_approve,
                skills,
                max_node_visits,
                json,
            };
            cmd_run(&graph, options).await?;
        }
    }

    Ok(())
}

fn load_graph(path: &Path) -> anyhow::Result<CapabilityGraph> {
    CapabilityGraph::load(path).with_context(|| format!("failed to load graph {}", path.display()))
}

/// One entry of a skill catalog file.
#[derive(Deserialize)]
struct CatalogEntry {
    id: String,
    #[serde(default)]
    input_type: Option<IoType>,
    #[serde(default)]
    output_type: Option<IoType>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    response: Value,
}

fn load_catalog(path: &Path) -> anyhow::Result<StaticSkillRepository> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read skill catalog {}", path.display()))?;
    let entries: Vec<CatalogEntry> = serde_json::from_str(&source)?;
    let repo = entries.into_iter().fold(StaticSkillRepository::new(), |repo, entry| {
        let info = SkillInfo {
            id: entry.id,
            input_type: entry.input_type,
            output_type: entry.output_type,
            capabilities: entry.capabilities,
        };
        repo.with_skill(info, entry.response)
    });
    Ok(repo)
}

fn print_report(report: &ValidationReport) {
    for diag in &report.diagnostics {
        let severity = match diag.severity {
            Severity::Error => "ERROR",
            Severity::Warning => "WARN",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
        if let Some(fix) = &diag.fix {
            println!("        fix: {fix}");
        }
    }
}

async fn cmd_validate(path: &Path, skills: Option<&Path>) -> anyhow::Result<()> {
    let graph = load_graph(path)?;
    let mut report = validate(&graph);

    if let Some(catalog) = skills {
        let repo = load_catalog(catalog)?;
        let skill_report = validate_skills(&graph, &repo).await;
        let mut diagnostics = report.diagnostics;
        diagnostics.extend(skill_report.diagnostics);
        report = ValidationReport::from_diagnostics(diagnostics);
    }

    print_report(&report);
    if !report.valid {
        std::process::exit(1);
    }
    println!("Graph is valid");
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let graph = load_graph(path)?;

    println!("Graph: {} (v{})", graph.id, graph.version);
    if !graph.name.is_empty() {
        println!("Name: {}", graph.name);
    }
    if !graph.description.is_empty() {
        println!("Description: {}", graph.description);
    }
    println!("Nodes: {}", graph.nodes().len());
    println!("Edges: {}", graph.edges().len());
    println!("Fallback strategy: {:?}", graph.fallback_strategy);
    println!("Max retries: {}", graph.max_retries);

    if let Some(start) = graph.start_node() {
        println!("Start: {}", start.id);
    }
    let ends: Vec<&str> = graph.end_nodes().map(|n| n.id.as_str()).collect();
    println!("End: {}", ends.join(", "));

    println!("\nNodes:");
    for node in graph.nodes() {
        match &node.skill_id {
            Some(skill) => println!("  {} [{}] skill={}", node.id, node.node_type, skill),
            None => println!("  {} [{}]", node.id, node.node_type),
        }
    }

    let paths = graph.all_paths();
    println!("\nPaths ({}):", paths.len());
    for path in paths {
        println!("  {}", path.join(" -> "));
    }

    Ok(())
}

fn cmd_metrics(path: &Path, json: bool) -> anyhow::Result<()> {
    let graph = load_graph(path)?;
    let metrics = calculate_metrics(&graph);

    if json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
        return Ok(());
    }

    println!("Nodes: {}", metrics.node_count);
    println!("Edges: {}", metrics.edge_count);
    println!("Cyclomatic complexity: {}", metrics.cyclomatic_complexity);
    println!("Max depth: {}", metrics.max_depth);
    println!("Branch factor: {:.2}", metrics.branch_factor);
    println!("Max iterations: {}", metrics.max_iterations);
    println!("Interactions: {}", metrics.interaction_count);
    println!("Parallel branches: {}", metrics.parallel_branches);
    println!(
        "Complexity: {} ({:?})",
        metrics.complexity_score, metrics.complexity_level
    );
    Ok(())
}

struct RunOptions {
    vars: Option<String>,
    intent: String,
    depth: String,
    auto_approve: bool,
    skills: Option<PathBuf>,
    max_node_visits: usize,
    json: bool,
}

async fn cmd_run(path: &Path, options: RunOptions) -> anyhow::Result<()> {
    let graph = load_graph(path)?;

    let variables: HashMap<String, Value> = match &options.vars {
        Some(raw) => serde_json::from_str(raw).context("--vars must be a JSON object")?,
        None => HashMap::new(),
    };
    let depth: PreferredDepth = serde_json::from_value(Value::String(options.depth.clone()))
        .with_context(|| format!("unknown depth '{}'", options.depth))?;
    let context = ExecutionContext::new(options.intent)
        .with_variables(variables)
        .with_preferred_depth(depth);

    let skills: Arc<dyn SkillRepository> = match &options.skills {
        Some(catalog) => Arc::new(load_catalog(catalog)?),
        None => Arc::new(SimulatedSkillRepository::new()),
    };
    let presenter: Arc<dyn Presenter> = if options.auto_approve {
        Arc::new(AutoApprovePresenter)
    } else {
        Arc::new(ConsolePresenter)
    };
    let config = ExecutorConfig {
        max_node_visits: options.max_node_visits,
        ..ExecutorConfig::default()
    };
    let executor = Executor::new(skills, presenter).with_config(config);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    if !options.json {
        println!("Running graph: {}", graph.id);
    }
    let result = executor
        .execute_with_cancellation(&graph, context, cancel)
        .await?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("\nStatus: {:?}", result.status);
        println!("Path: {}", result.path.join(" -> "));
        println!(
            "Executed: {}  Failed: {}  Skipped: {}  Retries: {}  Iterations: {}",
            result.metrics.nodes_executed,
            result.metrics.nodes_failed,
            result.metrics.nodes_skipped,
            result.metrics.retries,
            result.metrics.iterations
        );
        println!("Duration: {}ms", result.metrics.total_duration_ms);
        if let Some(failure) = &result.failure {
            println!("Failed at {}: {}", failure.node_id, failure.error);
        }
        for problem in &result.condition_failures {
            println!(
                "Condition '{}' on {} evaluated to false: {}",
                problem.expression, problem.node_id, problem.message
            );
        }
    }

    if result.status != ExecutionStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}
