use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dispatchcore::{
    DispatchEvent, ExecContextState, FunctionRef, GraphId, PipelineTemplate, ProcessDefinition,
    ProcessGraphTemplate, SubProcessLogic, Task, TaskState, Value,
};
use dispatchruntime::{ExecResult, FunctionRegistry, Orchestrator, PollRequest, RuntimeConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "dispatch")]
#[command(about = "Pipeline dispatcher CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline against simulated processors
    Run {
        /// Path to pipeline JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Runtime configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Input variables as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Number of simulated processors
        #[arg(short, long, default_value_t = 2)]
        processors: usize,

        /// Probability that a simulated task fails (recoverably)
        #[arg(long, default_value_t = 0.0)]
        fail_rate: f64,

        /// Print the final graph in Graphviz format
        #[arg(long)]
        dot: bool,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a pipeline file
    Validate {
        /// Path to pipeline JSON file
        file: PathBuf,
    },

    /// List built-in internal functions
    Functions,

    /// Create an example pipeline
    Init {
        /// Output file path
        #[arg(short, long, default_value = "pipeline.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            config,
            input,
            processors,
            fail_rate,
            dot,
            verbose,
        } => {
            let level = if verbose { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
                .init();

            run_pipeline(file, config, input, processors, fail_rate, dot).await?;
        }

        Commands::Validate { file } => {
            validate_pipeline(&file)?;
        }

        Commands::Functions => {
            list_functions();
        }

        Commands::Init { output } => {
            create_example_pipeline(output)?;
        }
    }

    Ok(())
}

fn registry() -> Arc<FunctionRegistry> {
    let registry = Arc::new(FunctionRegistry::new());
    dispatchfunctions::register_all(&registry);
    registry
}

fn load_template(file: &Path) -> Result<PipelineTemplate> {
    let json = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    Ok(PipelineTemplate::from_json(&json)?)
}

fn parse_inputs(input: Option<String>) -> Result<Vec<(String, Value)>> {
    let Some(input) = input else {
        return Ok(Vec::new());
    };
    match serde_json::from_str::<serde_json::Value>(&input)? {
        serde_json::Value::Object(obj) => Ok(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        _ => Err(anyhow::anyhow!("Input must be a JSON object")),
    }
}

async fn run_pipeline(
    file: PathBuf,
    config: Option<PathBuf>,
    input: Option<String>,
    processors: usize,
    fail_rate: f64,
    dot: bool,
) -> Result<()> {
    println!("🚀 Loading pipeline from: {}", file.display());
    let template = load_template(&file)?;
    println!("📋 Pipeline: {}", template.code);
    println!("   Processes: {}", template.processes.len());
    println!("   Processors: {}", processors);
    println!();

    let config = match config {
        Some(path) => RuntimeConfig::load(&path)?,
        None => RuntimeConfig::default(),
    };
    let orch = Arc::new(Orchestrator::with_registry(registry(), config));

    let mut events = orch.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DispatchEvent::ExecContextCreated { graph_id, tasks, .. } => {
                    println!("▶️  Run #{} started with {} tasks", graph_id, tasks);
                }
                DispatchEvent::TaskAssigned { task_id, processor_id, core_id, .. } => {
                    println!("  ⚡ Task #{} -> processor {} core {}", task_id, processor_id, core_id);
                }
                DispatchEvent::TaskFinished { task_id, state, .. } => match state {
                    TaskState::Ok => println!("  ✅ Task #{} done", task_id),
                    TaskState::Skipped => println!("  ⏭️  Task #{} skipped", task_id),
                    other => println!("  ❌ Task #{} finished as {}", task_id, other),
                },
                DispatchEvent::SubProcessesExpanded { parent_task_id, task_ids, .. } => {
                    println!("  🌱 Task #{} expanded into {} tasks", parent_task_id, task_ids.len());
                }
                DispatchEvent::TasksRecovered { task_ids, .. } => {
                    println!("  🔁 Retrying {} tasks", task_ids.len());
                }
                DispatchEvent::TasksReleased { task_ids, .. } => {
                    println!("  ⏳ Re-queued {} in-flight tasks", task_ids.len());
                }
                DispatchEvent::ExecContextFinished { graph_id, .. } => {
                    println!("✨ Run #{} finished", graph_id);
                }
                _ => {}
            }
        }
    });

    let started = Instant::now();
    let graph_id = orch.create_exec_context(template, parse_inputs(input)?).await?;

    let workers: Vec<_> = (0..processors.max(1))
        .map(|_| {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { simulate_processor(orch, graph_id, fail_rate).await })
        })
        .collect();

    while orch.exec_context_state(graph_id)? != ExecContextState::Finished {
        orch.recoverable_reset(graph_id).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    for result in futures::future::join_all(workers).await {
        result??;
    }

    // Let the event printer catch up
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();

    print_summary(&orch, graph_id, started.elapsed())?;
    if dot {
        println!();
        print!("{}", orch.to_dot(graph_id)?);
    }
    Ok(())
}

/// Polls until the run finishes, completing every assigned task.
async fn simulate_processor(orch: Arc<Orchestrator>, graph_id: GraphId, fail_rate: f64) -> Result<()> {
    let processor_id = Uuid::new_v4();
    let request = PollRequest {
        processor_id,
        cores: vec![0, 1],
        quota: 4,
    };
    while orch.exec_context_state(graph_id)? != ExecContextState::Finished {
        let outcome = orch.poll(request.clone()).await?;
        if outcome.assigned.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
            continue;
        }
        tracing::debug!("Processor {} received {} tasks", processor_id, outcome.assigned.len());
        for assigned in outcome.assigned {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let result = simulate(&assigned.task, fail_rate);
            orch.report_task_result(assigned.task.id, result).await?;
        }
    }
    Ok(())
}

fn simulate(task: &Task, fail_rate: f64) -> ExecResult {
    if rand::random::<f64>() < fail_rate {
        return ExecResult::failed(format!("simulated failure of {}", task.process_code), true);
    }
    task.outputs.iter().fold(ExecResult::ok("simulated"), |result, output| {
        result.with_output(output.name.clone(), format!("{}#{}", task.process_code, task.id))
    })
}

fn print_summary(orch: &Orchestrator, graph_id: GraphId, elapsed: Duration) -> Result<()> {
    let tasks = orch.tasks(graph_id)?;
    let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
    for task in &tasks {
        *by_state.entry(task.state.to_string()).or_default() += 1;
    }

    println!();
    println!("📊 Run Summary:");
    println!("   Run ID: {}", graph_id);
    println!("   Duration: {}ms", elapsed.as_millis());
    println!("   Tasks: {}", tasks.len());
    for (state, count) in &by_state {
        println!("     {}: {}", state, count);
    }

    let failed: Vec<&Task> = tasks.iter().filter(|t| t.state == TaskState::Error).collect();
    if !failed.is_empty() {
        println!();
        println!("💥 Failures:");
        for task in failed {
            println!("   #{} {}: {}", task.id, task.process_code, task.console.as_deref().unwrap_or(""));
        }
    }
    Ok(())
}

fn validate_pipeline(file: &Path) -> Result<()> {
    println!("🔍 Validating pipeline: {}", file.display());

    let template = ProcessGraphTemplate::compile(load_template(file)?)?;
    let registry = registry();
    if let Err(missing) = template.check_functions(|code| registry.contains(code)) {
        return Err(anyhow::anyhow!("Unknown internal functions: {}", missing.join(", ")));
    }

    println!("✅ Pipeline is valid:");
    println!("   Code: {}", template.code());
    for process in template.processes() {
        println!("   • {} [{}] {}", process.code, process.process_context_id, process.function.code);
    }
    Ok(())
}

fn list_functions() {
    println!("📦 Internal Functions:");
    println!();

    let registry = registry();
    for code in registry.codes() {
        println!("  • {}", code);
        if let Some(description) = registry.describe(&code) {
            println!("    {}", description);
        }
    }
}

fn create_example_pipeline(output: PathBuf) -> Result<()> {
    let template = PipelineTemplate::new("example-batch")
        .with_process(
            ProcessDefinition::new("split-items", FunctionRef::internal("pipeline.split"))
                .with_inputs(["items"])
                .with_meta("output-variable", "item")
                .with_sub_processes(
                    SubProcessLogic::Sequential,
                    vec![ProcessDefinition::new("process-item", FunctionRef::external("worker.process"))
                        .with_inputs(["item"])
                        .with_outputs(["processed"])],
                ),
        )
        .with_process(
            ProcessDefinition::new("collect", FunctionRef::internal("pipeline.aggregate"))
                .with_meta("variable", "processed")
                .with_outputs(["results"]),
        )
        .with_process(
            ProcessDefinition::new("report", FunctionRef::external("worker.report")).with_inputs(["results"]),
        );

    let json = serde_json::to_string_pretty(&template)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example pipeline: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  dispatch run --file {} --input '{{\"items\": [\"a\", \"b\", \"c\"]}}'",
        output.display()
    );

    Ok(())
}
