use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ggd_config::Config;
use ggd_core::dispatcher::server::{self, ServerSettings};
use ggd_core::{agent, callback_channel, init_logging, Dispatcher, DockerCliRuntime, GracefulShutdown};
use ggd_types::{DebugMode, JobRequest, Limits};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ggd", about = "GradeGrid - sandboxed grading job dispatcher", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept agents and dispatch jobs to them
    Dispatcher,
    /// Run grading containers for a dispatcher
    Agent,
    /// Run a dispatcher, wait for an agent, grade one submission and print the result
    Grade {
        #[arg(long)]
        course: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        environment: String,
        /// JSON file with the submission input
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long, default_value_t = 200)]
        memory_mb: u64,
        #[arg(long, default_value_t = 30)]
        time_s: u64,
        #[arg(long)]
        hard_time_s: Option<u64>,
        /// Attach the grader's stderr to the result
        #[arg(long)]
        debug: bool,
        /// How long to wait for an agent offering the environment
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load().context("Failed to load configuration")?;
    init_logging(
        &config.log_level,
        config.log_file.as_deref(),
        config.log_structured,
    );
    config
        .create_directories()
        .context("Failed to create working directories")?;

    // The agent is a single-threaded event loop; blocking work goes to its worker pool.
    let runtime = match cli.command {
        Commands::Agent => tokio::runtime::Builder::new_current_thread(),
        _ => tokio::runtime::Builder::new_multi_thread(),
    }
    .enable_all()
    .build()
    .context("Failed to build the async runtime")?;

    runtime.block_on(run(cli.command, config))
}

async fn run(command: Commands, config: Config) -> anyhow::Result<()> {
    match command {
        Commands::Dispatcher => run_dispatcher(config).await?,
        Commands::Agent => run_agent(config).await?,
        Commands::Grade {
            course,
            task,
            environment,
            input,
            memory_mb,
            time_s,
            hard_time_s,
            debug,
            wait_secs,
        } => {
            let input = match input {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    serde_json::from_str(&raw).context("Submission input is not valid JSON")?
                }
                None => serde_json::json!({}),
            };
            let request = JobRequest::new(course, task, environment)
                .with_input(input)
                .with_limits(Limits::new(memory_mb, time_s, hard_time_s))
                .with_debug(if debug { DebugMode::Debug } else { DebugMode::Off });
            grade_once(config, request, Duration::from_secs(wait_secs)).await?;
        }
    }
    Ok(())
}

async fn start_dispatcher(
    config: &Config,
    shutdown: Arc<GracefulShutdown>,
) -> anyhow::Result<(Dispatcher, tokio::task::JoinHandle<ggd_types::Result<()>>)> {
    let listener = server::bind(&config.dispatcher_bind).await?;
    let dispatcher = Dispatcher::new();
    let task = tokio::spawn(server::serve(
        listener,
        dispatcher.clone(),
        ServerSettings::from_config(config),
        shutdown,
    ));
    Ok((dispatcher, task))
}

async fn run_dispatcher(config: Config) -> anyhow::Result<()> {
    info!(bind = %config.dispatcher_bind, "GradeGrid dispatcher starting");
    let shutdown = Arc::new(GracefulShutdown::new());
    let (dispatcher, task) = start_dispatcher(&config, shutdown.clone()).await?;

    dispatcher
        .set_ssh_hook(Arc::new(|info| {
            info!(
                job_id = %info.job_id,
                host = %info.host,
                port = info.port,
                user = %info.user,
                "Debug session available"
            );
        }))
        .await;

    shutdown.wait_for_signal().await;
    task.await.context("Dispatcher listener panicked")??;
    info!("GradeGrid dispatcher stopped");
    Ok(())
}

async fn run_agent(config: Config) -> anyhow::Result<()> {
    info!(
        name = %config.agent_name,
        dispatcher = %config.agent_connect,
        slots = config.agent_slots,
        "GradeGrid agent starting"
    );
    let runtime = DockerCliRuntime::new(&config.docker_bin, &config.environment_label);
    if !runtime.is_available().await {
        bail!(
            "Container runtime not available: `{} version` failed",
            config.docker_bin
        );
    }

    let shutdown = Arc::new(GracefulShutdown::new());
    let signals = shutdown.clone();
    tokio::spawn(async move { signals.wait_for_signal().await });

    agent::serve(config, Arc::new(runtime), shutdown).await?;
    info!("GradeGrid agent stopped");
    Ok(())
}

async fn grade_once(config: Config, request: JobRequest, wait: Duration) -> anyhow::Result<()> {
    let shutdown = Arc::new(GracefulShutdown::new());
    let (dispatcher, task) = start_dispatcher(&config, shutdown.clone()).await?;

    let environment = request.environment.clone();
    let deadline = tokio::time::Instant::now() + wait;
    while dispatcher.agent_count_for(&environment).await == 0 {
        if tokio::time::Instant::now() >= deadline {
            shutdown.request_shutdown();
            bail!("No agent offering environment {environment} connected within {wait:?}");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let (callback, rx) = callback_channel();
    let job_id = dispatcher.submit(request, callback).await?;
    info!(job_id = %job_id, "Submission queued");

    let result = tokio::select! {
        result = rx => result.context("Job was dropped without a result")?,
        _ = tokio::signal::ctrl_c() => {
            dispatcher.kill(&job_id).await;
            shutdown.request_shutdown();
            bail!("Interrupted");
        }
    };
    println!("{}", serde_json::to_string_pretty(&result)?);

    shutdown.request_shutdown();
    if let Err(e) = task.await {
        error!(error = %e, "Dispatcher listener panicked");
    }
    Ok(())
}
