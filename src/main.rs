use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backend_controller::admission::{ResourceScheduler, Unbounded};
use backend_controller::config::{CheckpointBackend, Config, DEFAULT_CHECKPOINT_KEY};
use backend_controller::controller::{BackendController, ControllerHandle, ControllerSnapshot};
use backend_controller::metrics;
use backend_controller::notifications::LongPollHost;
use backend_controller::runtime::{LocalRuntime, LocalRuntimeConfig};
use backend_controller::storage::{checkpoint, FileKvStore, KvStore, MemoryKvStore};

#[derive(Parser)]
#[command(
    name = "backendctl",
    version,
    about = "Replica orchestration controller with checkpointed recovery",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller against the in-process runtime
    Run {
        /// Config file (falls back to BACKENDCTL_* environment variables)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Stop after this many ticks instead of waiting for Ctrl-C
        #[arg(long)]
        ticks: Option<u64>,

        /// Force-delete every backend and clear the checkpoint on exit
        #[arg(long, default_value = "false")]
        teardown: bool,

        /// Print Prometheus metrics on exit
        #[arg(long, default_value = "false")]
        print_metrics: bool,
    },

    /// Print a summary of a checkpoint written by the file backend
    Inspect {
        /// Checkpoint directory
        #[arg(short, long)]
        dir: PathBuf,

        /// Checkpoint key
        #[arg(short, long, default_value = DEFAULT_CHECKPOINT_KEY)]
        key: String,

        /// Print the full snapshot as JSON
        #[arg(long, default_value = "false")]
        full: bool,
    },

    /// Validate a config file
    CheckConfig {
        /// Config file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(&cli.log_format, cli.verbose)?;

    match cli.command {
        Commands::Run {
            config,
            ticks,
            teardown,
            print_metrics,
        } => {
            tracing::info!(config = ?config, ticks = ?ticks, teardown, "Starting run command");
            run(config.as_deref(), ticks, teardown, print_metrics).await?;
        }

        Commands::Inspect { dir, key, full } => {
            inspect(&dir, &key, full)?;
        }

        Commands::CheckConfig { config } => {
            let loaded = Config::from_file(&config)?;
            println!(
                "{}: ok ({} backends, {} nodes)",
                config.display(),
                loaded.backends.len(),
                loaded.cluster.nodes.len()
            );
        }
    }

    Ok(())
}

/// Setup tracing subscriber
fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("backend_controller=debug,backendctl=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("backend_controller=info,backendctl=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<Arc<dyn KvStore>> {
    Ok(match config.checkpoint.backend {
        CheckpointBackend::Memory => Arc::new(MemoryKvStore::new()),
        CheckpointBackend::File => Arc::new(
            FileKvStore::new(&config.checkpoint.dir).with_context(|| {
                format!("Failed to open checkpoint dir {}", config.checkpoint.dir.display())
            })?,
        ),
    })
}

async fn run(
    config_path: Option<&Path>,
    ticks: Option<u64>,
    teardown: bool,
    print_metrics: bool,
) -> Result<()> {
    let config = match config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed");
    }

    let scheduler: Arc<dyn ResourceScheduler> = if config.cluster.nodes.is_empty() {
        Arc::new(Unbounded)
    } else {
        Arc::new(config.cluster.to_resources())
    };
    let controller = BackendController::new(
        config.controller.clone(),
        Arc::new(LocalRuntime::new(LocalRuntimeConfig::automatic())),
        scheduler,
        open_store(&config)?,
        Arc::new(LongPollHost::new()),
    )?;
    let handle = ControllerHandle::new(controller);

    for backend in &config.backends {
        match handle
            .create_backend(&backend.tag, backend.config.clone(), backend.replica.clone())
            .await?
        {
            Some(goal) => tracing::info!(backend = %backend.tag, goal = %goal, "Backend installed"),
            None => tracing::info!(backend = %backend.tag, "Backend already up to date"),
        }
    }

    let interval = config.controller.tick_interval();
    match ticks {
        Some(n) => {
            for _ in 0..n {
                handle.update().await?;
                tokio::time::sleep(interval).await;
            }
        }
        None => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let control = handle.spawn_control_loop(interval, shutdown_rx);
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            tracing::info!("Interrupt received, stopping control loop");
            shutdown_tx.send(true).ok();
            let ticks_run = control.await.context("Control loop panicked")??;
            tracing::info!(ticks = ticks_run, "Control loop finished");
        }
    }

    let snapshot = handle.with(BackendController::snapshot).await;
    print_summary(&snapshot);

    if teardown {
        handle.shutdown(interval).await?;
        println!("All backends torn down");
    }

    if print_metrics {
        match metrics::encode_metrics() {
            Ok(text) => println!("{text}"),
            Err(e) => tracing::warn!(error = %e, "Failed to encode metrics"),
        }
    }

    Ok(())
}

fn inspect(dir: &Path, key: &str, full: bool) -> Result<()> {
    let store = FileKvStore::new(dir)?;
    let Some(loaded) = checkpoint::load::<ControllerSnapshot>(&store, key)? else {
        println!("No checkpoint '{key}' in {}", dir.display());
        return Ok(());
    };

    println!("Checkpoint written by '{}' at {}", loaded.controller, loaded.written_at);
    println!("Digest: {}", loaded.digest);
    if full {
        println!("{}", serde_json::to_string_pretty(&loaded.state)?);
    } else {
        print_summary(&loaded.state);
    }
    Ok(())
}

fn print_summary(snapshot: &ControllerSnapshot) {
    println!("Backends: {}", snapshot.backends.len());
    for (tag, info) in &snapshot.backends {
        let target = snapshot.targets.get(tag).copied().unwrap_or(0);
        let replicas = snapshot.replicas.get(tag).map_or(0, Vec::len);
        println!(
            "  {tag}: target={target} replicas={replicas} entrypoint={}",
            info.replica_config.entrypoint
        );
    }
    println!("Replicas: {}", snapshot.replica_count());
    for (state, count) in snapshot.count_by_state() {
        println!("  {state}: {count}");
    }
    println!("Pending goals: {}", snapshot.pending_goals.len());
}
