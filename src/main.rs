use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ssmprov::envconfig::expand_home;
use ssmprov::format::human_bytes;
use ssmprov::{CheckpointStore, NgramModel, RunnerConfig, Server, Session, SessionHandle};

#[derive(Parser)]
#[command(name = "ssmprov")]
#[command(version)]
#[command(about = "Stateful model runner with named, swappable checkpoints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    runner: RunnerArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve requests on the TCP port (the default)
    Serve,
    /// List the checkpoints in the store
    #[command(alias = "ls")]
    List,
}

/// Flags override the `SSMPROV_*` environment.
#[derive(Args)]
struct RunnerArgs {
    #[arg(long, global = true)]
    host: Option<String>,

    #[arg(short, long, global = true)]
    port: Option<u16>,

    #[arg(long, global = true)]
    checkpoints: Option<String>,

    #[arg(long, global = true)]
    max_tokens: Option<usize>,

    #[arg(long, global = true)]
    max_seconds: Option<u64>,

    #[arg(long, global = true)]
    max_frame: Option<usize>,

    #[arg(long, global = true)]
    keep_alive: bool,

    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Text file the n-gram backend is built from
    #[arg(long, global = true)]
    corpus: Option<PathBuf>,

    #[arg(long, global = true)]
    order: Option<usize>,
}

impl RunnerArgs {
    fn apply(self, config: &mut RunnerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(dir) = self.checkpoints {
            config.checkpoints_dir = expand_home(&dir);
        }
        if let Some(n) = self.max_tokens {
            config.max_tokens = n;
        }
        if let Some(secs) = self.max_seconds {
            config.max_time = Duration::from_secs(secs);
        }
        if let Some(n) = self.max_frame {
            config.max_frame_bytes = n;
        }
        if self.keep_alive {
            config.keep_alive = true;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if self.corpus.is_some() {
            config.corpus = self.corpus;
        }
        if let Some(order) = self.order {
            config.ngram_order = order;
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ssmprov=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = RunnerConfig::from_env();
    cli.runner.apply(&mut config);

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::List => list(&config),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn serve(config: RunnerConfig) -> Result<()> {
    if config.ngram_order < 2 {
        anyhow::bail!("--order must be at least 2, got {}", config.ngram_order);
    }

    let model = match &config.corpus {
        Some(path) => NgramModel::from_file(path, config.ngram_order)
            .with_context(|| format!("failed to build model from {}", path.display()))?,
        None => NgramModel::bundled(config.ngram_order),
    };
    let store = CheckpointStore::open(&config.checkpoints_dir)
        .with_context(|| format!("failed to open checkpoint store {}", config.checkpoints_dir.display()))?;
    tracing::info!(
        "checkpoints in {}, n-gram order {}, {} tokens / {:?} per turn",
        store.root().display(),
        config.ngram_order,
        config.max_tokens,
        config.max_time
    );

    let session = Session::new(model, store, config.turn_limits(), config.seed);
    let (handle, _worker) = SessionHandle::spawn(session).context("failed to start session worker")?;

    let server = Server::bind(&config.addr(), handle, config.connection_options())
        .await
        .with_context(|| format!("failed to bind {}", config.addr()))?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

fn list(config: &RunnerConfig) -> Result<()> {
    let store = CheckpointStore::open(&config.checkpoints_dir)?;
    let entries = store.list()?;
    if entries.is_empty() {
        println!("no checkpoints in {}", store.root().display());
        return Ok(());
    }

    println!("{:<32} {:>10} {:>10}", "NAME", "STATE", "SETTINGS");
    for entry in entries {
        let size = |s: Option<u64>| s.map(human_bytes).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32} {:>10} {:>10}",
            entry.name,
            size(entry.state_size),
            size(entry.settings_size)
        );
    }
    Ok(())
}
