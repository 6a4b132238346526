//! pvp-arena command line
//!
//! - `arena run`: launch the simulation and trainers as one supervised job
//! - `arena train`: self-play against the simulation (the trainer side of a job)
//! - `arena infer`: serve actions from checkpoints
//! - `arena pool`: show the opponent pool and checkpoints on disk
//! - `arena cleanup`: terminate what a crashed job left behind

use anyhow::{Context, Result, bail};
use arena_bridge::TcpConnector;
use arena_core::{
    ArenaConfig, LinearHead, LinearPolicy, PolicyParameters, TaskKind, config::PoolConfig,
};
use arena_env::EnvironmentPool;
use arena_orchestrator::{
    ChildSpec, JobSpec, Orchestrator, OrchestratorRegistry, RestartPolicy, SupervisionPolicy,
};
use arena_selfplay::{
    CheckpointManager, OpponentPool, POOL_FILE, PolicyLearner, SelfPlayConfig, SelfPlayLoop,
    SharedOpponentPool, list_versions, read_snapshot,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "arena", version, about = "Self-play bridge and orchestrator")]
struct Cli {
    /// Arena configuration file
    #[arg(short, long, global = true, default_value = "arena.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch the simulation and trainers as one supervised job
    Run(RunArgs),
    /// Run the self-play loop against a running simulation
    Train(TrainArgs),
    /// Serve actions from checkpoints
    Infer(InferArgs),
    /// List opponent pool entries and checkpoints
    Pool,
    /// Terminate leftover processes of a job and release its ports
    Cleanup(CleanupArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Job name, used for the registry record
    #[arg(long, default_value = "pvp")]
    name: String,

    /// Simulation command line (split on whitespace)
    #[arg(long)]
    sim: String,

    /// Working directory of the simulation
    #[arg(long)]
    sim_dir: Option<PathBuf>,

    /// Trainer command line, repeatable
    #[arg(long)]
    trainer: Vec<String>,

    /// Where job records are kept
    #[arg(long, default_value = "run")]
    run_dir: PathBuf,

    /// Restarts per child before giving up; 0 disables restarts
    #[arg(long, default_value_t = 3)]
    max_restarts: u32,

    /// Initial restart backoff
    #[arg(long, default_value_t = 1_000)]
    backoff_ms: u64,

    /// Keep siblings running when a child is unrecoverable
    #[arg(long)]
    no_fail_fast: bool,

    /// Grace period between TERM and KILL
    #[arg(long, default_value_t = 5_000)]
    stop_grace_ms: u64,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum TaskArg {
    Combat,
    Skilling,
    Exploration,
    Idle,
}

impl From<TaskArg> for TaskKind {
    fn from(task: TaskArg) -> Self {
        match task {
            TaskArg::Combat => TaskKind::Combat,
            TaskArg::Skilling => TaskKind::Skilling,
            TaskArg::Exploration => TaskKind::Exploration,
            TaskArg::Idle => TaskKind::Idle,
        }
    }
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[arg(long, value_enum, default_value = "combat")]
    task: TaskArg,

    /// Seed for opponent selection and action sampling
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Stop after this many ticks
    #[arg(long)]
    max_ticks: Option<u64>,

    /// Observation size when starting without checkpoints
    #[arg(long, default_value_t = 16)]
    input_dim: usize,

    /// Choices per action head when starting without checkpoints
    #[arg(long, value_delimiter = ',', default_value = "4")]
    head_sizes: Vec<usize>,
}

#[derive(Args, Debug)]
struct InferArgs {
    /// Override the models directory
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Override the listening port
    #[arg(long)]
    port: Option<u16>,

    /// Seed for stochastic requests without one
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct CleanupArgs {
    #[arg(long, default_value = "pvp")]
    name: String,

    #[arg(long, default_value = "run")]
    run_dir: PathBuf,

    #[arg(long, default_value_t = 5_000)]
    stop_grace_ms: u64,

    /// How long to wait for the job's ports
    #[arg(long, default_value_t = 10_000)]
    port_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = ArenaConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {:?}", cli.config))?;
    config.apply_env().context("applying ARENA_* overrides")?;

    match cli.command {
        Command::Run(args) => run_job(&config, args).await,
        Command::Train(args) => train(config, args).await,
        Command::Infer(args) => infer(config, args).await,
        Command::Pool => show_pool(&config),
        Command::Cleanup(args) => cleanup(args).await,
    }
}

/// Watch channel that flips to true on Ctrl-C
fn ctrl_c_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                let _ = tx.send(true);
            }
            Err(e) => {
                warn!("Cannot listen for Ctrl-C: {}", e);
                // Keep the sender so receivers never see a closed channel
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

fn command_child(name: String, command_line: &str) -> Result<ChildSpec> {
    let mut parts = command_line.split_whitespace();
    let Some(program) = parts.next() else {
        bail!("empty command line for {}", name);
    };
    Ok(ChildSpec::new(name, program).args(parts))
}

async fn run_job(config: &ArenaConfig, args: RunArgs) -> Result<()> {
    let restart = if args.max_restarts == 0 {
        RestartPolicy::Never
    } else {
        RestartPolicy::OnFailure {
            max_restarts: args.max_restarts,
            backoff_ms: args.backoff_ms,
        }
    };

    let mut simulation = command_child("simulation".into(), &args.sim)?;
    if let Some(dir) = &args.sim_dir {
        simulation = simulation.cwd(dir);
    }
    let mut spec = JobSpec::from_config(&args.name, config)
        .child(simulation)
        .supervision(SupervisionPolicy {
            restart,
            fail_fast: !args.no_fail_fast,
        })
        .stop_grace(Duration::from_millis(args.stop_grace_ms));
    for (i, trainer) in args.trainer.iter().enumerate() {
        spec = spec.child(command_child(format!("trainer-{i}"), trainer)?);
    }

    let orchestrator = Orchestrator::new(OrchestratorRegistry::new(&args.run_dir));
    let handle = orchestrator.start(spec).await?;
    let mut completion = handle.completion();
    let mut interrupted = ctrl_c_signal();

    tokio::select! {
        _ = completion.wait_for(|done| *done) => {}
        _ = interrupted.wait_for(|stop| *stop) => handle.stop(),
    }

    let report = orchestrator.wait(handle).await?;
    for child in &report.children {
        info!(
            child = %child.name,
            exit_code = ?child.exit_code,
            restarts = child.restarts,
            stopped = child.stopped,
            "Child finished"
        );
    }
    if report.log_forward_errors > 0 {
        warn!("{} log forwarders stopped early", report.log_forward_errors);
    }
    report.into_result()?;
    Ok(())
}

fn initial_parameters(input_dim: usize, head_sizes: &[usize]) -> PolicyParameters {
    let layer = |outputs: usize| LinearHead {
        weights: vec![vec![0.0; input_dim]; outputs],
        bias: vec![0.0; outputs],
    };
    PolicyParameters {
        input_dim,
        heads: head_sizes.iter().map(|&n| layer(n)).collect(),
        value: Some(layer(1)),
    }
}

async fn train(config: ArenaConfig, args: TrainArgs) -> Result<()> {
    let checkpoint_dir = &config.checkpoint.dir;
    let opponents = SharedOpponentPool::new(OpponentPool::load_or_new(
        &checkpoint_dir.join(POOL_FILE),
        config.elo,
        config.opponents.retention,
        args.seed,
    )?);

    let mut checkpoints = CheckpointManager::new(&config.checkpoint, opponents.clone())?;
    let (params, start_step) = match checkpoints.list()?.last() {
        Some(&version) => {
            let snapshot = checkpoints.load(version)?;
            info!("Resuming from {} at step {}", version, snapshot.step);
            checkpoints = checkpoints.with_last_snapshot_step(snapshot.step);
            (snapshot.parameters, snapshot.step)
        }
        None => (initial_parameters(args.input_dim, &args.head_sizes), 0),
    };
    let num_action_heads = params.heads.len();
    let learner = PolicyLearner::new(LinearPolicy::new(params)?, args.seed, false);

    let connector = Arc::new(TcpConnector::new(
        config.ports.training_address(),
        config.session.clone(),
    ));
    let pool_config = PoolConfig {
        num_action_heads,
        ..config.pool.clone()
    };
    let env = EnvironmentPool::new(connector, &pool_config);

    let selfplay = SelfPlayConfig::from_arena(&config, args.task.into(), args.seed);
    let mut lp = SelfPlayLoop::new(env, opponents, checkpoints, learner, selfplay)
        .with_start_step(start_step);

    let summary = lp.run(ctrl_c_signal(), args.max_ticks).await?;
    info!(
        ticks = summary.ticks,
        steps = summary.steps,
        episodes = summary.episodes,
        rated_games = summary.rated_games,
        void_episodes = summary.void_episodes,
        snapshots = summary.snapshots,
        "Training finished"
    );
    Ok(())
}

async fn infer(mut config: ArenaConfig, args: InferArgs) -> Result<()> {
    if let Some(dir) = args.models_dir {
        config.inference.models_dir = dir;
    }
    if let Some(port) = args.port {
        config.ports.inference = port;
    }
    if let Some(seed) = args.seed {
        config.inference.default_seed = seed;
    }
    arena_infer::run(
        &config.inference,
        &config.ports.inference_address(),
        ctrl_c_signal(),
    )
    .await?;
    Ok(())
}

fn show_pool(config: &ArenaConfig) -> Result<()> {
    let dir = &config.checkpoint.dir;
    let pool = OpponentPool::load_or_new(
        &dir.join(POOL_FILE),
        config.elo,
        config.opponents.retention,
        0,
    )?;

    println!("agent rating: {:.1}", pool.agent_rating());
    println!("{:>8} {:>10} {:>8} {:>6}  file", "version", "step", "rating", "games");
    for entry in pool.entries() {
        println!(
            "{:>8} {:>10} {:>8.1} {:>6}  {}",
            entry.version.to_string(),
            entry.step,
            entry.rating,
            entry.games_played,
            entry.file
        );
    }

    let versions = list_versions(dir)?;
    println!("{} checkpoints in {:?}", versions.len(), dir);
    for version in versions {
        let path = dir.join(version.file_name());
        match read_snapshot(&path) {
            Ok(snapshot) => println!("  {} step {}", version, snapshot.step),
            Err(e) => println!("  {} unreadable: {}", version, e),
        }
    }
    Ok(())
}

async fn cleanup(args: CleanupArgs) -> Result<()> {
    let orchestrator = Orchestrator::new(OrchestratorRegistry::new(&args.run_dir));
    let cleaned = orchestrator
        .cleanup(
            &args.name,
            Duration::from_millis(args.stop_grace_ms),
            Duration::from_millis(args.port_timeout_ms),
        )
        .await?;
    if cleaned {
        info!("Job {} cleaned up", args.name);
    } else {
        info!("No record for job {}", args.name);
    }
    Ok(())
}
