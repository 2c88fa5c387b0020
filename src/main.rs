#![forbid(unsafe_code)]

//! `probe-session`: operator CLI for an instrumentation engine agent.
//!
//! Connects to the engine agent named in the configuration, attaches to a
//! process, performs one session operation, then detaches and releases the
//! session.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use probe_session::engine::remote::RemoteEngine;
use probe_session::models::event::SessionEvent;
use probe_session::models::peer::PeerOptions;
use probe_session::models::portal::PortalOptions;
use probe_session::models::runtime::ScriptRuntime;
use probe_session::models::snapshot_options::SnapshotOptions;
use probe_session::snapshot_manager::SnapshotManager;
use probe_session::{AppError, Cancellable, EngineConfig, Result, Session};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum GateState {
    On,
    Off,
}

#[derive(Debug, Parser)]
#[command(name = "probe-session", about = "Instrumentation session client", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Process id to attach to.
    #[arg(long)]
    pid: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Attach, print session status, and detach.
    Attach,

    /// Load a script and keep it running until interrupted or detached.
    Run {
        /// Script source file, or a compiled payload with `--compiled`.
        script: PathBuf,
        /// Treat `script` as a payload written by `compile`.
        #[arg(long)]
        compiled: bool,
        /// Snapshot file written by `snapshot` to warm-start from.
        #[arg(long, conflicts_with = "embed")]
        snapshot: Option<PathBuf>,
        /// Embed source to capture (or reuse) a cached snapshot from.
        #[arg(long)]
        embed: Option<PathBuf>,
        /// Warmup script run when capturing the `--embed` snapshot.
        #[arg(long, requires = "embed")]
        warmup: Option<PathBuf>,
        /// Script name.
        #[arg(long)]
        name: Option<String>,
        /// Runtime flavor; defaults to the configured runtime.
        #[arg(long, value_enum)]
        runtime: Option<ScriptRuntime>,
    },

    /// Compile a script to a payload usable with `run --compiled`.
    Compile {
        /// Script source file.
        script: PathBuf,
        /// Output payload file.
        #[arg(long)]
        out: PathBuf,
        /// Runtime flavor; defaults to the configured runtime.
        #[arg(long, value_enum)]
        runtime: Option<ScriptRuntime>,
    },

    /// Capture a warm-start snapshot.
    Snapshot {
        /// Embed source file.
        embed: PathBuf,
        /// Warmup script file.
        #[arg(long)]
        warmup: Option<PathBuf>,
        /// Output snapshot file.
        #[arg(long)]
        out: PathBuf,
        /// Runtime flavor; defaults to the configured runtime.
        #[arg(long, value_enum)]
        runtime: Option<ScriptRuntime>,
    },

    /// Toggle child gating.
    Gate {
        /// `on` or `off`.
        #[arg(value_enum)]
        state: GateState,
    },

    /// Resume a suspended target.
    Resume,

    /// Establish a peer-to-peer connection for the session.
    Peer {
        /// STUN server, `host:port`.
        #[arg(long)]
        stun_server: Option<String>,
    },

    /// Join a portal and stay a member until interrupted or detached.
    JoinPortal {
        /// Portal address, `host:port`.
        address: String,
        /// Authentication token.
        #[arg(long)]
        token: Option<String>,
        /// PEM certificate file to pin.
        #[arg(long)]
        certificate: Option<PathBuf>,
        /// Access-control tags.
        #[arg(long = "acl")]
        acl: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = EngineConfig::load_from_path(&args.config)?;
    info!(endpoint = config.endpoint, "configuration loaded");

    let engine = Arc::new(RemoteEngine::connect_tcp(&config.endpoint).await?);

    let attach = Cancellable::new();
    let handle = bounded(
        config.timeouts.call(),
        "attach",
        engine.attach(args.pid, &attach),
    )
    .await;
    if let Err(err) = attach.release() {
        debug!(%err, "attach cancellable already released");
    }
    let session = Session::new(engine.clone(), handle?);

    let watcher = session.on("detached", |event| {
        let SessionEvent::Detached { reason, crash } = event;
        match crash {
            Some(crash) => {
                error!(?reason, pid = crash.pid, summary = crash.summary, "target crashed");
            }
            None => info!(?reason, "session detached"),
        }
    })?;

    let outcome = execute(&config, &session, args.command).await;
    if let Err(err) = &outcome {
        error!(%err, "command failed");
    }

    if let Err(err) = session.detach_with_timeout(config.timeouts.detach()).await {
        warn!(%err, "detach did not complete cleanly");
    }
    watcher.join().await;
    if let Err(err) = session.release() {
        warn!(%err, "session release failed");
    }
    engine.shutdown();

    outcome
}

#[allow(clippy::too_many_lines)] // One arm per subcommand.
async fn execute(config: &EngineConfig, session: &Session, command: Command) -> Result<()> {
    let deadline = config.timeouts.call();

    match command {
        Command::Attach => {
            println!(
                "{} detached={}",
                session.handle(),
                session.is_detached()
            );
        }

        Command::Run {
            script,
            compiled,
            snapshot,
            embed,
            warmup,
            name,
            runtime,
        } => {
            let runtime = runtime.unwrap_or(config.default_runtime);
            let mut options = config.script_options(name.as_deref());
            options.set_runtime(runtime);

            let loaded = if let Some(embed) = embed {
                let manager = match &config.snapshot_dir {
                    Some(dir) => SnapshotManager::with_dir(dir).await?,
                    None => SnapshotManager::new(),
                };
                let embed_source = read_text(&embed).await?;
                let warmup_source = match warmup {
                    Some(path) => read_text(&path).await?,
                    None => String::new(),
                };
                let snapshot_options = SnapshotOptions::new(warmup_source, runtime);
                let snapshot = bounded(
                    deadline,
                    "snapshot",
                    manager.get_or_create(session, &embed_source, &snapshot_options),
                )
                .await?;
                options.set_snapshot(snapshot);
                load_script(session, &script, compiled, options, deadline).await?
            } else {
                if let Some(path) = snapshot {
                    options.set_snapshot(read_bytes(&path).await?);
                }
                load_script(session, &script, compiled, options, deadline).await?
            };

            info!(script = %loaded.id(), name = loaded.name(), "script loaded, waiting");
            wait_until_done(session).await?;
            loaded.release()?;
        }

        Command::Compile {
            script,
            out,
            runtime,
        } => {
            let source = read_text(&script).await?;
            let mut options = config.script_options(None);
            options.set_runtime(runtime.unwrap_or(config.default_runtime));
            let payload = bounded(
                deadline,
                "compile",
                session.compile_script(&source, Some(options)),
            )
            .await?;
            write_bytes(&out, &payload).await?;
            info!(out = %out.display(), size = payload.len(), "compiled payload written");
        }

        Command::Snapshot {
            embed,
            warmup,
            out,
            runtime,
        } => {
            let embed_source = read_text(&embed).await?;
            let warmup_source = match warmup {
                Some(path) => read_text(&path).await?,
                None => String::new(),
            };
            let options =
                SnapshotOptions::new(warmup_source, runtime.unwrap_or(config.default_runtime));
            let snapshot = bounded(
                deadline,
                "snapshot",
                session.snapshot_script(&embed_source, &options),
            )
            .await?;
            write_bytes(&out, &snapshot).await?;
            info!(out = %out.display(), size = snapshot.len(), "snapshot written");
        }

        Command::Gate { state } => match state {
            GateState::On => bounded(deadline, "gate", session.enable_child_gating()).await?,
            GateState::Off => bounded(deadline, "gate", session.disable_child_gating()).await?,
        },

        Command::Resume => bounded(deadline, "resume", session.resume()).await?,

        Command::Peer { stun_server } => {
            let mut options = PeerOptions::new();
            options.stun_server = stun_server;
            bounded(deadline, "peer", session.setup_peer_connection(&options)).await?;
        }

        Command::JoinPortal {
            address,
            token,
            certificate,
            acl,
        } => {
            let certificate = match certificate {
                Some(path) => Some(read_text(&path).await?),
                None => None,
            };
            let options = PortalOptions {
                certificate,
                token,
                acl,
            };
            let membership = bounded(
                deadline,
                "join portal",
                session.join_portal(&address, &options),
            )
            .await?;
            info!(membership = %membership.id(), address, "joined portal, waiting");
            wait_until_done(session).await?;

            let leave = Cancellable::new();
            let left = bounded(deadline, "leave portal", membership.terminate(&leave)).await;
            if let Err(err) = leave.release() {
                debug!(%err, "leave cancellable already released");
            }
            left?;
        }
    }

    Ok(())
}

async fn load_script(
    session: &Session,
    path: &Path,
    compiled: bool,
    options: probe_session::models::script_options::ScriptOptions,
    deadline: Option<Duration>,
) -> Result<probe_session::Script> {
    if compiled {
        let payload = read_bytes(path).await?;
        bounded(
            deadline,
            "create script",
            session.create_script_bytes(&payload, Some(options)),
        )
        .await
    } else {
        let source = read_text(path).await?;
        bounded(
            deadline,
            "create script",
            session.create_script_with_options(&source, Some(options)),
        )
        .await
    }
}

/// Block until ctrl-c / SIGTERM or until the session detaches on its own.
async fn wait_until_done(session: &Session) -> Result<()> {
    let mut events = session.subscribe()?;
    if session.is_detached() {
        return Ok(());
    }
    tokio::select! {
        signal = shutdown_signal() => info!(signal, "shutdown signal received"),
        _ = events.recv() => info!("session ended"),
    }
    Ok(())
}

/// Bound `fut` by `deadline` when one is configured.
async fn bounded<T, F>(deadline: Option<Duration>, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            AppError::DeadlineExceeded(format!("{what} did not complete within {limit:?}"))
        })?,
        None => fut.await,
    }
}

async fn read_text(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|err| AppError::Io(format!("cannot read {}: {err}", path.display())))
}

async fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|err| AppError::Io(format!("cannot read {}: {err}", path.display())))
}

async fn write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    tokio::fs::write(path, data)
        .await
        .map_err(|err| AppError::Io(format!("cannot write {}: {err}", path.display())))
}

/// Resolve with the name of the first termination signal delivered.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                result = tokio::signal::ctrl_c() => interrupt(result),
                _ = sigterm.recv() => "SIGTERM",
            },
            Err(err) => {
                warn!(%err, "SIGTERM handler unavailable, waiting for ctrl-c");
                interrupt(tokio::signal::ctrl_c().await)
            }
        }
    }

    #[cfg(not(unix))]
    {
        interrupt(tokio::signal::ctrl_c().await)
    }
}

fn interrupt(result: std::io::Result<()>) -> &'static str {
    if let Err(err) = result {
        error!(%err, "ctrl-c handler failed, treating as interrupt");
    }
    "ctrl-c"
}

/// Logs go to stderr; stdout carries command output such as `attach`.
fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("probe_session=info,warn"));
    let builder = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    let installed = match log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| AppError::Config(format!("cannot install log subscriber: {err}")))
}
