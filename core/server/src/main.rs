//! engine-host-server entrypoint.
//!
//! Hosts the engine out of process for a single client application. The
//! process exits on `System.Shutdown`, or once no client has been connected
//! for the idle grace period. An idle exit is confirmed with the crash
//! reporter's watchdog first so it is not mistaken for a crash.

use chrono::Utc;
use clap::error::ErrorKind;
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod connections;
mod crash;
mod diagnostic;
mod engine;
mod handshake;
mod idle;
mod reporter;
mod supervisor;
mod transport;

use commands::{system_collection, CommandRegistry, SystemContext};
use crash::{fatal_handler, CrashHandoffCoordinator};
use engine::{Engine, FatalHandler, HeadlessEngine};
use handshake::ShutdownHandshake;
use supervisor::LifecycleSupervisor;
use transport::{ConnectionHooks, LocalTransport};

const EXIT_USAGE: i32 = 1;
const EXIT_TRANSPORT: i32 = 2;
const EXIT_CRASH_REPORTER: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "engine-host-server")]
#[command(about = "Out-of-process engine host")]
#[command(version)]
struct Cli {
    /// Unix socket path the command transport listens on
    #[arg(value_name = "ENDPOINT", allow_hyphen_values = true)]
    endpoint: PathBuf,
}

fn main() {
    init_logging();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    let started_at = Utc::now();

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            config::HostConfig::default()
        }
    };

    let coordinator = match CrashHandoffCoordinator::start(&config.crash_reporter) {
        Ok(coordinator) => coordinator.map(Arc::new),
        Err(err) => {
            error!(error = %err, "Failed to start crash reporting");
            std::process::exit(EXIT_CRASH_REPORTER);
        }
    };
    if let Some(coordinator) = &coordinator {
        let context = coordinator.context();
        info!(
            handler = %context.handler.display(),
            database = %context.database.display(),
            "Crash reporting enabled"
        );
    }
    let crash_reporting = coordinator.is_some();
    let on_fatal = fatal_handler(coordinator);
    install_panic_hook(Arc::clone(&on_fatal));

    let supervisor = Arc::new(LifecycleSupervisor::from_config(&config.lifecycle));
    let handshake = ShutdownHandshake::from_config(&config.handshake);

    let engine = Arc::new(HeadlessEngine::new());
    engine.set_fatal_handler(on_fatal);

    let mut registry = CommandRegistry::new();
    registry.register_collection(system_collection(SystemContext {
        supervisor: Arc::clone(&supervisor),
        engine: Arc::clone(&engine),
        crash_reporting,
        allow_induced_fault: config.crash_reporter.allow_induced_fault,
        started_at,
    }));
    info!(commands = ?registry.command_names(), "Commands registered");
    let registry = Arc::new(registry);

    let transport = match LocalTransport::bind(&cli.endpoint) {
        Ok(transport) => transport,
        Err(err) => {
            error!(error = %err, path = %cli.endpoint.display(), "Failed to initialize transport");
            std::process::exit(EXIT_TRANSPORT);
        }
    };
    let hooks: Arc<dyn ConnectionHooks> = supervisor.clone();
    if let Err(err) = transport.serve(hooks, registry) {
        error!(error = %err, "Failed to start transport");
        transport.finalize();
        std::process::exit(EXIT_TRANSPORT);
    }

    supervisor.enter_running(Instant::now());
    info!(
        endpoint = %cli.endpoint.display(),
        pid = std::process::id(),
        crash_reporting,
        rendezvous = %handshake.socket_path().display(),
        "Engine host started"
    );

    let decision = supervisor.run_until_shutdown();
    let engine_ref: &dyn Engine = engine.as_ref();
    if let Some(outcome) = supervisor.finalize(decision, &handshake, engine_ref, &transport) {
        if !outcome.acknowledged() {
            warn!(outcome = ?outcome, "Exited without watchdog acknowledgement");
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("ENGINE_HOST_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Panics anywhere in the host, including a connection-count underflow, go
/// down the fatal path.
fn install_panic_hook(on_fatal: FatalHandler) {
    std::panic::set_hook(Box::new(move |info| {
        let detail = info.to_string();
        on_fatal("%s", &[detail.into()]);
    }));
}
