//! engine-hostctl: operator and watchdog CLI for engine-host-server.
//!
//! ## Subcommands
//!
//! - `health`: Print the server's health report
//! - `shutdown`: Ask the server to exit now (no exit rendezvous)
//! - `hold`: Keep a connection open, holding off idle shutdown
//! - `fault`: Raise a fatal engine condition (server must allow it)
//! - `ack-exit`: Answer the exit rendezvous, as the crash watchdog does

mod client;
mod logging;

use clap::{Parser, Subcommand};
use engine_host_protocol::{Request, Response};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_RENDEZVOUS_NAME: &str = "exit-engine-crash-handler";
/// Covers the crash handoff the server runs before it aborts.
const FAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Parser)]
#[command(name = "engine-hostctl")]
#[command(about = "Control an engine-host-server instance")]
#[command(version)]
struct Cli {
    /// Server endpoint socket (defaults to $ENGINE_HOST_ENDPOINT)
    #[arg(long, global = true, value_name = "PATH")]
    endpoint: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the server's health report
    Health,

    /// Request an immediate shutdown
    Shutdown,

    /// Hold a connection open for the given number of seconds
    Hold {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },

    /// Raise a fatal engine condition with the given message
    Fault {
        #[arg(value_name = "MESSAGE")]
        message: String,
    },

    /// Acknowledge the server's exit rendezvous
    AckExit {
        /// Directory holding the rendezvous socket (defaults to the temp dir)
        #[arg(long)]
        directory: Option<PathBuf>,

        #[arg(long, default_value = DEFAULT_RENDEZVOUS_NAME)]
        name: String,

        #[arg(long, default_value = "exit")]
        message: String,

        /// Give up if the rendezvous does not open in time
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        tracing::error!(error = %err, "engine-hostctl failed");
        eprintln!("engine-hostctl: {}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Commands::Health => {
            let endpoint = client::resolve_endpoint(cli.endpoint)?;
            let response = client::send_request(
                &endpoint,
                &Request::get_health().with_id(client::make_request_id()),
            )?;
            let data = expect_ok(response)?;
            let report = data.get(1).cloned().unwrap_or(serde_json::Value::Null);
            let rendered = serde_json::to_string_pretty(&report)
                .map_err(|err| format!("Failed to render health report: {}", err))?;
            println!("{}", rendered);
            Ok(())
        }
        Commands::Shutdown => {
            let endpoint = client::resolve_endpoint(cli.endpoint)?;
            let response = client::send_request(
                &endpoint,
                &Request::shutdown().with_id(client::make_request_id()),
            )?;
            expect_ok(response)?;
            tracing::info!(endpoint = %endpoint.display(), "Shutdown requested");
            Ok(())
        }
        Commands::Hold { seconds } => {
            let endpoint = client::resolve_endpoint(cli.endpoint)?;
            let _stream = UnixStream::connect(&endpoint)
                .map_err(|err| format!("Failed to connect to {}: {}", endpoint.display(), err))?;
            tracing::info!(seconds, "Holding server connection");
            std::thread::sleep(Duration::from_secs(seconds));
            Ok(())
        }
        Commands::Fault { message } => {
            let endpoint = client::resolve_endpoint(cli.endpoint)?;
            let request = Request::induce_fault(&message).with_id(client::make_request_id());
            // A successful fault never answers; the server aborts mid-request.
            match client::send_unanswered(
                &endpoint,
                &request,
                Duration::from_millis(FAULT_TIMEOUT_MS),
            )? {
                Some(response) => {
                    expect_ok(response)?;
                    Err("Server answered the fault instead of aborting".to_string())
                }
                None => {
                    tracing::info!(endpoint = %endpoint.display(), "Server aborted after fault");
                    Ok(())
                }
            }
        }
        Commands::AckExit {
            directory,
            name,
            message,
            timeout_ms,
        } => {
            let rendezvous = directory
                .unwrap_or_else(std::env::temp_dir)
                .join(format!("{}.sock", name));
            client::acknowledge_exit(&rendezvous, &message, Duration::from_millis(timeout_ms))?;
            tracing::info!(path = %rendezvous.display(), "Exit acknowledged");
            Ok(())
        }
    }
}

fn expect_ok(response: Response) -> Result<serde_json::Value, String> {
    if response.ok {
        return Ok(response.data.unwrap_or(serde_json::Value::Null));
    }
    Err(response
        .error
        .map(|err| format!("{}: {}", err.code, err.message))
        .unwrap_or_else(|| "Unknown server error".to_string()))
}
