//! Socket helpers for talking to engine-host-server and its exit rendezvous.

use chrono::Utc;
use engine_host_protocol::{Request, Response, MAX_REQUEST_BYTES};
use rand::RngCore;
use std::env;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const ENDPOINT_ENV: &str = "ENGINE_HOST_ENDPOINT";
const READ_TIMEOUT_MS: u64 = 2000;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

pub fn resolve_endpoint(explicit: Option<PathBuf>) -> Result<PathBuf, String> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    env::var(ENDPOINT_ENV)
        .map(PathBuf::from)
        .map_err(|_| format!("No endpoint given; pass --endpoint or set {}", ENDPOINT_ENV))
}

pub fn make_request_id() -> String {
    let mut random = rand::thread_rng();
    format!(
        "req-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        random.next_u64()
    )
}

/// One request on a fresh connection. The server counts the connection for
/// as long as the stream lives.
pub fn send_request(endpoint: &Path, request: &Request) -> Result<Response, String> {
    let mut stream = connect(endpoint)?;
    write_request(&mut stream, request, Duration::from_millis(READ_TIMEOUT_MS))?;
    read_response(&mut stream).map_err(|failure| failure.to_string())
}

/// Sends a request the server may answer by exiting instead. Failing to
/// connect or write is an error; the connection closing before any reply
/// yields `None`. Waits up to `timeout` for either outcome.
pub fn send_unanswered(
    endpoint: &Path,
    request: &Request,
    timeout: Duration,
) -> Result<Option<Response>, String> {
    let mut stream = connect(endpoint)?;
    write_request(&mut stream, request, timeout)?;
    match read_response(&mut stream) {
        Ok(response) => Ok(Some(response)),
        Err(ReadFailure::Closed) => Ok(None),
        Err(failure) => Err(failure.to_string()),
    }
}

fn connect(endpoint: &Path) -> Result<UnixStream, String> {
    UnixStream::connect(endpoint)
        .map_err(|err| format!("Failed to connect to {}: {}", endpoint.display(), err))
}

fn write_request(
    stream: &mut UnixStream,
    request: &Request,
    read_timeout: Duration,
) -> Result<(), String> {
    let _ = stream.set_read_timeout(Some(read_timeout));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut *stream, request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();
    Ok(())
}

#[derive(Debug)]
enum ReadFailure {
    /// The server closed the connection before sending a full line.
    Closed,
    TimedOut,
    Invalid(String),
}

impl fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadFailure::Closed => write!(f, "Server closed the connection without responding"),
            ReadFailure::TimedOut => write!(f, "Timed out waiting for server response"),
            ReadFailure::Invalid(message) => write!(f, "{}", message),
        }
    }
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ReadFailure> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ReadFailure::Invalid(
                        "Response exceeded maximum size".to_string(),
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(ReadFailure::TimedOut);
            }
            Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                return Err(ReadFailure::Closed);
            }
            Err(err) => {
                return Err(ReadFailure::Invalid(format!(
                    "Failed to read response: {}",
                    err
                )))
            }
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err(ReadFailure::Closed);
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| ReadFailure::Invalid(format!("Failed to parse response JSON: {}", err)))
}

/// Watchdog side of the exit rendezvous. The server only opens the socket
/// once it has decided to exit, so connect is retried until `timeout`.
pub fn acknowledge_exit(rendezvous: &Path, message: &str, timeout: Duration) -> Result<(), String> {
    let deadline = Instant::now() + timeout;
    let mut stream = loop {
        match UnixStream::connect(rendezvous) {
            Ok(stream) => break stream,
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(format!(
                        "Exit rendezvous {} never opened: {}",
                        rendezvous.display(),
                        err
                    ));
                }
                tracing::debug!(error = %err, "Exit rendezvous not ready; retrying");
                thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            }
        }
    };

    stream
        .write_all(message.as_bytes())
        .map_err(|err| format!("Failed to acknowledge exit: {}", err))?;
    stream.flush().ok();
    Ok(())
}
