//! Local command transport.
//!
//! A Unix socket at the endpoint path given on the command line. Each client
//! gets its own thread and keeps its connection for as long as it likes;
//! requests and responses are newline-delimited JSON. The lifecycle hooks see
//! exactly one `on_connect` and one `on_disconnect` per accepted client.

use fs_err as fs;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use engine_host_protocol::{
    ErrorInfo, Request, Response, ERROR_INVALID_JSON, ERROR_PROTOCOL_MISMATCH,
    ERROR_REQUEST_TOO_LARGE, ERROR_SHUTTING_DOWN, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

use crate::commands::CommandRegistry;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub trait ConnectionHooks: Send + Sync {
    fn on_connect(&self);
    fn on_disconnect(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to remove stale socket: {0}")]
    Stale(std::io::Error),

    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to configure listener: {0}")]
    Listener(std::io::Error),

    #[error("Failed to spawn accept thread: {0}")]
    Spawn(std::io::Error),

    #[error("Transport is already serving or finalized")]
    NotBound,
}

pub struct LocalTransport {
    path: PathBuf,
    listener: Mutex<Option<UnixListener>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<TransportShared>,
    finalized: AtomicBool,
}

struct TransportShared {
    stopping: AtomicBool,
    in_flight: AtomicUsize,
}

impl LocalTransport {
    /// Binds the endpoint. A leftover socket file is replaced; a missing parent
    /// directory is an error.
    pub fn bind(path: &Path) -> Result<Self, TransportError> {
        remove_stale_socket(path).map_err(TransportError::Stale)?;
        let listener = UnixListener::bind(path).map_err(|source| TransportError::Bind {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Transport bound");

        Ok(Self {
            path: path.to_path_buf(),
            listener: Mutex::new(Some(listener)),
            accept_thread: Mutex::new(None),
            shared: Arc::new(TransportShared {
                stopping: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
            }),
            finalized: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts the accept loop on its own thread.
    pub fn serve(
        &self,
        hooks: Arc<dyn ConnectionHooks>,
        registry: Arc<CommandRegistry>,
    ) -> Result<(), TransportError> {
        let listener = lock(&self.listener).take().ok_or(TransportError::NotBound)?;
        // Nonblocking so finalize can stop the loop without a wake-up connection.
        listener
            .set_nonblocking(true)
            .map_err(TransportError::Listener)?;

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("transport-accept".to_string())
            .spawn(move || accept_loop(listener, shared, hooks, registry))
            .map_err(TransportError::Spawn)?;
        *lock(&self.accept_thread) = Some(handle);
        Ok(())
    }

    /// Stops accepting, gives in-flight requests a bounded window to finish,
    /// and removes the socket file. Safe to call more than once.
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.stopping.store(true, Ordering::Release);
        lock(&self.listener).take();

        if let Some(handle) = lock(&self.accept_thread).take() {
            if handle.join().is_err() {
                warn!("Transport accept thread panicked");
            }
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.shared.in_flight.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    in_flight = self.shared.in_flight.load(Ordering::Acquire),
                    "Transport finalized with requests still in flight"
                );
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(error = %err, "Failed to remove transport socket");
            }
        }
        info!(path = %self.path.display(), "Transport finalized");
    }

    #[cfg(test)]
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }
}

fn accept_loop(
    listener: UnixListener,
    shared: Arc<TransportShared>,
    hooks: Arc<dyn ConnectionHooks>,
    registry: Arc<CommandRegistry>,
) {
    while !shared.stopping.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    warn!(error = %err, "Failed to configure client stream");
                    continue;
                }
                hooks.on_connect();
                let guard = ConnectionGuard {
                    hooks: Arc::clone(&hooks),
                };
                let shared = Arc::clone(&shared);
                let registry = Arc::clone(&registry);
                let spawned = thread::Builder::new()
                    .name("transport-client".to_string())
                    .spawn(move || {
                        let _guard = guard;
                        handle_connection(stream, &shared, &registry);
                    });
                // A failed spawn drops the closure, and the guard with it.
                if let Err(err) = spawned {
                    warn!(error = %err, "Failed to spawn client thread");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept connection");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    debug!("Accept loop stopped");
}

/// Pairs every accepted connection with exactly one disconnect.
struct ConnectionGuard {
    hooks: Arc<dyn ConnectionHooks>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hooks.on_disconnect();
    }
}

enum ReadOutcome {
    Line(Vec<u8>),
    Pending,
    TooLarge,
    Closed,
}

fn handle_connection(stream: UnixStream, shared: &TransportShared, registry: &CommandRegistry) {
    if let Err(err) = stream.set_read_timeout(Some(READ_POLL_INTERVAL)) {
        warn!(error = %err, "Failed to set client read timeout");
        return;
    }
    let mut reader = BufReader::new(stream);
    let mut buffer = Vec::new();

    loop {
        let line = match read_line(&mut reader, &mut buffer) {
            Ok(ReadOutcome::Line(line)) => line,
            Ok(ReadOutcome::Pending) => {
                if shared.stopping.load(Ordering::Acquire) {
                    break;
                }
                continue;
            }
            Ok(ReadOutcome::TooLarge) => {
                let response = Response::error(
                    None,
                    ERROR_REQUEST_TOO_LARGE,
                    "request exceeded maximum size",
                );
                let _ = write_response(reader.get_mut(), &response);
                break;
            }
            Ok(ReadOutcome::Closed) => break,
            Err(err) => {
                debug!(error = %err, "Client read failed");
                break;
            }
        };

        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }

        let _in_flight = InFlight::enter(shared);
        let response = match parse_request(&line) {
            Ok(request) if shared.stopping.load(Ordering::Acquire) => {
                Response::error(request.id, ERROR_SHUTTING_DOWN, "server is shutting down")
            }
            Ok(request) => handle_request(request, registry),
            Err(err) => {
                warn!(code = %err.code, message = %err.message, "Rejected request");
                Response::error_with_info(None, err)
            }
        };

        if let Err(err) = write_response(reader.get_mut(), &response) {
            debug!(error = %err, "Failed to write response");
            break;
        }
    }
}

/// Reads up to the next newline. Bytes received before a read timeout stay in
/// `buffer` for the next call.
fn read_line(
    reader: &mut BufReader<UnixStream>,
    buffer: &mut Vec<u8>,
) -> std::io::Result<ReadOutcome> {
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(ReadOutcome::Pending);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };

        if available.is_empty() {
            // Peer closed; a final request without a newline still counts.
            return Ok(if buffer.is_empty() {
                ReadOutcome::Closed
            } else {
                ReadOutcome::Line(std::mem::take(buffer))
            });
        }

        let (consumed, complete) = match available.iter().position(|b| *b == b'\n') {
            Some(index) => {
                buffer.extend_from_slice(&available[..index]);
                (index + 1, true)
            }
            None => {
                buffer.extend_from_slice(available);
                (available.len(), false)
            }
        };
        reader.consume(consumed);

        if buffer.len() > MAX_REQUEST_BYTES {
            buffer.clear();
            return Ok(ReadOutcome::TooLarge);
        }
        if complete {
            return Ok(ReadOutcome::Line(std::mem::take(buffer)));
        }
    }
}

fn parse_request(line: &[u8]) -> Result<Request, ErrorInfo> {
    serde_json::from_slice(line).map_err(|err| {
        ErrorInfo::new(
            ERROR_INVALID_JSON,
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, registry: &CommandRegistry) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            ERROR_PROTOCOL_MISMATCH,
            "unsupported protocol version",
        );
    }
    registry.dispatch(request)
}

fn write_response(stream: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

struct InFlight<'a> {
    shared: &'a TransportShared,
}

impl<'a> InFlight<'a> {
    fn enter(shared: &'a TransportShared) -> Self {
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { shared }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            debug!(path = %path.display(), "Removing stale socket");
            fs::remove_file(path)
        }
        // Anything else at the path makes bind fail with a clear error.
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
