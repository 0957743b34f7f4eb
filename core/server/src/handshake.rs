//! Exit rendezvous with the crash-reporter watchdog.
//!
//! After an idle shutdown the server binds a Unix socket under a fixed name
//! and waits for the watchdog to send one message, so the watchdog can tell
//! an ordinary exit from a crash. Every failure here degrades to "exit
//! without the rendezvous"; nothing in this module can keep the process
//! alive except the wait itself.
//!
//! The fixed name means two servers finishing an idle shutdown at the same
//! moment collide on the socket. That is accepted.

use std::io::{ErrorKind, Read};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::HandshakeConfig;

pub const DEFAULT_RENDEZVOUS_NAME: &str = "exit-engine-crash-handler";
pub const DEFAULT_BUFFER_SIZE: usize = 512;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The watchdog sent a message.
    Acknowledged { bytes: usize },
    /// A peer connected and hung up without writing anything.
    ClosedWithoutMessage,
    OpenFailed,
    ReadFailed,
    /// Only reachable with a configured timeout.
    TimedOut,
}

impl HandshakeOutcome {
    pub fn acknowledged(&self) -> bool {
        matches!(self, HandshakeOutcome::Acknowledged { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownHandshake {
    socket_path: PathBuf,
    buffer_size: usize,
    timeout: Option<Duration>,
}

impl ShutdownHandshake {
    pub fn new(socket_path: PathBuf, buffer_size: usize, timeout: Option<Duration>) -> Self {
        Self {
            socket_path,
            buffer_size: buffer_size.max(1),
            timeout,
        }
    }

    pub fn from_config(config: &HandshakeConfig) -> Self {
        Self::new(config.socket_path(), config.buffer_size, config.timeout())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Blocks until the watchdog answers, the channel fails, or the optional
    /// timeout expires.
    pub fn perform(&self) -> HandshakeOutcome {
        let listener = match self.open() {
            Ok(listener) => listener,
            Err(err) => {
                warn!(
                    error = %err,
                    path = %self.socket_path.display(),
                    "Failed to open exit rendezvous; skipping handshake"
                );
                return HandshakeOutcome::OpenFailed;
            }
        };

        info!(
            path = %self.socket_path.display(),
            timeout_ms = self.timeout.map(|timeout| timeout.as_millis() as u64),
            "Waiting for watchdog exit acknowledgement"
        );
        let outcome = self.await_message(&listener);
        drop(listener);

        if let Err(err) = remove_socket(&self.socket_path) {
            debug!(error = %err, path = %self.socket_path.display(), "Failed to remove rendezvous socket");
        }

        match outcome {
            HandshakeOutcome::Acknowledged { bytes } => {
                info!(bytes, "Watchdog acknowledged exit")
            }
            other => warn!(outcome = ?other, "Exit handshake ended without acknowledgement"),
        }
        outcome
    }

    fn open(&self) -> std::io::Result<UnixListener> {
        remove_socket(&self.socket_path)?;
        UnixListener::bind(&self.socket_path)
    }

    fn await_message(&self, listener: &UnixListener) -> HandshakeOutcome {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        let mut stream = match accept_peer(listener, deadline) {
            Ok(Some(stream)) => stream,
            Ok(None) => return HandshakeOutcome::TimedOut,
            Err(err) => {
                warn!(error = %err, "Failed to accept watchdog connection");
                return HandshakeOutcome::ReadFailed;
            }
        };

        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return HandshakeOutcome::TimedOut;
            }
            let _ = stream.set_read_timeout(Some(remaining));
        }

        let mut buffer = vec![0u8; self.buffer_size];
        match stream.read(&mut buffer) {
            Ok(0) => HandshakeOutcome::ClosedWithoutMessage,
            Ok(bytes) => HandshakeOutcome::Acknowledged { bytes },
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                HandshakeOutcome::TimedOut
            }
            Err(err) => {
                warn!(error = %err, "Failed to read watchdog message");
                HandshakeOutcome::ReadFailed
            }
        }
    }
}

fn accept_peer(
    listener: &UnixListener,
    deadline: Option<Instant>,
) -> std::io::Result<Option<UnixStream>> {
    let Some(deadline) = deadline else {
        return listener.accept().map(|(stream, _)| Some(stream));
    };

    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(Some(stream));
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                thread::sleep(remaining.min(ACCEPT_POLL_INTERVAL));
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

fn remove_socket(path: &Path) -> std::io::Result<()> {
    match fs_err::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
