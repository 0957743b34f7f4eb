//! Connection bookkeeping for idle shutdown.
//!
//! The transport calls the hooks on every accept and every hang-up. The monitor
//! only ever reads a [`ConnectionSnapshot`], so count and timestamps always come
//! from the same instant.

use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub active: usize,
    pub last_connect_at: Instant,
    pub last_disconnect_at: Instant,
}

#[derive(Debug)]
struct ConnectionState {
    active: usize,
    last_connect_at: Instant,
    last_disconnect_at: Instant,
}

#[derive(Debug)]
pub struct ConnectionTracker {
    state: Mutex<ConnectionState>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            state: Mutex::new(ConnectionState {
                active: 0,
                last_connect_at: now,
                last_disconnect_at: now,
            }),
        }
    }

    pub fn on_connect(&self) {
        self.record_connect(Instant::now());
    }

    pub fn on_disconnect(&self) {
        self.record_disconnect(Instant::now());
    }

    pub fn record_connect(&self, at: Instant) {
        let active = {
            let mut state = self.lock();
            state.active += 1;
            state.last_connect_at = at;
            state.active
        };
        tracing::debug!(active, "Client connected");
    }

    /// Panics when there is no matching connect. A transport that hangs up a
    /// connection twice is broken, and clamping would hide it.
    pub fn record_disconnect(&self, at: Instant) {
        let remaining = {
            let mut state = self.lock();
            match state.active.checked_sub(1) {
                Some(remaining) => {
                    state.active = remaining;
                    state.last_disconnect_at = at;
                    Some(remaining)
                }
                None => None,
            }
        };

        match remaining {
            Some(active) => tracing::debug!(active, "Client disconnected"),
            None => {
                tracing::error!("Disconnect without a matching connect");
                panic!("connection count underflow: disconnect without a matching connect");
            }
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.lock();
        ConnectionSnapshot {
            active: state.active,
            last_connect_at: state.last_connect_at,
            last_disconnect_at: state.last_disconnect_at,
        }
    }

    /// Restart both clocks without touching the count.
    pub fn reset_clock(&self, now: Instant) {
        let mut state = self.lock();
        state.last_connect_at = now;
        state.last_disconnect_at = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        // Writers never panic while holding the guard, so poisoning only
        // happens if the process is already going down.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}
