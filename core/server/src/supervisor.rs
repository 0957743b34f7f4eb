//! Lifecycle supervisor: shutdown latch, poll loop, and exit sequence.
//!
//! Two paths end the Running state. `System.Shutdown` latches a shutdown that
//! skips the exit handshake; the idle monitor latches one that requires it.
//! Whichever latches first wins, and the handshake requirement is decided in
//! the same atomic step.

use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

use crate::config::LifecycleConfig;
use crate::connections::ConnectionTracker;
use crate::engine::Engine;
use crate::handshake::{HandshakeOutcome, ShutdownHandshake};
use crate::idle::IdleShutdownMonitor;
use crate::transport::{ConnectionHooks, LocalTransport};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

const LATCH_OPEN: u8 = 0;
const LATCH_COMMAND: u8 = 1;
const LATCH_IDLE: u8 = 2;

const PHASE_STARTING: u8 = 0;
const PHASE_RUNNING: u8 = 1;
const PHASE_FINALIZING: u8 = 2;
const PHASE_FINALIZING_HANDSHAKE: u8 = 3;
const PHASE_EXITED: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOrigin {
    Command,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownDecision {
    pub origin: ShutdownOrigin,
    pub requires_handshake: bool,
}

impl ShutdownDecision {
    fn from_origin(origin: ShutdownOrigin) -> Self {
        Self {
            origin,
            requires_handshake: origin == ShutdownOrigin::Idle,
        }
    }
}

/// Write-once shutdown flag.
#[derive(Debug, Default)]
pub struct ShutdownLatch {
    state: AtomicU8,
}

impl ShutdownLatch {
    /// Latches `origin` unless a decision already exists. Returns the decision
    /// in effect afterwards.
    pub fn request(&self, origin: ShutdownOrigin) -> ShutdownDecision {
        let code = match origin {
            ShutdownOrigin::Command => LATCH_COMMAND,
            ShutdownOrigin::Idle => LATCH_IDLE,
        };
        match self
            .state
            .compare_exchange(LATCH_OPEN, code, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => ShutdownDecision::from_origin(origin),
            Err(existing) => decode(existing).unwrap_or(ShutdownDecision::from_origin(origin)),
        }
    }

    pub fn decision(&self) -> Option<ShutdownDecision> {
        decode(self.state.load(Ordering::Acquire))
    }
}

fn decode(code: u8) -> Option<ShutdownDecision> {
    match code {
        LATCH_COMMAND => Some(ShutdownDecision::from_origin(ShutdownOrigin::Command)),
        LATCH_IDLE => Some(ShutdownDecision::from_origin(ShutdownOrigin::Idle)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    Finalizing { handshake: bool },
    Exited,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Finalizing { handshake: false } => "finalizing",
            LifecycleState::Finalizing { handshake: true } => "finalizing_handshake",
            LifecycleState::Exited => "exited",
        }
    }
}

pub struct LifecycleSupervisor {
    tracker: ConnectionTracker,
    monitor: IdleShutdownMonitor,
    latch: ShutdownLatch,
    poll_interval: Duration,
    phase: AtomicU8,
}

impl LifecycleSupervisor {
    pub fn new(monitor: IdleShutdownMonitor, poll_interval: Duration) -> Self {
        Self {
            tracker: ConnectionTracker::new(),
            monitor,
            latch: ShutdownLatch::default(),
            poll_interval,
            phase: AtomicU8::new(PHASE_STARTING),
        }
    }

    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self::new(
            IdleShutdownMonitor::new(config.idle_grace_period()),
            config.poll_interval(),
        )
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub fn monitor(&self) -> &IdleShutdownMonitor {
        &self.monitor
    }

    pub fn state(&self) -> LifecycleState {
        match self.phase.load(Ordering::Acquire) {
            PHASE_STARTING => LifecycleState::Starting,
            PHASE_RUNNING => LifecycleState::Running,
            PHASE_FINALIZING => LifecycleState::Finalizing { handshake: false },
            PHASE_FINALIZING_HANDSHAKE => LifecycleState::Finalizing { handshake: true },
            _ => LifecycleState::Exited,
        }
    }

    /// The `System.Shutdown` path.
    pub fn request_shutdown(&self) -> ShutdownDecision {
        let decision = self.latch.request(ShutdownOrigin::Command);
        info!(
            origin = ?decision.origin,
            requires_handshake = decision.requires_handshake,
            "Shutdown requested"
        );
        decision
    }

    /// Entered once the transport is accepting. Startup time before the first
    /// client must not count as idle time.
    pub fn enter_running(&self, now: Instant) {
        self.tracker.reset_clock(now);
        self.phase.store(PHASE_RUNNING, Ordering::Release);
        info!(
            idle_grace_ms = self.monitor.grace_period().as_millis() as u64,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Supervisor running"
        );
    }

    /// One tick of the poll loop.
    pub fn poll_once(&self, now: Instant) -> Option<ShutdownDecision> {
        if let Some(decision) = self.latch.decision() {
            return Some(decision);
        }

        let snapshot = self.tracker.snapshot();
        if !self.monitor.is_idle(&snapshot, now) {
            return None;
        }

        let decision = self.latch.request(ShutdownOrigin::Idle);
        info!(
            idle_ms = now.saturating_duration_since(snapshot.last_disconnect_at).as_millis() as u64,
            origin = ?decision.origin,
            "Idle grace period elapsed"
        );
        Some(decision)
    }

    pub fn run_until_shutdown(&self) -> ShutdownDecision {
        loop {
            if let Some(decision) = self.poll_once(Instant::now()) {
                let phase = if decision.requires_handshake {
                    PHASE_FINALIZING_HANDSHAKE
                } else {
                    PHASE_FINALIZING
                };
                self.phase.store(phase, Ordering::Release);
                return decision;
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Exit sequence shared by both shutdown paths. Returns the handshake
    /// outcome when one was attempted.
    pub fn finalize(
        &self,
        decision: ShutdownDecision,
        handshake: &ShutdownHandshake,
        engine: &dyn Engine,
        transport: &LocalTransport,
    ) -> Option<HandshakeOutcome> {
        let outcome = if decision.requires_handshake {
            Some(handshake.perform())
        } else {
            None
        };

        engine.finalize_global_signals();
        engine.destroy();
        transport.finalize();

        self.phase.store(PHASE_EXITED, Ordering::Release);
        info!(origin = ?decision.origin, handshake = ?outcome, "Shutdown complete");
        outcome
    }
}

impl ConnectionHooks for LifecycleSupervisor {
    fn on_connect(&self) {
        self.tracker.on_connect();
    }

    fn on_disconnect(&self) {
        self.tracker.on_disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{HeadlessEngine, TeardownStep};
    use crate::handshake::DEFAULT_BUFFER_SIZE;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn supervisor(grace: Duration, poll: Duration) -> LifecycleSupervisor {
        LifecycleSupervisor::new(IdleShutdownMonitor::new(grace), poll)
    }

    #[test]
    fn command_shutdown_skips_handshake() {
        let supervisor = supervisor(ms(5000), DEFAULT_POLL_INTERVAL);
        let decision = supervisor.request_shutdown();
        assert_eq!(decision.origin, ShutdownOrigin::Command);
        assert!(!decision.requires_handshake);
        assert_eq!(supervisor.poll_once(Instant::now()), Some(decision));
    }

    #[test]
    fn idle_shutdown_requires_handshake() {
        let start = Instant::now();
        let supervisor = supervisor(ms(5000), DEFAULT_POLL_INTERVAL);
        supervisor.enter_running(start);

        assert_eq!(supervisor.poll_once(start + ms(5000)), None);
        let decision = supervisor
            .poll_once(start + ms(5001))
            .expect("idle decision");
        assert_eq!(decision.origin, ShutdownOrigin::Idle);
        assert!(decision.requires_handshake);
    }

    #[test]
    fn first_decision_is_never_overwritten() {
        let latch = ShutdownLatch::default();
        let idle = latch.request(ShutdownOrigin::Idle);
        let later = latch.request(ShutdownOrigin::Command);
        assert_eq!(later, idle);
        assert!(latch.decision().expect("decision").requires_handshake);

        let latch = ShutdownLatch::default();
        latch.request(ShutdownOrigin::Command);
        assert!(!latch.request(ShutdownOrigin::Idle).requires_handshake);
    }

    #[test]
    fn idle_tick_after_command_keeps_command_decision() {
        let start = Instant::now();
        let supervisor = supervisor(ms(10), DEFAULT_POLL_INTERVAL);
        supervisor.enter_running(start);
        supervisor.request_shutdown();

        let decision = supervisor.poll_once(start + ms(1000)).expect("decision");
        assert_eq!(decision.origin, ShutdownOrigin::Command);
    }

    #[test]
    fn reconnect_before_grace_delays_idle_shutdown() {
        let start = Instant::now();
        let supervisor = supervisor(ms(5000), DEFAULT_POLL_INTERVAL);
        supervisor.enter_running(start);
        let tracker = supervisor.tracker();

        tracker.record_connect(start);
        tracker.record_disconnect(start);
        tracker.record_connect(start + ms(4000));
        tracker.record_disconnect(start + ms(4100));

        assert_eq!(supervisor.poll_once(start + ms(5050)), None);
        assert_eq!(supervisor.poll_once(start + ms(9100)), None);
        assert!(supervisor.poll_once(start + ms(9101)).is_some());
    }

    #[test]
    fn startup_latency_is_not_idle_time() {
        let start = Instant::now();
        let supervisor = supervisor(ms(5000), DEFAULT_POLL_INTERVAL);
        let ready_at = start + ms(8000);
        supervisor.enter_running(ready_at);

        assert_eq!(supervisor.poll_once(ready_at + ms(100)), None);
        assert_eq!(supervisor.state(), LifecycleState::Running);
    }

    #[test]
    fn run_loop_observes_idle_within_one_poll_interval() {
        let grace = ms(200);
        let poll = ms(10);
        let supervisor = supervisor(grace, poll);
        supervisor.on_connect();
        supervisor.enter_running(Instant::now());
        supervisor.on_disconnect();
        let disconnected_at = supervisor.tracker().snapshot().last_disconnect_at;

        let decision = supervisor.run_until_shutdown();
        let elapsed = disconnected_at.elapsed();

        assert!(decision.requires_handshake);
        assert!(elapsed > grace, "fired early after {:?}", elapsed);
        // One poll interval of slack plus scheduler noise.
        assert!(elapsed < grace + poll + ms(150), "fired late after {:?}", elapsed);
        assert_eq!(
            supervisor.state(),
            LifecycleState::Finalizing { handshake: true }
        );
    }

    #[test]
    fn run_loop_exits_on_command_from_another_thread() {
        let supervisor = Arc::new(supervisor(ms(60_000), ms(10)));
        supervisor.enter_running(Instant::now());
        supervisor.on_connect();

        let remote = Arc::clone(&supervisor);
        let commander = thread::spawn(move || {
            thread::sleep(ms(50));
            remote.request_shutdown()
        });

        let decision = supervisor.run_until_shutdown();
        commander.join().expect("commander thread");
        assert_eq!(decision.origin, ShutdownOrigin::Command);
        assert_eq!(
            supervisor.state(),
            LifecycleState::Finalizing { handshake: false }
        );
    }

    #[test]
    fn finalize_tears_down_engine_before_transport() {
        let dir = TempDir::new().expect("tempdir");
        let transport = LocalTransport::bind(&dir.path().join("engine.sock")).expect("bind");
        let engine = HeadlessEngine::new();
        let handshake = ShutdownHandshake::new(
            dir.path().join("missing").join("rendezvous.sock"),
            DEFAULT_BUFFER_SIZE,
            None,
        );
        let supervisor = supervisor(ms(10), ms(10));
        let decision = supervisor.latch.request(ShutdownOrigin::Idle);

        let outcome = supervisor.finalize(decision, &handshake, &engine, &transport);

        assert_eq!(outcome, Some(HandshakeOutcome::OpenFailed));
        assert_eq!(
            engine.teardown_steps(),
            vec![TeardownStep::FinalizeGlobalSignals, TeardownStep::Destroy]
        );
        assert!(transport.is_finalized());
        assert_eq!(supervisor.state(), LifecycleState::Exited);
    }

    #[test]
    fn command_finalize_never_opens_rendezvous() {
        let dir = TempDir::new().expect("tempdir");
        let transport = LocalTransport::bind(&dir.path().join("engine.sock")).expect("bind");
        let engine = HeadlessEngine::new();
        let rendezvous = dir.path().join("rendezvous.sock");
        // Would block for the full timeout if it were attempted.
        let handshake = ShutdownHandshake::new(rendezvous.clone(), DEFAULT_BUFFER_SIZE, Some(ms(5000)));
        let supervisor = supervisor(ms(10), ms(10));
        let decision = supervisor.request_shutdown();

        let started = Instant::now();
        let outcome = supervisor.finalize(decision, &handshake, &engine, &transport);

        assert_eq!(outcome, None);
        assert!(started.elapsed() < ms(2000));
        assert!(!rendezvous.exists());
        assert_eq!(engine.teardown_steps().len(), 2);
    }
}
