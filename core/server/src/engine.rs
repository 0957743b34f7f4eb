//! Seam between the supervisor and the native engine.
//!
//! The supervisor needs three things from the engine: a place to install the
//! fatal-error callback and the two teardown hooks run at exit. Command
//! handlers for the engine itself live elsewhere.

use std::sync::{Arc, Mutex};
use tracing::{error, info};

use crate::diagnostic::FormatArg;

/// Callback the engine invokes on a fatal condition. The installed handler
/// is expected to terminate the process; the engine aborts if it returns.
pub type FatalHandler = Arc<dyn Fn(&str, &[FormatArg]) + Send + Sync>;

pub trait Engine: Send + Sync {
    fn set_fatal_handler(&self, handler: FatalHandler);
    fn finalize_global_signals(&self);
    fn destroy(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    FinalizeGlobalSignals,
    Destroy,
}

/// Engine stand-in for hosts that run without the native engine loaded.
#[derive(Default)]
pub struct HeadlessEngine {
    fatal_handler: Mutex<Option<FatalHandler>>,
    teardown: Mutex<Vec<TeardownStep>>,
}

impl HeadlessEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports a fatal condition the way the native engine does. Control
    /// never comes back: a handler that returns is followed by an abort, as
    /// is a fatal condition raised before any handler is installed.
    pub fn raise_fatal(&self, format: &str, args: &[FormatArg]) -> ! {
        let handler = self
            .fatal_handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match handler {
            Some(handler) => {
                handler(format, args);
                error!(format, "Fatal handler returned control to the engine");
            }
            None => error!(format, "Fatal engine condition with no handler installed"),
        }
        std::process::abort()
    }

    #[cfg(test)]
    pub fn teardown_steps(&self) -> Vec<TeardownStep> {
        self.teardown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, step: TeardownStep) {
        info!(step = ?step, "Engine teardown");
        self.teardown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(step);
    }
}

impl Engine for HeadlessEngine {
    fn set_fatal_handler(&self, handler: FatalHandler) {
        *self
            .fatal_handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }

    fn finalize_global_signals(&self) {
        self.record(TeardownStep::FinalizeGlobalSignals);
    }

    fn destroy(&self) {
        self.record(TeardownStep::Destroy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handlers in these tests unwind instead of terminating so the caller
    /// can observe them; a returning handler would abort the test binary.
    fn raise_expecting_unwind(engine: &HeadlessEngine, format: &str, args: &[FormatArg]) {
        let outcome = catch_unwind(AssertUnwindSafe(|| engine.raise_fatal(format, args)));
        assert!(outcome.is_err(), "fatal handler should not return");
    }

    #[test]
    fn raise_fatal_reaches_installed_handler() {
        let engine = HeadlessEngine::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        engine.set_fatal_handler(Arc::new(move |format: &str, args: &[FormatArg]| {
            seen.lock().unwrap().push((format.to_string(), args.to_vec()));
            panic!("fatal handler invoked");
        }));

        raise_expecting_unwind(&engine, "engine fault %d", &[42.into()]);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "engine fault %d");
        assert_eq!(calls[0].1, vec![FormatArg::Int(42)]);
    }

    #[test]
    fn latest_handler_wins() {
        let engine = HeadlessEngine::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&first);
        engine.set_fatal_handler(Arc::new(move |_: &str, _: &[FormatArg]| {
            counter.fetch_add(1, Ordering::SeqCst);
            panic!("first handler");
        }));
        let counter = Arc::clone(&second);
        engine.set_fatal_handler(Arc::new(move |_: &str, _: &[FormatArg]| {
            counter.fetch_add(1, Ordering::SeqCst);
            panic!("second handler");
        }));

        raise_expecting_unwind(&engine, "boom", &[]);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_steps_are_recorded_in_call_order() {
        let engine = HeadlessEngine::new();
        engine.finalize_global_signals();
        engine.destroy();
        assert_eq!(
            engine.teardown_steps(),
            vec![TeardownStep::FinalizeGlobalSignals, TeardownStep::Destroy]
        );
    }
}
