//! Crash handoff to the external crash reporter.
//!
//! At startup the crash database is prepared and the reporter is started with
//! the baseline arguments. When the engine hits a fatal condition the message
//! is formatted, attached as a single annotation, handed to the reporter, and
//! the process aborts. This path never returns to the engine and never touches
//! the exit handshake.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, CrashReporterConfig};
use crate::diagnostic::{format_message, FormatArg, FormatError};
use crate::engine::FatalHandler;
use crate::reporter::{
    Annotations, CrashDatabase, DatabaseError, ProcessReporterClient, ReporterClient,
    ReporterError,
};

pub const FATAL_ANNOTATION_KEY: &str = "engine_fatal";
pub const NO_RATE_LIMIT_ARG: &str = "--no-rate-limit";

#[derive(Debug, thiserror::Error)]
pub enum CrashStartupError {
    #[error("Crash database unavailable: {0}")]
    Database(#[from] DatabaseError),

    #[error("Failed to resolve crash database path: {0}")]
    Config(#[from] ConfigError),
}

/// Everything the fatal path needs to restart the reporter. Fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashAnnotationContext {
    pub handler: PathBuf,
    pub database: PathBuf,
    pub upload_url: String,
    pub arguments: Vec<String>,
}

impl CrashAnnotationContext {
    pub fn new(handler: PathBuf, database: PathBuf, upload_url: String, extra: &[String]) -> Self {
        let mut arguments = extra.to_vec();
        if !arguments.iter().any(|arg| arg == NO_RATE_LIMIT_ARG) {
            arguments.push(NO_RATE_LIMIT_ARG.to_string());
        }
        Self {
            handler,
            database,
            upload_url,
            arguments,
        }
    }
}

/// What the fatal path managed to hand over before terminating.
#[derive(Debug)]
pub struct FatalHandoff {
    pub annotations: Annotations,
    pub format_error: Option<FormatError>,
    pub reporter_error: Option<ReporterError>,
}

pub struct CrashHandoffCoordinator {
    context: CrashAnnotationContext,
    client: Mutex<Box<dyn ReporterClient>>,
    ready_timeout: Option<Duration>,
}

impl CrashHandoffCoordinator {
    /// Prepares the crash database and starts the reporter. Returns `None`
    /// when no handler is configured.
    pub fn start(config: &CrashReporterConfig) -> Result<Option<Self>, CrashStartupError> {
        let Some(handler) = config.handler.clone() else {
            warn!("Crash reporting disabled: no crash handler configured");
            return Ok(None);
        };

        let database_path = config.database_path()?;
        let mut database = CrashDatabase::initialize(&database_path)?;
        database.set_uploads_enabled(true)?;
        debug!(
            path = %database.path().display(),
            uploads_enabled = database.uploads_enabled(),
            "Crash database ready"
        );

        let context = CrashAnnotationContext::new(
            handler,
            database.path().to_path_buf(),
            config.upload_url.clone(),
            &config.arguments,
        );
        let coordinator = Self::with_client(
            context,
            Box::new(ProcessReporterClient::new()),
            config.ready_timeout(),
        );

        if let Err(err) = coordinator.start_reporter() {
            warn!(error = %err, "Crash handler did not start; continuing without it");
        }
        Ok(Some(coordinator))
    }

    pub fn with_client(
        context: CrashAnnotationContext,
        client: Box<dyn ReporterClient>,
        ready_timeout: Option<Duration>,
    ) -> Self {
        Self {
            context,
            client: Mutex::new(client),
            ready_timeout,
        }
    }

    pub fn context(&self) -> &CrashAnnotationContext {
        &self.context
    }

    pub fn start_reporter(&self) -> Result<(), ReporterError> {
        let mut client = self.lock_client();
        client.start_handler(&self.context, &Annotations::new())?;
        client.wait_for_handler_start(self.ready_timeout)?;
        info!(
            database = %self.context.database.display(),
            "Crash handler ready"
        );
        Ok(())
    }

    /// Formats the fatal message and hands it to the reporter. Every failure
    /// is recorded and swallowed; the caller terminates regardless.
    pub fn hand_off(&self, format: &str, args: &[FormatArg]) -> FatalHandoff {
        let (message, format_error) = annotation_message(format, args);

        let mut annotations = Annotations::new();
        annotations.insert(FATAL_ANNOTATION_KEY.to_string(), message);

        let reporter_error = {
            let mut client = self.lock_client();
            client
                .start_handler(&self.context, &annotations)
                .and_then(|_| client.wait_for_handler_start(self.ready_timeout))
                .err()
        };
        if let Some(err) = &reporter_error {
            error!(error = %err, "Failed to hand fatal condition to crash handler");
        }

        FatalHandoff {
            annotations,
            format_error,
            reporter_error,
        }
    }

    pub fn on_fatal(&self, format: &str, args: &[FormatArg]) -> ! {
        let handoff = self.hand_off(format, args);
        error!(
            detail = handoff
                .annotations
                .get(FATAL_ANNOTATION_KEY)
                .map(String::as_str)
                .unwrap_or_default(),
            delivered = handoff.reporter_error.is_none(),
            "Fatal engine condition handed to crash handler"
        );
        terminate()
    }

    fn lock_client(&self) -> std::sync::MutexGuard<'_, Box<dyn ReporterClient>> {
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Builds the engine's fatal callback. With no coordinator the condition is
/// only logged before the process aborts.
pub fn fatal_handler(coordinator: Option<Arc<CrashHandoffCoordinator>>) -> FatalHandler {
    Arc::new(move |format: &str, args: &[FormatArg]| {
        if let Some(coordinator) = &coordinator {
            coordinator.on_fatal(format, args);
        }
        let (detail, _) = annotation_message(format, args);
        error!(detail = %detail, "Fatal engine condition (crash reporting disabled)");
        terminate();
    })
}

/// A message that cannot be formatted is a fatal condition of its own; the raw
/// template is attached in its place.
fn annotation_message(format: &str, args: &[FormatArg]) -> (String, Option<FormatError>) {
    match format_message(format, args) {
        Ok(message) => (message, None),
        Err(err) => {
            error!(error = %err, format, "Failed to format fatal engine message");
            (format.to_string(), Some(err))
        }
    }
}

fn terminate() -> ! {
    error!("Terminating after fatal engine condition");
    std::process::abort()
}
