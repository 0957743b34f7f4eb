//! Out-of-process crash reporter client and its on-disk database.
//!
//! The handler executable is started with
//! `<arguments...> --database <db> --url <url> [--annotation key=value]...`
//! and prints a `ready` line once it can accept reports. While it runs, a
//! further start request is delivered as a JSON line on its stdin
//! (`{"annotations": {...}}`) and acknowledged with another `ready` line, so
//! starting twice never spawns a second handler.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::crash::CrashAnnotationContext;

pub type Annotations = BTreeMap<String, String>;

const READY_LINE: &str = "ready";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    #[error("Failed to spawn crash handler {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to deliver annotations to crash handler: {0}")]
    Deliver(#[source] std::io::Error),

    #[error("Failed to encode annotations: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Crash handler was never started")]
    NotStarted,

    #[error("Crash handler exited before signalling readiness")]
    Exited,

    #[error("Timed out waiting for crash handler readiness")]
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to prepare crash database {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode crash database settings: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait ReporterClient: Send {
    /// Starts the handler, or hands it new annotations if it is already running.
    fn start_handler(
        &mut self,
        context: &CrashAnnotationContext,
        annotations: &Annotations,
    ) -> Result<(), ReporterError>;

    /// Blocks until the handler reports readiness. `None` waits forever.
    fn wait_for_handler_start(&mut self, timeout: Option<Duration>) -> Result<(), ReporterError>;
}

#[derive(Default)]
pub struct ProcessReporterClient {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    lines: Option<Receiver<String>>,
}

impl ProcessReporterClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_running(&mut self) -> bool {
        match self.child.as_mut().map(|child| child.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                debug!(status = %status, "Crash handler has exited");
                false
            }
            Some(Err(err)) => {
                warn!(error = %err, "Failed to poll crash handler");
                false
            }
            None => false,
        }
    }

    fn spawn(
        &mut self,
        context: &CrashAnnotationContext,
        annotations: &Annotations,
    ) -> Result<(), ReporterError> {
        let mut command = Command::new(&context.handler);
        command
            .args(&context.arguments)
            .arg("--database")
            .arg(&context.database)
            .arg("--url")
            .arg(&context.upload_url);
        for (key, value) in annotations {
            command.arg(format!("--annotation={}={}", key, value));
        }

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ReporterError::Spawn {
                path: context.handler.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    match line {
                        Ok(line) => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }

        info!(
            pid = child.id(),
            handler = %context.handler.display(),
            annotations = annotations.len(),
            "Crash handler started"
        );
        self.stdin = child.stdin.take();
        self.lines = Some(rx);
        self.child = Some(child);
        Ok(())
    }

    fn deliver(&mut self, annotations: &Annotations) -> Result<(), ReporterError> {
        let stdin = self.stdin.as_mut().ok_or(ReporterError::NotStarted)?;
        // A `ready` left over from a timed-out wait must not count as the
        // acknowledgement for this delivery.
        if let Some(lines) = &self.lines {
            while let Ok(line) = lines.try_recv() {
                debug!(line = %line, "Discarding stale crash handler output");
            }
        }
        let payload = serde_json::to_string(&serde_json::json!({ "annotations": annotations }))?;
        stdin
            .write_all(payload.as_bytes())
            .and_then(|_| stdin.write_all(b"\n"))
            .and_then(|_| stdin.flush())
            .map_err(ReporterError::Deliver)?;
        debug!(annotations = annotations.len(), "Annotations delivered to running crash handler");
        Ok(())
    }
}

impl ReporterClient for ProcessReporterClient {
    fn start_handler(
        &mut self,
        context: &CrashAnnotationContext,
        annotations: &Annotations,
    ) -> Result<(), ReporterError> {
        if self.is_running() {
            return self.deliver(annotations);
        }
        self.spawn(context, annotations)
    }

    fn wait_for_handler_start(&mut self, timeout: Option<Duration>) -> Result<(), ReporterError> {
        let lines = self.lines.as_ref().ok_or(ReporterError::NotStarted)?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let line = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    lines.recv_timeout(remaining).map_err(|err| match err {
                        RecvTimeoutError::Timeout => ReporterError::Timeout,
                        RecvTimeoutError::Disconnected => ReporterError::Exited,
                    })?
                }
                None => lines.recv().map_err(|_| ReporterError::Exited)?,
            };

            if line.trim() == READY_LINE {
                return Ok(());
            }
            debug!(line = %line, "Ignoring crash handler output");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatabaseSettings {
    uploads_enabled: bool,
    created_at: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            uploads_enabled: false,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Directory the crash handler writes reports into, plus its settings file.
#[derive(Debug)]
pub struct CrashDatabase {
    path: PathBuf,
    settings: DatabaseSettings,
}

impl CrashDatabase {
    /// Opens the database at `path`, creating it when missing.
    pub fn initialize(path: &Path) -> Result<Self, DatabaseError> {
        fs_err::create_dir_all(path).map_err(|source| DatabaseError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let settings_path = path.join(SETTINGS_FILE);
        let settings = match fs_err::read(&settings_path) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(settings) => settings,
                Err(err) => {
                    warn!(error = %err, path = %settings_path.display(), "Crash database settings unreadable; resetting");
                    DatabaseSettings::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => DatabaseSettings::default(),
            Err(source) => {
                return Err(DatabaseError::Io {
                    path: settings_path,
                    source,
                })
            }
        };

        let database = Self {
            path: path.to_path_buf(),
            settings,
        };
        database.save()?;
        Ok(database)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn uploads_enabled(&self) -> bool {
        self.settings.uploads_enabled
    }

    pub fn set_uploads_enabled(&mut self, enabled: bool) -> Result<(), DatabaseError> {
        self.settings.uploads_enabled = enabled;
        self.save()
    }

    fn save(&self) -> Result<(), DatabaseError> {
        let settings_path = self.path.join(SETTINGS_FILE);
        let payload = serde_json::to_vec_pretty(&self.settings)?;
        let tmp_path = settings_path.with_extension("tmp");
        fs_err::write(&tmp_path, payload)
            .and_then(|_| fs_err::rename(&tmp_path, &settings_path))
            .map_err(|source| DatabaseError::Io {
                path: settings_path,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Records its arguments, then acknowledges every stdin line with `ready`.
    const HANDLER_SCRIPT: &str = r#"
all="$*"
db=""
while [ $# -gt 0 ]; do
  case "$1" in
    --database) db="$2"; shift ;;
  esac
  shift
done
printf '%s\n' "$all" > "$db/handler-args.txt"
echo starting
echo ready
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$db/annotations.jsonl"
  echo ready
done
"#;

    // Signals readiness late and takes a moment to record each delivery.
    const SLOW_HANDLER_SCRIPT: &str = r#"
db=""
while [ $# -gt 0 ]; do
  case "$1" in
    --database) db="$2"; shift ;;
  esac
  shift
done
sleep 0.5
echo ready
while IFS= read -r line; do
  sleep 0.3
  printf '%s\n' "$line" >> "$db/annotations.jsonl"
  echo ready
done
"#;

    fn context(dir: &TempDir, arguments: Vec<String>) -> CrashAnnotationContext {
        context_with_script(dir, HANDLER_SCRIPT, arguments)
    }

    fn context_with_script(
        dir: &TempDir,
        handler_script: &str,
        arguments: Vec<String>,
    ) -> CrashAnnotationContext {
        let script = dir.path().join("handler.sh");
        std::fs::write(&script, handler_script).expect("write handler script");
        let database = dir.path().join("db");
        std::fs::create_dir_all(&database).expect("create db dir");

        let mut args = vec![script.display().to_string()];
        args.extend(arguments);
        CrashAnnotationContext {
            handler: PathBuf::from("/bin/sh"),
            database,
            upload_url: "https://crash.example.invalid/submit".to_string(),
            arguments: args,
        }
    }

    #[test]
    fn spawns_handler_and_waits_for_ready() {
        let dir = TempDir::new().expect("tempdir");
        let context = context(&dir, vec!["--no-rate-limit".to_string()]);
        let mut client = ProcessReporterClient::new();

        client
            .start_handler(&context, &Annotations::new())
            .expect("start handler");
        client
            .wait_for_handler_start(Some(Duration::from_secs(5)))
            .expect("handler ready");

        let args = std::fs::read_to_string(context.database.join("handler-args.txt"))
            .expect("read handler args");
        assert!(args.contains("--no-rate-limit"));
        assert!(args.contains("--url https://crash.example.invalid/submit"));
    }

    #[test]
    fn restart_while_running_delivers_annotations() {
        let dir = TempDir::new().expect("tempdir");
        let context = context(&dir, Vec::new());
        let mut client = ProcessReporterClient::new();
        client
            .start_handler(&context, &Annotations::new())
            .expect("start handler");
        client
            .wait_for_handler_start(Some(Duration::from_secs(5)))
            .expect("handler ready");

        let mut annotations = Annotations::new();
        annotations.insert("engine_fatal".to_string(), "engine fault 42".to_string());
        client
            .start_handler(&context, &annotations)
            .expect("deliver annotations");
        client
            .wait_for_handler_start(Some(Duration::from_secs(5)))
            .expect("handler acknowledged");

        let delivered = std::fs::read_to_string(context.database.join("annotations.jsonl"))
            .expect("read annotations");
        let value: serde_json::Value =
            serde_json::from_str(delivered.trim()).expect("annotation json");
        assert_eq!(value["annotations"]["engine_fatal"], "engine fault 42");
    }

    #[test]
    fn late_ready_from_timed_out_start_does_not_acknowledge_delivery() {
        let dir = TempDir::new().expect("tempdir");
        let context = context_with_script(&dir, SLOW_HANDLER_SCRIPT, Vec::new());
        let mut client = ProcessReporterClient::new();
        client
            .start_handler(&context, &Annotations::new())
            .expect("start handler");
        assert!(matches!(
            client.wait_for_handler_start(Some(Duration::from_millis(50))),
            Err(ReporterError::Timeout)
        ));
        // Let the startup `ready` arrive after the wait gave up.
        std::thread::sleep(Duration::from_millis(1000));

        let mut annotations = Annotations::new();
        annotations.insert("engine_fatal".to_string(), "late start".to_string());
        client
            .start_handler(&context, &annotations)
            .expect("deliver annotations");
        client
            .wait_for_handler_start(Some(Duration::from_secs(5)))
            .expect("handler acknowledged");

        let delivered = std::fs::read_to_string(context.database.join("annotations.jsonl"))
            .expect("annotations recorded before acknowledgement");
        let value: serde_json::Value =
            serde_json::from_str(delivered.trim()).expect("annotation json");
        assert_eq!(value["annotations"]["engine_fatal"], "late start");
    }

    #[test]
    fn missing_handler_fails_to_spawn() {
        let dir = TempDir::new().expect("tempdir");
        let mut context = context(&dir, Vec::new());
        context.handler = dir.path().join("no-such-handler");
        let mut client = ProcessReporterClient::new();

        let err = client
            .start_handler(&context, &Annotations::new())
            .expect_err("spawn should fail");
        assert!(matches!(err, ReporterError::Spawn { .. }));
        assert!(matches!(
            client.wait_for_handler_start(None),
            Err(ReporterError::NotStarted)
        ));
    }

    #[test]
    fn handler_exiting_early_is_reported() {
        let dir = TempDir::new().expect("tempdir");
        let context = CrashAnnotationContext {
            handler: PathBuf::from("/bin/sh"),
            database: dir.path().to_path_buf(),
            upload_url: String::new(),
            arguments: vec!["-c".to_string(), "exit 0".to_string()],
        };
        let mut client = ProcessReporterClient::new();
        client
            .start_handler(&context, &Annotations::new())
            .expect("start handler");

        assert!(matches!(
            client.wait_for_handler_start(Some(Duration::from_secs(5))),
            Err(ReporterError::Exited)
        ));
    }

    #[test]
    fn database_is_created_and_uploads_enabled() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("crashes");

        let mut database = CrashDatabase::initialize(&path).expect("initialize database");
        assert!(!database.uploads_enabled());
        database.set_uploads_enabled(true).expect("enable uploads");

        let reopened = CrashDatabase::initialize(&path).expect("reopen database");
        assert!(reopened.uploads_enabled());
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn unwritable_database_location_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").expect("write blocker");

        assert!(CrashDatabase::initialize(&blocker.join("crashes")).is_err());
    }

    #[test]
    fn corrupt_settings_are_reset() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join(SETTINGS_FILE), b"{not json").expect("write settings");

        let database = CrashDatabase::initialize(dir.path()).expect("initialize database");
        assert!(!database.uploads_enabled());
    }
}
