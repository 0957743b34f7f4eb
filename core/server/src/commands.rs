//! Command registry.
//!
//! Commands are addressed as `Collection.Function` and registered with a fixed
//! argument count. Arity is checked before the handler runs, so handlers only
//! validate argument types.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use engine_host_protocol::{
    ErrorInfo, Request, Response, StatusCode, ERROR_INVALID_ARGS, ERROR_UNKNOWN_COMMAND,
    GET_HEALTH_FUNCTION, INDUCE_FAULT_FUNCTION, PROTOCOL_VERSION, SHUTDOWN_FUNCTION,
    SYSTEM_COLLECTION,
};

use crate::engine::HeadlessEngine;
use crate::supervisor::LifecycleSupervisor;

pub type CommandResult = Result<Value, ErrorInfo>;
pub type CommandHandler = Arc<dyn Fn(&[Value]) -> CommandResult + Send + Sync>;

struct CommandFunction {
    arity: usize,
    handler: CommandHandler,
}

pub struct CommandCollection {
    name: String,
    functions: HashMap<String, CommandFunction>,
}

impl CommandCollection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            functions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_function<F>(mut self, name: &str, arity: usize, handler: F) -> Self
    where
        F: Fn(&[Value]) -> CommandResult + Send + Sync + 'static,
    {
        self.functions.insert(
            name.to_string(),
            CommandFunction {
                arity,
                handler: Arc::new(handler),
            },
        );
        self
    }
}

#[derive(Default)]
pub struct CommandRegistry {
    collections: HashMap<String, CommandCollection>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any collection already registered under the same name.
    pub fn register_collection(&mut self, collection: CommandCollection) {
        if self.collections.contains_key(collection.name()) {
            warn!(collection = collection.name(), "Replacing command collection");
        }
        self.collections
            .insert(collection.name().to_string(), collection);
    }

    /// Sorted `Collection.Function` names.
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .collections
            .values()
            .flat_map(|collection| {
                collection
                    .functions
                    .keys()
                    .map(move |function| format!("{}.{}", collection.name, function))
            })
            .collect();
        names.sort();
        names
    }

    pub fn dispatch(&self, request: Request) -> Response {
        let command = request.command_name();
        let Some(function) = self
            .collections
            .get(&request.collection)
            .and_then(|collection| collection.functions.get(&request.function))
        else {
            debug!(command = %command, "Unknown command");
            return Response::error(
                request.id,
                ERROR_UNKNOWN_COMMAND,
                format!("unknown command {}", command),
            );
        };

        if request.args.len() != function.arity {
            return Response::error(
                request.id,
                ERROR_INVALID_ARGS,
                format!(
                    "{} expects {} argument(s), got {}",
                    command,
                    function.arity,
                    request.args.len()
                ),
            );
        }

        debug!(command = %command, id = ?request.id, "Dispatching command");
        match (function.handler)(&request.args) {
            Ok(data) => Response::ok(request.id, data),
            Err(err) => Response::error_with_info(request.id, err),
        }
    }
}

/// State the `System` collection reads and acts on.
#[derive(Clone)]
pub struct SystemContext {
    pub supervisor: Arc<LifecycleSupervisor>,
    pub engine: Arc<HeadlessEngine>,
    pub crash_reporting: bool,
    pub allow_induced_fault: bool,
    pub started_at: DateTime<Utc>,
}

pub fn system_collection(context: SystemContext) -> CommandCollection {
    let supervisor = Arc::clone(&context.supervisor);
    let mut collection = CommandCollection::new(SYSTEM_COLLECTION)
        .register_function(SHUTDOWN_FUNCTION, 0, move |_| {
            supervisor.request_shutdown();
            Ok(json!([StatusCode::Ok.as_value()]))
        });

    let health = context.clone();
    collection = collection.register_function(GET_HEALTH_FUNCTION, 0, move |_| {
        Ok(json!([StatusCode::Ok.as_value(), health_report(&health)]))
    });

    if context.allow_induced_fault {
        let engine = Arc::clone(&context.engine);
        collection = collection.register_function(INDUCE_FAULT_FUNCTION, 1, move |args| {
            let message = args[0].as_str().ok_or_else(|| {
                ErrorInfo::new(ERROR_INVALID_ARGS, "fault message must be a string")
            })?;
            warn!(message, "Inducing fatal engine condition");
            engine.raise_fatal("%s", &[message.into()])
        });
    }

    collection
}

fn health_report(context: &SystemContext) -> Value {
    let supervisor = &context.supervisor;
    let now = Instant::now();
    let snapshot = supervisor.tracker().snapshot();
    let last_activity = snapshot.last_connect_at.max(snapshot.last_disconnect_at);
    let idle_shutdown_in_ms = supervisor
        .monitor()
        .idle_deadline(&snapshot)
        .map(|deadline| deadline.saturating_duration_since(now).as_millis() as u64);
    json!({
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
        "state": supervisor.state().as_str(),
        "active_connections": snapshot.active,
        "last_activity_ms_ago": now.saturating_duration_since(last_activity).as_millis() as u64,
        "idle_grace_ms": supervisor.monitor().grace_period().as_millis() as u64,
        "idle_shutdown_in_ms": idle_shutdown_in_ms,
        "crash_reporting": context.crash_reporting,
        "started_at": context.started_at.to_rfc3339(),
    })
}
