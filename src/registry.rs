//! Explicit registries the agent dispatches through: console commands,
//! remotely callable functions, summonable classes and event watchers.

use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Identifies one agent-side connection.
pub type ConnectionId = u64;

/// Marks a summon as needing its activation hook run immediately.
pub const FORCE_ACTIVATE_ARG: &str = "-ForceBeginPlay";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("unknown remote function '{0}'")]
    UnknownFunction(String),

    #[error("remote function '{name}' is bound to instance '{instance}' and cannot run remotely")]
    BoundFunction { name: String, instance: String },

    #[error("unknown summon class '{0}'")]
    UnknownClass(String),

    #[error("{0}")]
    Failed(String),
}

pub type CommandHandler = Box<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

/// Console-style commands, keyed by their first word.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    {
        self.commands.insert(name.to_ascii_lowercase(), Box::new(handler));
    }

    /// Runs `line`; the first word picks the command, the rest is its argument string.
    pub fn execute(&self, line: &str) -> Result<String, RegistryError> {
        let line = line.trim();
        let (name, args) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let handler = self
            .commands
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| RegistryError::UnknownCommand(name.to_string()))?;

        debug!("Executing command '{}'", line);
        handler(args.trim()).map_err(RegistryError::Failed)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(&name.to_ascii_lowercase())
    }
}

pub type RemoteHandler = Box<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

enum RemoteFunction {
    Static(RemoteHandler),
    Bound { instance: String, handler: RemoteHandler },
}

/// Functions callable by name over the wire.
///
/// Entries bound to an instance can be looked up locally but never run
/// on behalf of a remote caller.
#[derive(Default)]
pub struct RemoteFunctionRegistry {
    functions: HashMap<String, RemoteFunction>,
}

impl RemoteFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_static<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), RemoteFunction::Static(Box::new(handler)));
    }

    pub fn register_bound<F>(&mut self, name: &str, instance: &str, handler: F)
    where
        F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    {
        self.functions.insert(
            name.to_string(),
            RemoteFunction::Bound { instance: instance.to_string(), handler: Box::new(handler) },
        );
    }

    pub fn is_remote_callable(&self, name: &str) -> bool {
        matches!(self.functions.get(name), Some(RemoteFunction::Static(_)))
    }

    pub fn execute_remote(&self, name: &str, params: &str) -> Result<String, RegistryError> {
        match self.functions.get(name) {
            Some(RemoteFunction::Static(handler)) => handler(params).map_err(RegistryError::Failed),
            Some(RemoteFunction::Bound { instance, .. }) => Err(RegistryError::BoundFunction {
                name: name.to_string(),
                instance: instance.clone(),
            }),
            None => Err(RegistryError::UnknownFunction(name.to_string())),
        }
    }

    /// Local call, allowed for bound entries too.
    pub fn execute_local(&self, name: &str, params: &str) -> Result<String, RegistryError> {
        match self.functions.get(name) {
            Some(RemoteFunction::Static(handler)) | Some(RemoteFunction::Bound { handler, .. }) => {
                handler(params).map_err(RegistryError::Failed)
            }
            None => Err(RegistryError::UnknownFunction(name.to_string())),
        }
    }
}

/// An object created by a summon request.
pub trait SummonedObject: Send {
    fn class_name(&self) -> &str;

    /// Activation hook, normally run when the object enters play
    fn activate(&mut self);

    fn is_active(&self) -> bool;
}

/// Plain summoned object that only records its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedObject {
    pub class_name: String,
    pub args: Vec<String>,
    pub active: bool,
}

impl SummonedObject for SpawnedObject {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn activate(&mut self) {
        self.active = true;
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

pub type SummonConstructor = Box<dyn Fn(&[String]) -> Box<dyn SummonedObject> + Send + Sync>;

#[derive(Default)]
pub struct SummonRegistry {
    classes: HashMap<String, SummonConstructor>,
}

impl SummonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, class_name: &str, constructor: F)
    where
        F: Fn(&[String]) -> Box<dyn SummonedObject> + Send + Sync + 'static,
    {
        self.classes.insert(class_name.to_string(), Box::new(constructor));
    }

    /// Registers a class that spawns a [`SpawnedObject`].
    pub fn register_plain(&mut self, class_name: &str) {
        let class = class_name.to_string();
        self.register(class_name, move |args| {
            Box::new(SpawnedObject { class_name: class.clone(), args: args.to_vec(), active: false })
        });
    }

    /// Summons from a payload of the form `Class arg arg...`.
    pub fn summon(&self, payload: &str) -> Result<Box<dyn SummonedObject>, RegistryError> {
        let mut words = payload.split_whitespace();
        let class_name = words.next().unwrap_or_default();
        let args: Vec<String> = words.map(str::to_string).collect();

        let constructor = self
            .classes
            .get(class_name)
            .ok_or_else(|| RegistryError::UnknownClass(class_name.to_string()))?;

        let mut object = constructor(&args);
        if args.iter().any(|a| a.eq_ignore_ascii_case(FORCE_ACTIVATE_ARG)) {
            object.activate();
        }

        info!("Summoned {} (active: {})", object.class_name(), object.is_active());
        Ok(object)
    }
}

/// Single watcher slot per event name.
///
/// Registering overwrites the previous watcher, so only the most recent
/// registrant receives the notification.
#[derive(Debug, Default)]
pub struct EventWatchRegistry {
    slots: HashMap<String, ConnectionId>,
}

impl EventWatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the watcher that was replaced, if any.
    pub fn register(&mut self, event: &str, connection: ConnectionId) -> Option<ConnectionId> {
        let previous = self.slots.insert(event.to_string(), connection);
        if let Some(previous) = previous.filter(|p| *p != connection) {
            warn!("Event '{}' watcher {} overridden by {}", event, previous, connection);
        }
        previous
    }

    /// Clears the slot only when `connection` still holds it.
    pub fn unregister(&mut self, event: &str, connection: ConnectionId) -> bool {
        if self.slots.get(event) == Some(&connection) {
            self.slots.remove(event);
            true
        } else {
            false
        }
    }

    pub fn remove_connection(&mut self, connection: ConnectionId) {
        self.slots.retain(|_, c| *c != connection);
    }

    pub fn watcher(&self, event: &str) -> Option<ConnectionId> {
        self.slots.get(event).copied()
    }
}
