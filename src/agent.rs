//! Cooperating server-side agent.
//!
//! Speaks the handshake the minimal client expects, offers a configured set
//! of actors and services harness control messages. Used in-process by the
//! integration tests and standalone through `netunit agent`.

use crate::codec::{Bunch, BunchCodec, ChannelMessage, ControlChannelCodec, ControlCommand, ControlMessage};
use crate::error::CodecError;
use crate::registry::{
    CommandRegistry, ConnectionId, EventWatchRegistry, RemoteFunctionRegistry, SummonRegistry,
};
use crate::suspend::{pipe_path, wait_for_resume};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Protocol version clients must present
    pub version: String,
    pub map: String,
    pub game: String,
    /// Actor classes offered to every joined client, in order
    pub offered_actors: Vec<String>,
    /// Beacon types that are accepted
    pub beacon_types: Vec<String>,
    pub suspend_pipe_prefix: String,
    /// Process id used to name the resume pipe
    pub suspend_pid: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            map: "Entry".to_string(),
            game: "NullUnitEnv".to_string(),
            offered_actors: vec!["PlayerController".to_string(), "Pawn".to_string(), "NUTActor".to_string()],
            beacon_types: Vec::new(),
            suspend_pipe_prefix: "/tmp/netunit-suspend-".to_string(),
            suspend_pid: std::process::id(),
        }
    }
}

/// Dispatch tables the agent serves from.
#[derive(Default)]
pub struct AgentRegistries {
    pub commands: CommandRegistry,
    pub functions: RemoteFunctionRegistry,
    pub summons: SummonRegistry,
}

impl AgentRegistries {
    /// `echo` and `log` commands, a static `ServerEcho` function and a
    /// summonable `NUTActor`.
    pub fn with_defaults() -> Self {
        let mut registries = Self::default();
        registries.commands.register("echo", |args| Ok(args.to_string()));
        registries.commands.register("log", |args| {
            info!(target: "netunit::agent", "{}", args);
            Ok(String::new())
        });
        registries.functions.register_static("ServerEcho", |params| Ok(params.to_string()));
        registries.summons.register_plain("NUTActor");
        registries
    }
}

struct Connection {
    outgoing: mpsc::UnboundedSender<ControlMessage>,
    close: Arc<Notify>,
}

struct AgentShared {
    config: AgentConfig,
    registries: AgentRegistries,
    watchers: Mutex<EventWatchRegistry>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    received_rpcs: Mutex<Vec<(String, String)>>,
    accepted_actors: Mutex<Vec<String>>,
    pings_answered: AtomicUsize,
    next_connection: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AgentServer;

impl AgentServer {
    /// Binds the agent and starts accepting connections.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: AgentConfig,
        registries: AgentRegistries,
    ) -> std::io::Result<AgentHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Agent listening on {}", local_addr);

        let shared = Arc::new(AgentShared {
            config,
            registries,
            watchers: Mutex::new(EventWatchRegistry::new()),
            connections: Mutex::new(HashMap::new()),
            received_rpcs: Mutex::new(Vec::new()),
            accepted_actors: Mutex::new(Vec::new()),
            pings_answered: AtomicUsize::new(0),
            next_connection: AtomicU64::new(1),
        });

        let task = tokio::spawn(accept_loop(listener, shared.clone()));
        Ok(AgentHandle { local_addr, shared, task })
    }
}

/// Running agent. Dropping it stops the agent and all its connections.
pub struct AgentHandle {
    local_addr: SocketAddr,
    shared: Arc<AgentShared>,
    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sends `NotifyEvent(event)` to the connection currently watching it.
    pub fn notify_event(&self, event: &str) -> bool {
        let Some(watcher) = lock(&self.shared.watchers).watcher(event) else {
            debug!("No watcher for event '{}'", event);
            return false;
        };

        match lock(&self.shared.connections).get(&watcher) {
            Some(connection) => connection
                .outgoing
                .send(ControlMessage::new(ControlCommand::NotifyEvent, event))
                .is_ok(),
            None => false,
        }
    }

    pub fn watcher_of(&self, event: &str) -> Option<ConnectionId> {
        lock(&self.shared.watchers).watcher(event)
    }

    pub fn received_rpcs(&self) -> Vec<(String, String)> {
        lock(&self.shared.received_rpcs).clone()
    }

    pub fn accepted_actors(&self) -> Vec<String> {
        lock(&self.shared.accepted_actors).clone()
    }

    pub fn pings_answered(&self) -> usize {
        self.shared.pings_answered.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared.connections).len()
    }

    /// Drops every client connection; the listener keeps running.
    pub fn disconnect_all(&self) {
        for connection in lock(&self.shared.connections).values() {
            connection.close.notify_one();
        }
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<AgentShared>) {
    // Dropping the set aborts the connection tasks with the listener
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = shared.next_connection.fetch_add(1, Ordering::SeqCst);
                    info!("Agent accepted connection {} from {}", id, peer);
                    let _ = stream.set_nodelay(true);
                    connections.spawn(serve_connection(id, stream, shared.clone()));
                }
                Err(e) => {
                    error!("Agent accept failed: {}", e);
                    break;
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    warn!("Agent connection task failed: {}", e);
                }
            }
        }
    }
}

type AgentTransport = Framed<TcpStream, BunchCodec>;

async fn serve_connection(id: ConnectionId, stream: TcpStream, shared: Arc<AgentShared>) {
    let mut framed = Framed::new(stream, BunchCodec::new());
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel();
    let close = Arc::new(Notify::new());

    match handshake(&shared.config, &mut framed).await {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            warn!("Agent handshake with {} failed: {}", id, e);
            return;
        }
    }

    lock(&shared.connections).insert(id, Connection { outgoing: outgoing_tx, close: close.clone() });

    let result = async {
        loop {
            tokio::select! {
                bunch = framed.next() => match bunch {
                    Some(Ok(bunch)) => handle_bunch(id, bunch, &shared, &mut framed).await?,
                    Some(Err(e)) => return Err(e.to_string()),
                    None => return Ok(()),
                },
                Some(message) = outgoing_rx.recv() => {
                    framed.send(Bunch::Control(message)).await.map_err(|e| e.to_string())?;
                }
                _ = close.notified() => {
                    info!("Agent closing connection {}", id);
                    return Ok(());
                }
            }
        }
    }
    .await;

    if let Err(e) = result {
        warn!("Agent connection {} ended: {}", id, e);
    }

    lock(&shared.connections).remove(&id);
    lock(&shared.watchers).remove_connection(id);
    debug!("Agent connection {} closed", id);
}

/// Returns `Ok(false)` when the client was turned away.
async fn handshake(config: &AgentConfig, framed: &mut AgentTransport) -> Result<bool, String> {
    let version = match next_generic(framed).await? {
        ChannelMessage::Hello { version } => version,
        other => return Err(format!("expected hello, got {:?}", other)),
    };

    if version != config.version {
        let reason = format!("client version {} does not match {}", version, config.version);
        send_generic(framed, ChannelMessage::Upgrade { reason }).await?;
        return Ok(false);
    }

    send_generic(
        framed,
        ChannelMessage::Welcome { map: config.map.clone(), game: config.game.clone() },
    )
    .await?;

    match next_generic(framed).await? {
        ChannelMessage::Join => {
            for (index, class_name) in config.offered_actors.iter().enumerate() {
                let actor_id = u32::try_from(index + 1).map_err(|e| e.to_string())?;
                send_generic(framed, ChannelMessage::ActorOffer { actor_id, class_name: class_name.clone() }).await?;
            }
            Ok(true)
        }
        ChannelMessage::BeaconJoin { beacon_type } => {
            if config.beacon_types.contains(&beacon_type) {
                send_generic(framed, ChannelMessage::BeaconWelcome).await?;
                Ok(true)
            } else {
                let reason = format!("unknown beacon type '{}'", beacon_type);
                send_generic(framed, ChannelMessage::Failure { reason }).await?;
                Ok(false)
            }
        }
        other => Err(format!("expected join, got {:?}", other)),
    }
}

async fn next_generic(framed: &mut AgentTransport) -> Result<ChannelMessage, String> {
    match framed.next().await {
        Some(Ok(Bunch::Generic(message))) => Ok(message),
        Some(Ok(Bunch::Control(message))) => Err(format!("control message {} during handshake", message.kind)),
        Some(Err(e)) => Err(e.to_string()),
        None => Err("connection closed during handshake".to_string()),
    }
}

async fn send_generic(framed: &mut AgentTransport, message: ChannelMessage) -> Result<(), String> {
    framed.send(Bunch::Generic(message)).await.map_err(|e| e.to_string())
}

/// Replies too large for a bunch are turned into a `CommandFailed`.
async fn reply(framed: &mut AgentTransport, kind: ControlCommand, payload: String) -> Result<(), String> {
    let mut message = ControlMessage::new(kind, payload);
    if let Err(CodecError::FrameTooLarge(size)) = ControlChannelCodec::encode(&message) {
        warn!("{} reply of {} bytes does not fit a bunch", kind, size);
        message = ControlMessage::new(ControlCommand::CommandFailed, format!("reply of {} bytes too large", size));
    }
    framed
        .send(Bunch::Control(message))
        .await
        .map_err(|e| e.to_string())
}

async fn handle_bunch(
    id: ConnectionId,
    bunch: Bunch,
    shared: &AgentShared,
    framed: &mut AgentTransport,
) -> Result<(), String> {
    let message = match bunch {
        Bunch::Control(message) => message,
        Bunch::Generic(ChannelMessage::ActorReply { actor_id, accepted }) => {
            let index = usize::try_from(actor_id).unwrap_or(usize::MAX).saturating_sub(1);
            if let Some(class_name) = shared.config.offered_actors.get(index).filter(|_| accepted) {
                lock(&shared.accepted_actors).push(class_name.clone());
            }
            return Ok(());
        }
        Bunch::Generic(ChannelMessage::Rpc { name, params }) => {
            lock(&shared.received_rpcs).push((name.clone(), params.clone()));
            match shared.registries.functions.execute_remote(&name, &params) {
                Ok(result) => debug!("RPC {} returned '{}'", name, result),
                Err(e) => warn!("RPC {} rejected: {}", name, e),
            }
            return Ok(());
        }
        Bunch::Generic(other) => {
            debug!("Agent ignoring {:?} from {}", other, id);
            return Ok(());
        }
    };

    match message.kind {
        ControlCommand::Ping => {
            shared.pings_answered.fetch_add(1, Ordering::SeqCst);
            reply(framed, ControlCommand::Pong, String::new()).await
        }
        ControlCommand::NoResultCommand => {
            if let Err(e) = shared.registries.commands.execute(&message.payload) {
                warn!("Command '{}' failed: {}", message.payload, e);
            }
            Ok(())
        }
        ControlCommand::SendResultCommand => match shared.registries.commands.execute(&message.payload) {
            Ok(output) => reply(framed, ControlCommand::CommandSucceeded, output).await,
            Err(e) => reply(framed, ControlCommand::CommandFailed, e.to_string()).await,
        },
        ControlCommand::WatchEvent => {
            lock(&shared.watchers).register(&message.payload, id);
            info!("Connection {} watching event '{}'", id, message.payload);
            Ok(())
        }
        ControlCommand::Summon => match shared.registries.summons.summon(&message.payload) {
            Ok(object) => {
                reply(framed, ControlCommand::CommandSucceeded, format!("Summoned {}", object.class_name())).await
            }
            Err(e) => reply(framed, ControlCommand::CommandFailed, e.to_string()).await,
        },
        ControlCommand::SuspendProcess => {
            let path = pipe_path(&shared.config.suspend_pipe_prefix, shared.config.suspend_pid);
            info!("Suspending until resumed through {:?}", path);

            // The connection is not serviced while suspended
            wait_for_resume(path).await.map_err(|e| format!("resume wait failed: {}", e))?;
            info!("Resumed");
            Ok(())
        }
        ControlCommand::Pong
        | ControlCommand::CommandFailed
        | ControlCommand::CommandSucceeded
        | ControlCommand::NotifyEvent => {
            warn!("Agent received {} which only flows to the harness", message.kind);
            Ok(())
        }
    }
}
