use crate::codec::{frame_codec, ChannelMessage, ControlChannelCodec, ControlCommand, ControlMessage};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Transport state of the minimal client's single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Open,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Read-only view of the connection state. Only the client mutates it.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Waits until the state satisfies `predicate`.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&ConnectionState) -> bool) -> ConnectionState {
        match self.state.wait_for(predicate).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    /// Join the game as a player
    Game,
    /// Reach the server through a beacon of the given type
    Beacon(String),
}

/// Decides, synchronously, whether an offered actor class is admitted.
pub type ActorFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Hook points raised by the client, collected by the owner each tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected { map: String, game: String },
    /// Raw custom control-channel bunch for the control codec
    ControlBunch(Bytes),
    ActorAccepted { actor_id: u32, class_name: String },
    ActorBlocked { actor_id: u32, class_name: String },
    NetworkFailure(String),
    RpcObserved { name: String, success: bool },
}

#[derive(Clone)]
pub struct MinimalClientConfig {
    /// `host:port` of the server under test
    pub address: String,
    pub mode: ConnectMode,
    /// Protocol version sent in the hello
    pub version: String,
    pub actor_filter: ActorFilter,
    pub connect_timeout: Duration,
}

impl fmt::Debug for MinimalClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinimalClientConfig")
            .field("address", &self.address)
            .field("mode", &self.mode)
            .field("version", &self.version)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

struct Outgoing {
    bunch: Bytes,
    /// Set for RPCs so their transmission is reported
    rpc: Option<String>,
}

/// Reduced network client: connects, performs the join handshake and then
/// only moves control bunches, actor decisions and RPCs.
///
/// All socket work happens on a spawned task; sends are queued and never
/// block the caller.
pub struct MinimalClient {
    state: Arc<watch::Sender<ConnectionState>>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    task: JoinHandle<()>,
}

impl MinimalClient {
    /// Starts connecting in the background. Must be called within a tokio runtime.
    pub fn connect(config: MinimalClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Pending);
        let state = Arc::new(state_tx);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!("Minimal client connecting to {} ({:?})", config.address, config.mode);
        let task = tokio::spawn(run_connection(config, state.clone(), outgoing_rx, event_tx));

        Self { state, outgoing: outgoing_tx, events: event_rx, task }
    }

    pub fn connection(&self) -> ConnectionHandle {
        ConnectionHandle { state: self.state.subscribe() }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Queues a control message. Returns `false` when the connection is not
    /// open, or when the message does not fit a bunch; the connection is left
    /// untouched either way.
    pub fn send_control_message(&self, kind: ControlCommand, payload: &str) -> bool {
        if self.state() != ConnectionState::Open {
            debug!("Not sending {}: connection is {}", kind, self.state());
            return false;
        }

        let bunch = match ControlChannelCodec::encode(&ControlMessage::new(kind, payload)) {
            Ok(bunch) => bunch,
            Err(e) => {
                warn!("Not sending {}: {}", kind, e);
                return false;
            }
        };
        self.outgoing.send(Outgoing { bunch, rpc: None }).is_ok()
    }

    /// Queues a remote call. Whether it went out is reported as
    /// [`ClientEvent::RpcObserved`].
    pub fn send_rpc(&self, name: &str, params: &str) -> bool {
        if self.state() != ConnectionState::Open {
            return false;
        }

        let bunch = match (ChannelMessage::Rpc { name: name.to_string(), params: params.to_string() }).to_bytes() {
            Ok(bunch) => bunch,
            Err(e) => {
                warn!("Not sending RPC {}: {}", name, e);
                return false;
            }
        };
        self.outgoing
            .send(Outgoing { bunch, rpc: Some(name.to_string()) })
            .is_ok()
    }

    /// Drains the events raised since the last call.
    pub fn poll_events(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Waits for the next event; `None` once the connection task is gone.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    pub fn close(&mut self) {
        if self.state() != ConnectionState::Closed {
            info!("Closing minimal client");
        }
        self.task.abort();
        self.state.send_replace(ConnectionState::Closed);
    }
}

impl Drop for MinimalClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_connection(
    config: MinimalClientConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let fail = |reason: String| {
        warn!("Minimal client network failure: {}", reason);
        state.send_replace(ConnectionState::Closed);
        let _ = events.send(ClientEvent::NetworkFailure(reason));
    };

    let stream = match timeout(config.connect_timeout, TcpStream::connect(&config.address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return fail(format!("connect to {} failed: {}", config.address, e)),
        Err(_) => return fail(format!("connect to {} timed out", config.address)),
    };
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, frame_codec());

    if let Err(reason) = handshake(&config, &mut framed, &events).await {
        return fail(reason);
    }

    state.send_replace(ConnectionState::Open);

    loop {
        tokio::select! {
            frame = framed.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame.freeze(),
                    Some(Err(e)) => return fail(format!("receive failed: {}", e)),
                    None => return fail("connection closed by server".to_string()),
                };

                if let Err(reason) = handle_bunch(&config, frame, &mut framed, &events).await {
                    return fail(reason);
                }
            }
            message = outgoing.recv() => {
                let Some(Outgoing { bunch, rpc }) = message else {
                    break;
                };

                let sent = framed.send(bunch).await;
                if let Some(name) = rpc {
                    let _ = events.send(ClientEvent::RpcObserved { name, success: sent.is_ok() });
                }
                if let Err(e) = sent {
                    return fail(format!("send failed: {}", e));
                }
            }
        }
    }

    state.send_replace(ConnectionState::Closed);
}

type Transport = Framed<TcpStream, LengthDelimitedCodec>;

async fn handshake(
    config: &MinimalClientConfig,
    framed: &mut Transport,
    events: &mpsc::UnboundedSender<ClientEvent>,
) -> Result<(), String> {
    send_message(framed, &ChannelMessage::Hello { version: config.version.clone() }).await?;

    let (map, game) = match receive_message(framed).await? {
        ChannelMessage::Welcome { map, game } => (map, game),
        ChannelMessage::Upgrade { reason } => return Err(format!("server requires upgrade: {}", reason)),
        ChannelMessage::Failure { reason } => return Err(format!("server rejected connection: {}", reason)),
        other => return Err(format!("unexpected handshake reply: {:?}", other)),
    };

    match &config.mode {
        ConnectMode::Game => {
            send_message(framed, &ChannelMessage::Join).await?;
        }
        ConnectMode::Beacon(beacon_type) => {
            send_message(framed, &ChannelMessage::BeaconJoin { beacon_type: beacon_type.clone() }).await?;
            match receive_message(framed).await? {
                ChannelMessage::BeaconWelcome => {}
                ChannelMessage::Failure { reason } => return Err(format!("beacon rejected: {}", reason)),
                other => return Err(format!("unexpected beacon reply: {:?}", other)),
            }
        }
    }

    info!("Minimal client connected (map '{}', game '{}')", map, game);
    let _ = events.send(ClientEvent::Connected { map, game });
    Ok(())
}

async fn handle_bunch(
    config: &MinimalClientConfig,
    frame: Bytes,
    framed: &mut Transport,
    events: &mpsc::UnboundedSender<ClientEvent>,
) -> Result<(), String> {
    if ControlChannelCodec::is_control_bunch(&frame) {
        let _ = events.send(ClientEvent::ControlBunch(frame));
        return Ok(());
    }

    let message = match ChannelMessage::decode(&frame) {
        Ok(message) => message,
        Err(e) => {
            // Traffic the minimal client does not model
            debug!("Ignoring undecodable bunch: {}", e);
            return Ok(());
        }
    };

    match message {
        ChannelMessage::ActorOffer { actor_id, class_name } => {
            let accepted = (config.actor_filter)(&class_name);
            debug!("Actor {} ({}) {}", actor_id, class_name, if accepted { "accepted" } else { "blocked" });

            send_message(framed, &ChannelMessage::ActorReply { actor_id, accepted }).await?;
            let event = if accepted {
                ClientEvent::ActorAccepted { actor_id, class_name }
            } else {
                ClientEvent::ActorBlocked { actor_id, class_name }
            };
            let _ = events.send(event);
            Ok(())
        }
        ChannelMessage::Failure { reason } => Err(reason),
        other => {
            debug!("Ignoring channel message {:?}", other);
            Ok(())
        }
    }
}

async fn send_message(framed: &mut Transport, message: &ChannelMessage) -> Result<(), String> {
    let bunch = message.to_bytes().map_err(|e| format!("encode failed: {}", e))?;
    framed
        .send(bunch)
        .await
        .map_err(|e| format!("send failed: {}", e))
}

async fn receive_message(framed: &mut Transport) -> Result<ChannelMessage, String> {
    match framed.next().await {
        Some(Ok(frame)) => ChannelMessage::decode(&frame).map_err(|e| format!("bad handshake bunch: {}", e)),
        Some(Err(e)) => Err(format!("receive failed: {}", e)),
        None => Err("connection closed during handshake".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Bunch;
    use tokio::net::TcpListener;

    fn config(address: String, mode: ConnectMode) -> MinimalClientConfig {
        MinimalClientConfig {
            address,
            mode,
            version: "1".to_string(),
            actor_filter: Arc::new(|class: &str| class == "PlayerController"),
            connect_timeout: Duration::from_secs(2),
        }
    }

    async fn accept(listener: &TcpListener) -> Transport {
        let (stream, _) = listener.accept().await.unwrap();
        Framed::new(stream, frame_codec())
    }

    async fn expect(server: &mut Transport) -> Bunch {
        let frame = timeout(Duration::from_secs(5), server.next()).await.unwrap().unwrap().unwrap();
        Bunch::decode(&frame).unwrap()
    }

    async fn reply(server: &mut Transport, message: ChannelMessage) {
        server.send(message.to_bytes().unwrap()).await.unwrap();
    }

    async fn next_event(client: &mut MinimalClient) -> ClientEvent {
        timeout(Duration::from_secs(5), client.next_event()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_handshake_and_control_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut client = MinimalClient::connect(config(address, ConnectMode::Game));

        // Not open yet: send is refused rather than queued
        assert!(!client.send_control_message(ControlCommand::Ping, ""));

        let mut server = accept(&listener).await;
        assert_eq!(expect(&mut server).await, Bunch::Generic(ChannelMessage::Hello { version: "1".into() }));
        reply(&mut server, ChannelMessage::Welcome { map: "Entry".into(), game: "NullUnitEnv".into() }).await;
        assert_eq!(expect(&mut server).await, Bunch::Generic(ChannelMessage::Join));

        assert_eq!(
            next_event(&mut client).await,
            ClientEvent::Connected { map: "Entry".into(), game: "NullUnitEnv".into() }
        );
        client.connection().wait_for(|s| *s == ConnectionState::Open).await;

        assert!(client.send_control_message(ControlCommand::SendResultCommand, "stat fps"));
        assert!(client.send_control_message(ControlCommand::Ping, ""));
        assert_eq!(
            expect(&mut server).await,
            Bunch::Control(ControlMessage::new(ControlCommand::SendResultCommand, "stat fps"))
        );
        assert_eq!(expect(&mut server).await, Bunch::Control(ControlMessage::new(ControlCommand::Ping, "")));

        let pong = ControlChannelCodec::encode(&ControlMessage::new(ControlCommand::Pong, "")).unwrap();
        server.send(pong.clone()).await.unwrap();
        assert_eq!(next_event(&mut client).await, ClientEvent::ControlBunch(pong));
    }

    #[tokio::test]
    async fn test_actor_filter_decides_offers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut client = MinimalClient::connect(config(address, ConnectMode::Game));

        let mut server = accept(&listener).await;
        expect(&mut server).await;
        reply(&mut server, ChannelMessage::Welcome { map: "Entry".into(), game: "G".into() }).await;
        expect(&mut server).await;
        next_event(&mut client).await;

        reply(&mut server, ChannelMessage::ActorOffer { actor_id: 1, class_name: "PlayerController".into() }).await;
        reply(&mut server, ChannelMessage::ActorOffer { actor_id: 2, class_name: "Projectile".into() }).await;

        assert_eq!(
            expect(&mut server).await,
            Bunch::Generic(ChannelMessage::ActorReply { actor_id: 1, accepted: true })
        );
        assert_eq!(
            expect(&mut server).await,
            Bunch::Generic(ChannelMessage::ActorReply { actor_id: 2, accepted: false })
        );
        assert_eq!(
            next_event(&mut client).await,
            ClientEvent::ActorAccepted { actor_id: 1, class_name: "PlayerController".into() }
        );
        assert_eq!(
            next_event(&mut client).await,
            ClientEvent::ActorBlocked { actor_id: 2, class_name: "Projectile".into() }
        );
    }

    #[tokio::test]
    async fn test_upgrade_reply_is_network_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut client = MinimalClient::connect(config(address, ConnectMode::Game));

        let mut server = accept(&listener).await;
        expect(&mut server).await;
        reply(&mut server, ChannelMessage::Upgrade { reason: "version 2 required".into() }).await;

        match next_event(&mut client).await {
            ClientEvent::NetworkFailure(reason) => assert!(reason.contains("version 2 required")),
            other => panic!("expected network failure, got {:?}", other),
        }
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_beacon_waits_for_beacon_welcome() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut client = MinimalClient::connect(config(address, ConnectMode::Beacon("TestBeacon".into())));

        let mut server = accept(&listener).await;
        expect(&mut server).await;
        reply(&mut server, ChannelMessage::Welcome { map: "Entry".into(), game: "G".into() }).await;
        assert_eq!(
            expect(&mut server).await,
            Bunch::Generic(ChannelMessage::BeaconJoin { beacon_type: "TestBeacon".into() })
        );
        assert_eq!(client.state(), ConnectionState::Pending);

        reply(&mut server, ChannelMessage::BeaconWelcome).await;
        assert!(matches!(next_event(&mut client).await, ClientEvent::Connected { .. }));
    }

    #[tokio::test]
    async fn test_server_drop_reported_once_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut client = MinimalClient::connect(config(address, ConnectMode::Game));

        let mut server = accept(&listener).await;
        expect(&mut server).await;
        reply(&mut server, ChannelMessage::Welcome { map: "Entry".into(), game: "G".into() }).await;
        expect(&mut server).await;
        next_event(&mut client).await;
        drop(server);

        assert!(matches!(next_event(&mut client).await, ClientEvent::NetworkFailure(_)));
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(!client.send_control_message(ControlCommand::Ping, ""));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let mut client = MinimalClient::connect(config(address, ConnectMode::Game));
        assert!(matches!(next_event(&mut client).await, ClientEvent::NetworkFailure(_)));
    }

    #[tokio::test]
    async fn test_oversize_send_refused_and_connection_kept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut client = MinimalClient::connect(config(address, ConnectMode::Game));

        let mut server = accept(&listener).await;
        expect(&mut server).await;
        reply(&mut server, ChannelMessage::Welcome { map: "Entry".into(), game: "G".into() }).await;
        expect(&mut server).await;
        next_event(&mut client).await;
        client.connection().wait_for(|s| *s == ConnectionState::Open).await;

        let huge = "x".repeat(crate::codec::MAX_BUNCH_SIZE);
        assert!(!client.send_control_message(ControlCommand::SendResultCommand, &huge));
        assert!(!client.send_rpc("ServerEcho", &huge));
        assert_eq!(client.state(), ConnectionState::Open);

        // The connection still carries the next message
        assert!(client.send_control_message(ControlCommand::Ping, ""));
        assert_eq!(expect(&mut server).await, Bunch::Control(ControlMessage::new(ControlCommand::Ping, "")));
        assert!(client.poll_events().is_empty());
    }
}
