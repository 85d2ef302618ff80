//! A single remote peer and its connection worker.
//!
//! [`Peer`] is a cheap handle shared between the connection worker, the
//! [`PeerManager`](crate::PeerManager) registry and the sync engine. The
//! worker owns the socket and the [`TaskQueue`]; everything else talks to
//! it through an unbounded command channel, so writes to one peer are
//! serialized in the order they were issued.
//!
//! Lifecycle: `connecting → awaiting handshake → connected (ready ⇄ busy)
//! → disconnected`. A peer counts as connected once it has both sent its
//! `version` and acknowledged ours.

use crate::bloom::BloomFilter;
use crate::connection::{build_version, validate_version, ConnectionConfig, PeerConnection};
use crate::task::{PeerTask, QueueEvent, TaskMessage, TaskQueue};
use crate::timer::{PeerTimer, TimerEvent};
use crate::{Message, NetworkError, PeerError};
use futures::stream::StreamExt;
use futures::SinkExt;
use parking_lot::{Mutex, RwLock};
use spv_consensus::MerkleBlockExtractor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Worker wake-up period for timers and task timeouts.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Callbacks from a peer's worker.
pub trait PeerListener: Send + Sync {
    /// Handshake finished.
    fn on_connect(&self, peer: &Arc<Peer>);
    /// Task queue drained.
    fn on_ready(&self, peer: &Arc<Peer>);
    /// Worker stopped. Called exactly once per started peer.
    fn on_disconnect(&self, peer: &Arc<Peer>, error: Option<PeerError>);
    /// A message no task consumed.
    fn on_receive_message(&self, peer: &Arc<Peer>, message: Message);
    /// A task completed.
    fn on_task_complete(&self, peer: &Arc<Peer>, task: Box<dyn PeerTask>);
}

/// Mutable peer flags.
#[derive(Debug, Clone, Default)]
pub struct PeerStatus {
    pub connected: bool,
    pub synced: bool,
    pub block_hashes_synced: bool,
    /// Height from the peer's `version`.
    pub announced_height: u32,
    /// Our height when the peer was created.
    pub local_best_height: u32,
    /// TCP connect latency.
    pub connection_time: Option<Duration>,
}

enum PeerCommand {
    AddTask(Box<dyn PeerTask>),
    Send(Message),
    Close(Option<PeerError>),
}

#[derive(Default)]
struct Handshake {
    version_received: bool,
    verack_received: bool,
}

/// Per-connection state owned by the worker.
struct Session {
    queue: TaskQueue,
    timer: PeerTimer,
    handshake: Handshake,
    outbox: Vec<Message>,
}

/// A remote peer.
pub struct Peer {
    host: String,
    config: ConnectionConfig,
    extractor: MerkleBlockExtractor,
    status: RwLock<PeerStatus>,
    pending_tasks: AtomicUsize,
    commands: mpsc::UnboundedSender<PeerCommand>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<PeerCommand>>>,
    listener: Weak<dyn PeerListener>,
}

impl Peer {
    pub fn new(
        host: impl Into<String>,
        config: ConnectionConfig,
        extractor: MerkleBlockExtractor,
        listener: Weak<dyn PeerListener>,
    ) -> Arc<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            host: host.into(),
            config,
            extractor,
            status: RwLock::new(PeerStatus::default()),
            pending_tasks: AtomicUsize::new(0),
            commands,
            receiver: Mutex::new(Some(receiver)),
            listener,
        })
    }

    /// IP address string.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Snapshot of the peer flags.
    pub fn status(&self) -> PeerStatus {
        self.status.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.read().connected
    }

    /// Connected with no queued tasks.
    pub fn ready(&self) -> bool {
        self.is_connected() && self.pending_tasks.load(Ordering::SeqCst) == 0
    }

    pub fn synced(&self) -> bool {
        self.status.read().synced
    }

    pub fn set_synced(&self, synced: bool) {
        self.status.write().synced = synced;
    }

    pub fn block_hashes_synced(&self) -> bool {
        self.status.read().block_hashes_synced
    }

    pub fn set_block_hashes_synced(&self, synced: bool) {
        self.status.write().block_hashes_synced = synced;
    }

    pub fn announced_height(&self) -> u32 {
        self.status.read().announced_height
    }

    pub fn local_best_height(&self) -> u32 {
        self.status.read().local_best_height
    }

    /// Used to reject peers behind us during the handshake.
    pub fn set_local_best_height(&self, height: u32) {
        self.status.write().local_best_height = height;
    }

    pub fn connection_time(&self) -> Option<Duration> {
        self.status.read().connection_time
    }

    pub(crate) fn update_status(&self, update: impl FnOnce(&mut PeerStatus)) {
        update(&mut self.status.write());
    }

    /// Queue a task. The peer is busy until it completes.
    pub fn add_task(&self, task: Box<dyn PeerTask>) {
        self.pending_tasks.fetch_add(1, Ordering::SeqCst);
        if self.commands.send(PeerCommand::AddTask(task)).is_err() {
            self.pending_tasks.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Write a message.
    pub fn send(&self, message: Message) {
        let _ = self.commands.send(PeerCommand::Send(message));
    }

    pub fn filter_load(&self, filter: &BloomFilter) {
        self.send(Message::FilterLoad(filter.to_message()));
    }

    pub fn send_mempool(&self) {
        self.send(Message::MemPool);
    }

    /// Close the connection. Repeated calls are harmless.
    pub fn close(&self, error: Option<PeerError>) {
        let _ = self.commands.send(PeerCommand::Close(error));
    }

    /// Spawn the connection worker.
    pub fn start(self: &Arc<Self>) {
        let Some(receiver) = self.receiver.lock().take() else {
            warn!(peer = %self.host, "Peer already started");
            return;
        };
        let peer = self.clone();
        tokio::spawn(async move { peer.run(receiver).await });
    }

    fn listener(&self) -> Option<Arc<dyn PeerListener>> {
        self.listener.upgrade()
    }

    async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<PeerCommand>) {
        let result = self.run_connection(&mut commands).await;

        self.status.write().connected = false;
        self.pending_tasks.store(0, Ordering::SeqCst);

        let error = result.err();
        match &error {
            Some(e) => info!(peer = %self.host, error = %e, "Peer disconnected"),
            None => info!(peer = %self.host, "Peer disconnected"),
        }
        if let Some(listener) = self.listener() {
            listener.on_disconnect(&self, error);
        }
    }

    async fn run_connection(
        self: &Arc<Self>,
        commands: &mut mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Result<(), PeerError> {
        let mut early = Vec::new();
        let connect = PeerConnection::connect(&self.host, &self.config);
        tokio::pin!(connect);

        let connection = loop {
            tokio::select! {
                result = &mut connect => break result?,
                command = commands.recv() => match command {
                    Some(PeerCommand::Close(error)) => return error.map_or(Ok(()), Err),
                    Some(other) => early.push(other),
                    None => return Ok(()),
                },
            }
        };

        self.status.write().connection_time = Some(connection.latency);
        let version = build_version(&self.config, &connection.addr, self.local_best_height());

        let (mut sink, mut stream) = connection.framed.split();
        sink.send(Message::Version(version)).await?;

        let mut session = Session {
            queue: TaskQueue::new(self.config.protocol_version),
            timer: PeerTimer::new(),
            handshake: Handshake::default(),
            outbox: Vec::new(),
        };
        for command in early {
            if let Some(result) = self.handle_command(command, &mut session) {
                return result;
            }
        }

        let mut tick = tokio::time::interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(NetworkError::ConnectionClosed.into()),
                    };
                    session.timer.restart();
                    self.handle_message(message, &mut session)?;
                }

                command = commands.recv() => {
                    let Some(command) = command else {
                        return Ok(());
                    };
                    if let Some(result) = self.handle_command(command, &mut session) {
                        return result;
                    }
                }

                _ = tick.tick() => {
                    let now = Instant::now();
                    match session.timer.check(now) {
                        Some(TimerEvent::Idle) => session.outbox.push(Message::Ping(rand::random())),
                        Some(TimerEvent::Timeout) => return Err(PeerError::PingTimeout),
                        None => {}
                    }
                    let events = session.queue.check_timeout(now);
                    self.apply(events, &mut session)?;
                }
            }

            for message in session.outbox.drain(..) {
                debug!(peer = %self.host, command = message.command(), "Sending message");
                sink.send(message).await?;
            }
        }
    }

    /// Returns `Some` when the connection should end.
    fn handle_command(
        self: &Arc<Self>,
        command: PeerCommand,
        session: &mut Session,
    ) -> Option<Result<(), PeerError>> {
        match command {
            PeerCommand::AddTask(task) => {
                debug!(peer = %self.host, task = task.name(), "Adding task");
                let events = session.queue.push(task, Instant::now());
                self.apply(events, session).err().map(Err)
            }
            PeerCommand::Send(message) => {
                session.outbox.push(message);
                None
            }
            PeerCommand::Close(error) => Some(error.map_or(Ok(()), Err)),
        }
    }

    fn handle_message(self: &Arc<Self>, message: Message, session: &mut Session) -> Result<(), PeerError> {
        match message {
            Message::Version(version) => {
                validate_version(&version, self.local_best_height(), self.config.min_protocol_version)?;
                self.status.write().announced_height = version.start_height as u32;
                session
                    .queue
                    .set_protocol_version(version.protocol_version.min(self.config.protocol_version));
                session.handshake.version_received = true;
                session.outbox.push(Message::VerAck);
                self.maybe_connected(session);
                return Ok(());
            }
            Message::VerAck => {
                session.handshake.verack_received = true;
                self.maybe_connected(session);
                return Ok(());
            }
            _ => {}
        }

        if !self.is_connected() {
            debug!(peer = %self.host, command = message.command(), "Ignoring message before handshake");
            return Ok(());
        }

        match message {
            Message::Ping(nonce) => session.outbox.push(Message::Pong(nonce)),
            Message::Pong(_) => {}
            Message::MerkleBlock(raw) => match self.extractor.extract(&raw) {
                Ok(block) => {
                    let (consumed, events) =
                        session.queue.dispatch(&TaskMessage::MerkleBlock(block), Instant::now());
                    if !consumed {
                        debug!(peer = %self.host, "Unrequested merkle block");
                    }
                    self.apply(events, session)?;
                }
                Err(e) => warn!(peer = %self.host, error = %e, "Dropping merkle block"),
            },
            Message::Tx(tx) => {
                let (consumed, events) = session
                    .queue
                    .dispatch(&TaskMessage::Transaction(tx.clone()), Instant::now());
                self.apply(events, session)?;
                if !consumed {
                    self.forward(Message::Tx(tx));
                }
            }
            Message::Inv(items) => {
                let (consumed, events) = session
                    .queue
                    .dispatch(&TaskMessage::Inventory(items.clone()), Instant::now());
                self.apply(events, session)?;
                if !consumed {
                    self.forward(Message::Inv(items));
                }
            }
            other => {
                let message = TaskMessage::Other(other);
                let (consumed, events) = session.queue.dispatch(&message, Instant::now());
                self.apply(events, session)?;
                if let (false, TaskMessage::Other(other)) = (consumed, message) {
                    self.forward(other);
                }
            }
        }
        Ok(())
    }

    fn maybe_connected(self: &Arc<Self>, session: &Session) {
        if !(session.handshake.version_received && session.handshake.verack_received) {
            return;
        }
        {
            let mut status = self.status.write();
            if status.connected {
                return;
            }
            status.connected = true;
        }

        info!(peer = %self.host, height = self.announced_height(), "Peer connected");
        if let Some(listener) = self.listener() {
            listener.on_connect(self);
        }
    }

    fn forward(self: &Arc<Self>, message: Message) {
        if let Some(listener) = self.listener() {
            listener.on_receive_message(self, message);
        }
    }

    fn apply(self: &Arc<Self>, events: Vec<QueueEvent>, session: &mut Session) -> Result<(), PeerError> {
        for event in events {
            match event {
                QueueEvent::Send(message) => session.outbox.push(message),
                QueueEvent::Completed(task) => {
                    self.pending_tasks.fetch_sub(1, Ordering::SeqCst);
                    debug!(peer = %self.host, task = task.name(), "Task completed");
                    if let Some(listener) = self.listener() {
                        listener.on_task_complete(self, task);
                    }
                }
                QueueEvent::Failed(error) => {
                    self.pending_tasks.fetch_sub(1, Ordering::SeqCst);
                    return Err(error);
                }
                QueueEvent::Ready => {
                    if self.pending_tasks.load(Ordering::SeqCst) == 0 {
                        if let Some(listener) = self.listener() {
                            listener.on_ready(self);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("host", &self.host)
            .field("status", &*self.status.read())
            .field("pending_tasks", &self.pending_tasks.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageCodec;
    use crate::message::VersionMessage;
    use spv_consensus::params::{SERVICE_BLOOM_FILTER, SERVICE_FULL_NODE};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedSender;
    use tokio_util::codec::Framed;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    #[derive(Debug)]
    enum Event {
        Connect,
        Ready,
        Disconnect(Option<PeerError>),
        Message(String),
    }

    struct Recorder(UnboundedSender<Event>);

    impl PeerListener for Recorder {
        fn on_connect(&self, _peer: &Arc<Peer>) {
            let _ = self.0.send(Event::Connect);
        }
        fn on_ready(&self, _peer: &Arc<Peer>) {
            let _ = self.0.send(Event::Ready);
        }
        fn on_disconnect(&self, _peer: &Arc<Peer>, error: Option<PeerError>) {
            let _ = self.0.send(Event::Disconnect(error));
        }
        fn on_receive_message(&self, _peer: &Arc<Peer>, message: Message) {
            let _ = self.0.send(Event::Message(message.command().to_string()));
        }
        fn on_task_complete(&self, _peer: &Arc<Peer>, _task: Box<dyn PeerTask>) {}
    }

    fn remote_version(start_height: i32) -> VersionMessage {
        let addr = "127.0.0.1:1".parse().unwrap();
        VersionMessage {
            services: SERVICE_FULL_NODE | SERVICE_BLOOM_FILTER,
            start_height,
            ..build_version(&ConnectionConfig::default(), &addr, 0)
        }
    }

    async fn setup() -> (
        Arc<Peer>,
        Arc<Recorder>,
        mpsc::UnboundedReceiver<Event>,
        Framed<tokio::net::TcpStream, MessageCodec>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder(tx));
        let weak: Weak<dyn PeerListener> = Arc::downgrade(&recorder) as Weak<dyn PeerListener>;

        let config = ConnectionConfig {
            magic: MAGIC,
            port,
            ..ConnectionConfig::default()
        };
        let peer = Peer::new("127.0.0.1", config, MerkleBlockExtractor::new(1_000_000), weak);
        peer.start();

        let (socket, _) = listener.accept().await.unwrap();
        (peer, recorder, rx, Framed::new(socket, MessageCodec::with_magic(MAGIC)))
    }

    #[tokio::test]
    async fn test_handshake_then_close() {
        let (peer, _recorder, mut events, mut remote) = setup().await;

        assert!(matches!(remote.next().await, Some(Ok(Message::Version(_)))));
        remote.send(Message::Version(remote_version(10))).await.unwrap();
        assert!(matches!(remote.next().await, Some(Ok(Message::VerAck))));
        assert!(!peer.is_connected());

        remote.send(Message::VerAck).await.unwrap();
        assert!(matches!(events.recv().await, Some(Event::Connect)));
        assert!(peer.ready());
        assert_eq!(peer.announced_height(), 10);
        assert!(peer.connection_time().is_some());

        remote.send(Message::Ping(5)).await.unwrap();
        assert!(matches!(remote.next().await, Some(Ok(Message::Pong(5)))));

        remote.send(Message::Addr(vec![])).await.unwrap();
        match events.recv().await {
            Some(Event::Message(command)) => assert_eq!(command, "addr"),
            other => panic!("unexpected {:?}", other),
        }

        peer.close(None);
        peer.close(None);
        assert!(matches!(events.recv().await, Some(Event::Disconnect(None))));
        assert!(!peer.is_connected());
        assert!(remote.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unsuitable_version_disconnects() {
        let (peer, _recorder, mut events, mut remote) = setup().await;
        peer.set_local_best_height(100);

        let _ = remote.next().await;
        remote.send(Message::Version(remote_version(50))).await.unwrap();

        match events.recv().await {
            Some(Event::Disconnect(Some(PeerError::UnsuitablePeerVersion(_)))) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_close_reports_error() {
        let (_peer, _recorder, mut events, remote) = setup().await;
        drop(remote);
        match events.recv().await {
            Some(Event::Disconnect(Some(PeerError::Network(_)))) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_task_completion_makes_peer_ready() {
        use crate::tasks::GetBlockHashesTask;
        use crate::message::{InventoryItem, InventoryType};
        use spv_consensus::sha256d;

        let (peer, _recorder, mut events, mut remote) = setup().await;
        let _ = remote.next().await;
        remote.send(Message::Version(remote_version(10))).await.unwrap();
        let _ = remote.next().await;
        remote.send(Message::VerAck).await.unwrap();
        assert!(matches!(events.recv().await, Some(Event::Connect)));

        peer.add_task(Box::new(GetBlockHashesTask::new(vec![sha256d(b"tip")], 6)));
        assert!(!peer.ready());
        assert!(matches!(remote.next().await, Some(Ok(Message::GetBlocks(_)))));

        let items = (0u8..6)
            .map(|i| InventoryItem::new(InventoryType::Block, sha256d(&[i])))
            .collect();
        remote.send(Message::Inv(items)).await.unwrap();

        assert!(matches!(events.recv().await, Some(Event::Ready)));
        assert!(peer.ready());
    }
}
