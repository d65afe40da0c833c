//! The core router actor.
//!
//! One task per endpoint owns the peer table, the local subscription
//! table, the pending-peer retry state, the attached store actors, and
//! the optional recording writer. Everything reaches it through channels:
//! API requests from the endpoint facade, decoded frames from per-peer
//! reader tasks, publishes from store actors, and timer messages from the
//! clock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use magnetite_record::RecordWriter;
use magnetite_types::{
    Data, EndpointId, Filter, Message, NetworkInfo, PeerInfo, PeerStatus, StatusEvent, Timespan,
    Topic, filter_matches,
};

use crate::cache::{NetworkCache, PeerHandle};
use crate::clock::{Clock, Recipient, Tick, TimerMessage};
use crate::store::{
    BackendSpec, CloneActor, CloneSettings, MasterActor, Store, StoreInput,
};
use crate::transport::{BoxedStream, Transport};
use crate::wire::{PROTOCOL_VERSION, WireMessage, read_frame, write_frame};
use crate::{CoreError, Subscriber};

/// Router tunables.
#[derive(Debug, Clone)]
pub struct CoreOptions {
    /// Whether messages received from one peer are forwarded to others.
    /// Local publishes always forward.
    pub forward: bool,
    /// Maximum number of endpoints a message may traverse.
    pub ttl: usize,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            forward: true,
            ttl: 20,
        }
    }
}

/// Requests from the endpoint facade and worker handles.
#[derive(Debug)]
pub enum CoreRequest {
    Listen {
        address: String,
        port: u16,
        reply: oneshot::Sender<Result<u16, CoreError>>,
    },
    /// Establish a peering. `reply` is absent for the nosync variant, in
    /// which case outcomes surface only as status events.
    Peer {
        info: NetworkInfo,
        reply: Option<oneshot::Sender<Result<(), CoreError>>>,
    },
    Unpeer {
        info: NetworkInfo,
        reply: Option<oneshot::Sender<Result<(), CoreError>>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    PeerSubscriptions {
        reply: oneshot::Sender<Vec<Topic>>,
    },
    Publish {
        message: Message,
    },
    /// Defer a publish by `after` on the endpoint clock.
    PublishLater {
        message: Message,
        after: Timespan,
    },
    /// Forward these topics on behalf of others even without local
    /// subscribers.
    Forward {
        topics: Vec<Topic>,
    },
    AddSubscriber {
        filter: Filter,
        tx: mpsc::Sender<(Topic, Data)>,
        reply: oneshot::Sender<()>,
    },
    AttachMaster {
        name: String,
        backend: BackendSpec,
        reply: oneshot::Sender<Result<Store, CoreError>>,
    },
    AttachClone {
        name: String,
        settings: CloneSettings,
        reply: oneshot::Sender<Result<Store, CoreError>>,
    },
    /// Tell every attached store actor to exit promptly.
    TerminateStores,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Internal events from listener, connector, and peer reader tasks.
enum CoreEvent {
    Inbound {
        stream: BoxedStream,
    },
    Connected {
        info: NetworkInfo,
        stream: BoxedStream,
    },
    ConnectFailed {
        info: NetworkInfo,
        reason: String,
    },
    PeerFrame {
        handle: PeerHandle,
        msg: WireMessage,
    },
    PeerClosed {
        handle: PeerHandle,
    },
}

struct Peer {
    id: EndpointId,
    network: Option<NetworkInfo>,
    status: PeerStatus,
    /// The remote's advertised subscription union.
    filter: Filter,
    out: mpsc::UnboundedSender<WireMessage>,
    reader: JoinHandle<()>,
}

struct PendingPeer {
    info: NetworkInfo,
    waiters: Vec<oneshot::Sender<Result<(), CoreError>>>,
}

struct LocalSubscriber {
    filter: Filter,
    tx: mpsc::Sender<(Topic, Data)>,
}

/// Cloneable entry point to a running core.
#[derive(Debug, Clone)]
pub struct CoreHandle {
    id: EndpointId,
    tx: mpsc::UnboundedSender<CoreRequest>,
    status: broadcast::Sender<StatusEvent>,
    runtime: tokio::runtime::Handle,
}

impl CoreHandle {
    /// This endpoint's id.
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// The runtime the core's tasks live on.
    pub fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }

    /// Raw request channel, for the facade's own plumbing.
    pub fn sender(&self) -> mpsc::UnboundedSender<CoreRequest> {
        self.tx.clone()
    }

    /// Subscribes to status events.
    pub fn status_events(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// Creates a publisher fixed to `topic`.
    pub fn make_publisher(&self, topic: Topic) -> crate::Publisher {
        crate::Publisher::new(topic, self.tx.clone())
    }

    /// Creates a status event subscriber.
    pub fn make_status_subscriber(&self) -> crate::StatusSubscriber {
        crate::StatusSubscriber::new(self.status.subscribe(), self.runtime.clone())
    }

    /// Binds a listening port; returns the actual local port.
    pub async fn listen(&self, address: &str, port: u16) -> Result<u16, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoreRequest::Listen {
                address: address.to_string(),
                port,
                reply,
            })
            .map_err(|_| CoreError::ShuttingDown)?;
        rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    /// Peers with a remote endpoint, waiting for the handshake (or, with
    /// a positive retry interval, retrying until it succeeds).
    pub async fn peer(&self, info: NetworkInfo) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoreRequest::Peer {
                info,
                reply: Some(reply),
            })
            .map_err(|_| CoreError::ShuttingDown)?;
        rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    /// Fire-and-forget peering. There is no completion signal: outcomes
    /// surface only through status events.
    pub fn peer_nosync(&self, info: NetworkInfo) {
        let _ = self.tx.send(CoreRequest::Peer { info, reply: None });
    }

    /// Dissolves a peering (and cancels its retries).
    pub async fn unpeer(&self, info: NetworkInfo) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoreRequest::Unpeer {
                info,
                reply: Some(reply),
            })
            .map_err(|_| CoreError::ShuttingDown)?;
        rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    /// Fire-and-forget unpeer.
    pub fn unpeer_nosync(&self, info: NetworkInfo) {
        let _ = self.tx.send(CoreRequest::Unpeer { info, reply: None });
    }

    /// Current peer table.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(CoreRequest::Peers { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Union of all peers' advertised subscriptions.
    pub async fn peer_subscriptions(&self) -> Vec<Topic> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(CoreRequest::PeerSubscriptions { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Publishes a message.
    pub fn publish(&self, topic: Topic, data: Data) {
        let _ = self.tx.send(CoreRequest::Publish {
            message: Message::Data(topic, data),
        });
    }

    /// Publishes a prebuilt message.
    pub fn publish_message(&self, message: Message) {
        let _ = self.tx.send(CoreRequest::Publish { message });
    }

    /// Publishes after a delay on the endpoint clock.
    pub fn publish_later(&self, message: Message, after: Timespan) {
        let _ = self.tx.send(CoreRequest::PublishLater { message, after });
    }

    /// Adds topics to forward on behalf of others.
    pub fn forward(&self, topics: Vec<Topic>) {
        let _ = self.tx.send(CoreRequest::Forward { topics });
    }

    /// Registers a subscriber; resolves once routing sees the filter.
    pub async fn subscribe(&self, filter: Filter, queue_size: usize) -> Subscriber {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let (reply, done) = oneshot::channel();
        let _ = self.tx.send(CoreRequest::AddSubscriber {
            filter: filter.clone(),
            tx,
            reply,
        });
        let _ = done.await;
        Subscriber::new(filter, rx, self.runtime.clone())
    }

    /// Attaches (or finds) the master for `name`.
    pub async fn attach_master(
        &self,
        name: &str,
        backend: BackendSpec,
    ) -> Result<Store, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoreRequest::AttachMaster {
                name: name.to_string(),
                backend,
                reply,
            })
            .map_err(|_| CoreError::ShuttingDown)?;
        rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    /// Attaches a clone for `name`.
    pub async fn attach_clone(
        &self,
        name: &str,
        settings: CloneSettings,
    ) -> Result<Store, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoreRequest::AttachClone {
                name: name.to_string(),
                settings,
                reply,
            })
            .map_err(|_| CoreError::ShuttingDown)?;
        rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    /// Tells store actors to exit promptly.
    pub fn terminate_stores(&self) {
        let _ = self.tx.send(CoreRequest::TerminateStores);
    }

    /// Shuts the core down and waits for it.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(CoreRequest::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// The router task.
pub struct CoreActor {
    id: EndpointId,
    options: CoreOptions,
    clock: Arc<Clock>,
    transport: Arc<Transport>,
    runtime: tokio::runtime::Handle,
    api_rx: mpsc::UnboundedReceiver<CoreRequest>,
    events_tx: mpsc::UnboundedSender<CoreEvent>,
    events_rx: mpsc::UnboundedReceiver<CoreEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerMessage>,
    recipient: Recipient,
    store_pub_tx: mpsc::UnboundedSender<Message>,
    store_pub_rx: mpsc::UnboundedReceiver<Message>,
    status: broadcast::Sender<StatusEvent>,
    cache: NetworkCache,
    peers: HashMap<PeerHandle, Peer>,
    pending: HashMap<NetworkInfo, PendingPeer>,
    subscribers: Vec<LocalSubscriber>,
    forwarded: Filter,
    masters: HashMap<String, mpsc::UnboundedSender<StoreInput>>,
    clones: HashMap<String, Vec<mpsc::UnboundedSender<StoreInput>>>,
    recorder: Option<RecordWriter>,
    advertised: Filter,
    next_handle: u64,
    listeners: Vec<JoinHandle<()>>,
}

impl CoreActor {
    /// Spawns the router onto `runtime` and returns its handle.
    pub fn spawn(
        options: CoreOptions,
        clock: Arc<Clock>,
        transport: Transport,
        recorder: Option<RecordWriter>,
        runtime: tokio::runtime::Handle,
    ) -> CoreHandle {
        let id = EndpointId::random();
        let (api_tx, api_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (store_pub_tx, store_pub_rx) = mpsc::unbounded_channel();
        let (recipient, timer_rx) = Recipient::channel();
        let (status, _) = broadcast::channel(256);

        let actor = Self {
            id,
            options,
            clock,
            transport: Arc::new(transport),
            runtime: runtime.clone(),
            api_rx,
            events_tx,
            events_rx,
            timer_rx,
            recipient,
            store_pub_tx,
            store_pub_rx,
            status: status.clone(),
            cache: NetworkCache::new(),
            peers: HashMap::new(),
            pending: HashMap::new(),
            subscribers: Vec::new(),
            forwarded: Filter::new(),
            masters: HashMap::new(),
            clones: HashMap::new(),
            recorder,
            advertised: Filter::new(),
            next_handle: 1,
            listeners: Vec::new(),
        };
        runtime.spawn(actor.run());

        CoreHandle {
            id,
            tx: api_tx,
            status,
            runtime,
        }
    }

    async fn run(mut self) {
        tracing::info!(endpoint = %self.id, "core started");
        loop {
            tokio::select! {
                request = self.api_rx.recv() => match request {
                    None => break,
                    Some(CoreRequest::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request).await,
                },
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                },
                published = self.store_pub_rx.recv() => {
                    if let Some(msg) = published {
                        self.route(msg, None, Vec::new());
                    }
                },
                timer = self.timer_rx.recv() => match timer {
                    None => break,
                    Some(TimerMessage::Deliver(msg)) => self.route(msg, None, Vec::new()),
                    Some(TimerMessage::Tick(Tick::RetryPeer(info))) => self.retry_peer(info),
                    Some(TimerMessage::SyncPoint(ack)) => {
                        let _ = ack.send(());
                    }
                    Some(_) => {}
                },
            }
        }
        tracing::info!(endpoint = %self.id, "core stopped");
    }

    async fn handle_request(&mut self, request: CoreRequest) {
        match request {
            CoreRequest::Listen {
                address,
                port,
                reply,
            } => {
                let _ = reply.send(self.listen(&address, port).await);
            }
            CoreRequest::Peer { info, reply } => self.peer(info, reply),
            CoreRequest::Unpeer { info, reply } => {
                let result = self.unpeer(&info);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            CoreRequest::Peers { reply } => {
                let _ = reply.send(self.peer_table());
            }
            CoreRequest::PeerSubscriptions { reply } => {
                let mut topics: Vec<Topic> = self
                    .peers
                    .values()
                    .flat_map(|p| p.filter.iter().cloned())
                    .collect();
                topics.sort();
                topics.dedup();
                let _ = reply.send(topics);
            }
            CoreRequest::Publish { message } => self.route(message, None, Vec::new()),
            CoreRequest::PublishLater { message, after } => {
                self.clock
                    .send_later(self.recipient.clone(), after, TimerMessage::Deliver(message));
            }
            CoreRequest::Forward { topics } => {
                magnetite_types::filter_extend(&mut self.forwarded, topics);
                self.update_filter();
            }
            CoreRequest::AddSubscriber { filter, tx, reply } => {
                self.subscribers.push(LocalSubscriber { filter, tx });
                self.update_filter();
                let _ = reply.send(());
            }
            CoreRequest::AttachMaster {
                name,
                backend,
                reply,
            } => {
                let _ = reply.send(self.attach_master(name, &backend));
            }
            CoreRequest::AttachClone {
                name,
                settings,
                reply,
            } => {
                let _ = reply.send(self.attach_clone(name, settings));
            }
            CoreRequest::TerminateStores => self.terminate_stores(),
            // Shutdown is intercepted in `run`.
            CoreRequest::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // --- peering -----------------------------------------------------------

    async fn listen(&mut self, address: &str, port: u16) -> Result<u16, CoreError> {
        let (local_port, listener) = self.transport.listen(address, port).await?;
        let events = self.events_tx.clone();
        let task = self.runtime.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        tracing::debug!(%addr, "inbound connection");
                        if events.send(CoreEvent::Inbound { stream }).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                    }
                }
            }
        });
        self.listeners.push(task);
        tracing::info!(address, port = local_port, "listening");
        Ok(local_port)
    }

    fn peer(&mut self, info: NetworkInfo, reply: Option<oneshot::Sender<Result<(), CoreError>>>) {
        // Already peered with this address?
        if let Some(handle) = self.cache.find_handle(&info) {
            if self
                .peers
                .get(&handle)
                .is_some_and(|p| p.status == PeerStatus::Peered)
            {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                return;
            }
        }
        if let Some(pending) = self.pending.get_mut(&info) {
            if let Some(reply) = reply {
                pending.waiters.push(reply);
            }
            return;
        }
        tracing::info!(peer = %info, "peering");
        let mut pending = PendingPeer {
            info: info.clone(),
            waiters: Vec::new(),
        };
        if let Some(reply) = reply {
            pending.waiters.push(reply);
        }
        self.pending.insert(info.clone(), pending);
        self.connect(info);
    }

    fn connect(&self, info: NetworkInfo) {
        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        self.runtime.spawn(async move {
            let event = match transport.connect(&info).await {
                Ok(stream) => CoreEvent::Connected { info, stream },
                Err(err) => CoreEvent::ConnectFailed {
                    info,
                    reason: err.to_string(),
                },
            };
            let _ = events.send(event);
        });
    }

    fn retry_peer(&mut self, info: NetworkInfo) {
        // Unpeer may have cancelled the attempt in the meantime.
        if self.pending.contains_key(&info) {
            tracing::debug!(peer = %info, "retrying connection");
            self.connect(info);
        }
    }

    fn unpeer(&mut self, info: &NetworkInfo) -> Result<(), CoreError> {
        if let Some(mut pending) = self.pending.remove(info) {
            for waiter in pending.waiters.drain(..) {
                let _ = waiter.send(Err(CoreError::PeerInvalid { info: info.clone() }));
            }
            return Ok(());
        }
        let Some(handle) = self.cache.find_handle(info) else {
            return Err(CoreError::PeerInvalid { info: info.clone() });
        };
        tracing::info!(peer = %info, "unpeering");
        if let Some(peer) = self.peers.get(&handle) {
            let _ = peer.out.send(WireMessage::Goodbye);
            let _ = self.status.send(StatusEvent::PeerRemoved {
                peer: peer.id,
                network: peer.network.clone(),
            });
        }
        self.drop_peer(handle);
        Ok(())
    }

    fn peer_table(&self) -> Vec<PeerInfo> {
        let mut table: Vec<PeerInfo> = self
            .peers
            .values()
            .map(|p| PeerInfo {
                id: p.id,
                network: p.network.clone(),
                status: p.status,
            })
            .collect();
        table.extend(self.pending.values().map(|p| PeerInfo {
            id: EndpointId::nil(),
            network: Some(p.info.clone()),
            status: PeerStatus::Connecting,
        }));
        table
    }

    /// Wires up a fresh connection: allocates a handle, spawns the reader
    /// and writer tasks, and opens with our hello.
    fn adopt_stream(&mut self, stream: BoxedStream, network: Option<NetworkInfo>) -> PeerHandle {
        let handle = PeerHandle(self.next_handle);
        self.next_handle += 1;

        let (read_half, write_half) = tokio::io::split(stream);
        let events = self.events_tx.clone();
        let reader = self.runtime.spawn(async move {
            let mut read_half = read_half;
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(msg)) => {
                        if events.send(CoreEvent::PeerFrame { handle, msg }).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::debug!(%handle, %err, "peer stream failed");
                        break;
                    }
                }
            }
            let _ = events.send(CoreEvent::PeerClosed { handle });
        });

        let (out, mut out_rx) = mpsc::unbounded_channel::<WireMessage>();
        self.runtime.spawn(async move {
            let mut write_half = write_half;
            while let Some(msg) = out_rx.recv().await {
                if let Err(err) = write_frame(&mut write_half, &msg).await {
                    tracing::debug!(%handle, %err, "peer write failed");
                    break;
                }
            }
        });

        let _ = out.send(WireMessage::Hello {
            id: self.id,
            version: PROTOCOL_VERSION,
            filter: self.advertised.clone(),
        });

        if let Some(info) = &network {
            self.cache.add(handle, info.clone());
        }
        self.peers.insert(
            handle,
            Peer {
                id: EndpointId::nil(),
                network,
                status: PeerStatus::Connected,
                filter: Filter::new(),
                out,
                reader,
            },
        );
        handle
    }

    fn handle_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Inbound { stream } => {
                self.adopt_stream(stream, None);
            }
            CoreEvent::Connected { info, stream } => {
                self.adopt_stream(stream, Some(info));
            }
            CoreEvent::ConnectFailed { info, reason } => {
                tracing::info!(peer = %info, %reason, "connection failed");
                let _ = self
                    .status
                    .send(StatusEvent::PeerUnreachable {
                        network: info.clone(),
                    });
                if info.retry.is_positive() {
                    // Keep the attempt pending and try again later.
                    if self.pending.contains_key(&info) {
                        self.clock.send_later(
                            self.recipient.clone(),
                            info.retry,
                            TimerMessage::Tick(Tick::RetryPeer(info)),
                        );
                    }
                } else if let Some(mut pending) = self.pending.remove(&info) {
                    for waiter in pending.waiters.drain(..) {
                        let _ = waiter.send(Err(CoreError::PeerUnavailable {
                            info: info.clone(),
                            reason: reason.clone(),
                        }));
                    }
                }
            }
            CoreEvent::PeerFrame { handle, msg } => self.handle_frame(handle, msg),
            CoreEvent::PeerClosed { handle } => self.peer_lost(handle),
        }
    }

    fn handle_frame(&mut self, handle: PeerHandle, msg: WireMessage) {
        match msg {
            WireMessage::Hello {
                id,
                version,
                filter,
            } => self.handle_hello(handle, id, version, filter),
            WireMessage::FilterUpdate { filter } => {
                if let Some(peer) = self.peers.get_mut(&handle) {
                    peer.filter = filter;
                }
            }
            WireMessage::Data {
                topic,
                data,
                visited,
            } => self.route(Message::Data(topic, data), Some(handle), visited),
            WireMessage::Command {
                topic,
                command,
                visited,
            } => self.route(Message::Command(topic, command), Some(handle), visited),
            WireMessage::Goodbye => {
                let network = self.cache.find_info(handle).cloned();
                if let Some(peer) = self.peers.get(&handle) {
                    let _ = self.status.send(StatusEvent::PeerRemoved {
                        peer: peer.id,
                        network,
                    });
                }
                self.drop_peer(handle);
            }
        }
    }

    fn handle_hello(&mut self, handle: PeerHandle, id: EndpointId, version: u32, filter: Filter) {
        if version != PROTOCOL_VERSION {
            tracing::warn!(%handle, version, "incompatible peer");
            if let Some(peer) = self.peers.get(&handle) {
                let _ = peer.out.send(WireMessage::Goodbye);
            }
            let network = self.cache.find_info(handle).cloned();
            self.drop_peer(handle);
            if let Some(info) = network {
                if let Some(mut pending) = self.pending.remove(&info) {
                    for waiter in pending.waiters.drain(..) {
                        let _ = waiter.send(Err(CoreError::PeerIncompatible {
                            version,
                            expected: PROTOCOL_VERSION,
                        }));
                    }
                }
            }
            return;
        }

        let first_contact = !self.peers.values().any(|p| p.id == id);
        let network = {
            let Some(peer) = self.peers.get_mut(&handle) else {
                return;
            };
            peer.id = id;
            peer.filter = filter;
            peer.status = PeerStatus::Peered;
            peer.network.clone()
        };
        tracing::info!(%handle, peer = %id, "peered");

        if first_contact {
            let _ = self.status.send(StatusEvent::EndpointDiscovered { peer: id });
        }
        let _ = self.status.send(StatusEvent::PeerAdded {
            peer: id,
            network: network.clone(),
        });

        if let Some(info) = network {
            if let Some(mut pending) = self.pending.remove(&info) {
                for waiter in pending.waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
    }

    /// The transport gave up on a peer: demote, report, and retry when the
    /// address carries a retry interval.
    fn peer_lost(&mut self, handle: PeerHandle) {
        let Some(peer) = self.peers.get(&handle) else {
            return;
        };
        let was_peered = peer.status == PeerStatus::Peered;
        let id = peer.id;
        let network = peer.network.clone();
        self.drop_peer(handle);

        if was_peered {
            tracing::info!(%handle, peer = %id, "peer lost");
            let _ = self.status.send(StatusEvent::PeerLost {
                peer: id,
                network: network.clone(),
            });
        }
        if let Some(info) = network {
            if info.retry.is_positive() && !self.pending.contains_key(&info) {
                self.pending.insert(
                    info.clone(),
                    PendingPeer {
                        info: info.clone(),
                        waiters: Vec::new(),
                    },
                );
                self.clock.send_later(
                    self.recipient.clone(),
                    info.retry,
                    TimerMessage::Tick(Tick::RetryPeer(info)),
                );
            }
        }
    }

    fn drop_peer(&mut self, handle: PeerHandle) {
        if let Some(peer) = self.peers.remove(&handle) {
            peer.reader.abort();
        }
        self.cache.remove(handle);
    }

    // --- stores ------------------------------------------------------------

    fn attach_master(&mut self, name: String, backend: &BackendSpec) -> Result<Store, CoreError> {
        if let Some(existing) = self.masters.get(&name) {
            return Ok(Store::new(name, existing.clone(), self.runtime.clone()));
        }
        tracing::info!(store = %name, "attaching master");
        let backend = backend.open()?;
        let tx = MasterActor::spawn(
            name.clone(),
            backend,
            Arc::clone(&self.clock),
            self.store_pub_tx.clone(),
            &self.runtime,
        );
        self.masters.insert(name.clone(), tx.clone());
        self.update_filter();
        Ok(Store::new(name, tx, self.runtime.clone()))
    }

    fn attach_clone(&mut self, name: String, settings: CloneSettings) -> Result<Store, CoreError> {
        tracing::info!(store = %name, "attaching clone");
        let tx = CloneActor::spawn(
            name.clone(),
            Arc::clone(&self.clock),
            self.store_pub_tx.clone(),
            self.status.clone(),
            self.id,
            settings,
            &self.runtime,
        );
        self.clones.entry(name.clone()).or_default().push(tx.clone());
        self.update_filter();
        Ok(Store::new(name, tx, self.runtime.clone()))
    }

    fn terminate_stores(&mut self) {
        for tx in self.masters.values() {
            let _ = tx.send(StoreInput::Terminate);
        }
        for txs in self.clones.values() {
            for tx in txs {
                let _ = tx.send(StoreInput::Terminate);
            }
        }
    }

    // --- routing -----------------------------------------------------------

    /// Routes one message: record, deliver locally, forward to peers.
    fn route(&mut self, msg: Message, from: Option<PeerHandle>, mut visited: Vec<EndpointId>) {
        if visited.contains(&self.id) {
            // We already forwarded this one; a peer cycle brought it back.
            return;
        }
        visited.push(self.id);

        self.record(&msg);

        match &msg {
            Message::Data(topic, data) => self.deliver_data(topic, data),
            Message::Command(topic, cmd) => {
                if let Some(name) = topic.master_store_name() {
                    if let Some(master) = self.masters.get(name) {
                        let _ = master.send(StoreInput::Command(cmd.clone()));
                    }
                } else if let Some(name) = topic.clone_store_name() {
                    if let Some(clones) = self.clones.get(name) {
                        for clone in clones {
                            let _ = clone.send(StoreInput::Command(cmd.clone()));
                        }
                    }
                }
            }
        }

        // Forwarding policy: local publishes always fan out; relayed
        // messages only when forwarding is on and the hop budget remains.
        if from.is_some() && !self.options.forward {
            return;
        }
        if visited.len() > self.options.ttl {
            tracing::debug!(topic = %msg.topic(), "ttl exhausted");
            return;
        }

        let wire = match &msg {
            Message::Data(topic, data) => WireMessage::Data {
                topic: topic.clone(),
                data: data.clone(),
                visited: visited.clone(),
            },
            Message::Command(topic, cmd) => WireMessage::Command {
                topic: topic.clone(),
                command: cmd.clone(),
                visited: visited.clone(),
            },
        };
        for (handle, peer) in &self.peers {
            if peer.status != PeerStatus::Peered {
                continue;
            }
            if Some(*handle) == from {
                continue;
            }
            if visited.contains(&peer.id) {
                continue;
            }
            if !filter_matches(&peer.filter, msg.topic()) {
                continue;
            }
            let _ = peer.out.send(wire.clone());
        }
    }

    fn deliver_data(&mut self, topic: &Topic, data: &Data) {
        let mut pruned = false;
        for sub in &self.subscribers {
            if !filter_matches(&sub.filter, topic) {
                continue;
            }
            match sub.tx.try_send((topic.clone(), data.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(%topic, "subscriber queue full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => pruned = true,
            }
        }
        if pruned {
            self.subscribers.retain(|s| !s.tx.is_closed());
            self.update_filter();
        }
    }

    fn record(&mut self, msg: &Message) {
        if let Some(recorder) = &mut self.recorder {
            if let Err(err) = recorder.write(msg) {
                tracing::warn!(%err, "recording failed, disabling recorder");
                self.recorder = None;
            }
        }
    }

    /// Recomputes the advertised subscription union and pushes a filter
    /// update to peers when it changed.
    fn update_filter(&mut self) {
        let mut filter = Filter::new();
        for sub in &self.subscribers {
            filter.extend(sub.filter.iter().cloned());
        }
        filter.extend(self.forwarded.iter().cloned());
        filter.extend(self.masters.keys().map(|name| Topic::store_master(name)));
        filter.extend(self.clones.keys().map(|name| Topic::store_clone(name)));
        filter.sort();
        filter.dedup();

        if filter == self.advertised {
            return;
        }
        self.advertised = filter;
        tracing::debug!(filter = ?self.advertised, "subscription union changed");
        for peer in self.peers.values() {
            if peer.status == PeerStatus::Peered {
                let _ = peer.out.send(WireMessage::FilterUpdate {
                    filter: self.advertised.clone(),
                });
            }
        }
    }

    // --- shutdown ----------------------------------------------------------

    fn shutdown(&mut self) {
        tracing::info!(endpoint = %self.id, "core shutting down");
        self.terminate_stores();
        let handles: Vec<PeerHandle> = self.peers.keys().copied().collect();
        for handle in handles {
            if let Some(peer) = self.peers.get(&handle) {
                let _ = peer.out.send(WireMessage::Goodbye);
            }
            self.drop_peer(handle);
        }
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        for pending in self.pending.values_mut() {
            for waiter in pending.waiters.drain(..) {
                let _ = waiter.send(Err(CoreError::ShuttingDown));
            }
        }
        self.pending.clear();
        // Dropping the writer flushes buffered entries.
        self.recorder = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn spawn_core() -> CoreHandle {
        let runtime = tokio::runtime::Handle::current();
        let clock = Arc::new(Clock::new(runtime.clone(), true));
        CoreActor::spawn(
            CoreOptions::default(),
            clock,
            Transport::tcp(),
            None,
            runtime,
        )
    }

    fn local(port: u16) -> NetworkInfo {
        NetworkInfo::new("127.0.0.1", port, Timespan::ZERO)
    }

    /// Polls `check` until it passes or five seconds elapse.
    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if check().await {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn peer_then_publish_delivers_across_endpoints() {
        let a = spawn_core();
        let b = spawn_core();

        let port = a.listen("127.0.0.1", 0).await.expect("listen");
        b.peer(local(port)).await.expect("peer");

        let mut sub = b.subscribe(vec![Topic::from("/x")], 16).await;

        // Wait for B's filter to reach A before publishing.
        let a2 = a.clone();
        eventually(|| {
            let a = a2.clone();
            async move {
                a.peer_subscriptions()
                    .await
                    .contains(&Topic::from("/x"))
            }
        })
        .await;

        a.publish(Topic::from("/x/y"), Data::Count(42));

        let (topic, data) = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("delivery deadline")
            .expect("message");
        assert_eq!(topic, Topic::from("/x/y"));
        assert_eq!(data, Data::Count(42));

        // Exactly once: nothing else arrives for a beat.
        assert!(
            tokio::time::timeout(Duration::from_millis(200), sub.recv())
                .await
                .is_err()
        );

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn non_matching_topics_are_not_delivered() {
        let a = spawn_core();
        let b = spawn_core();

        let port = a.listen("127.0.0.1", 0).await.expect("listen");
        b.peer(local(port)).await.expect("peer");

        let mut sub = b.subscribe(vec![Topic::from("/x")], 16).await;
        let a2 = a.clone();
        eventually(|| {
            let a = a2.clone();
            async move { !a.peer_subscriptions().await.is_empty() }
        })
        .await;

        // "/xy" shares a string prefix but not a component prefix.
        a.publish(Topic::from("/xy"), Data::Count(1));
        a.publish(Topic::from("/z"), Data::Count(2));
        a.publish(Topic::from("/x/ok"), Data::Count(3));

        let (topic, data) = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("delivery deadline")
            .expect("message");
        assert_eq!(topic, Topic::from("/x/ok"));
        assert_eq!(data, Data::Count(3));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn peer_to_dead_address_fails_without_retry() {
        let core = spawn_core();
        // Grab a port that nothing listens on.
        let dead = {
            let sock = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind");
            sock.local_addr().expect("addr").port()
        };
        let err = core.peer(local(dead)).await.expect_err("must fail");
        assert!(matches!(err, CoreError::PeerUnavailable { .. }));
        core.shutdown().await;
    }

    #[tokio::test]
    async fn unpeer_removes_the_relationship() {
        let a = spawn_core();
        let b = spawn_core();

        let port = a.listen("127.0.0.1", 0).await.expect("listen");
        b.peer(local(port)).await.expect("peer");
        assert_eq!(b.peers().await.len(), 1);

        b.unpeer(local(port)).await.expect("unpeer");
        assert!(b.peers().await.is_empty());

        // Unpeering an unknown address reports peer_invalid.
        let err = b.unpeer(local(port)).await.expect_err("gone");
        assert!(matches!(err, CoreError::PeerInvalid { .. }));

        // A eventually drops its side too (goodbye or stream close).
        let a2 = a.clone();
        eventually(|| {
            let a = a2.clone();
            async move {
                a.peers()
                    .await
                    .iter()
                    .all(|p| p.status != PeerStatus::Peered)
            }
        })
        .await;

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn local_master_and_clone_converge() {
        let core = spawn_core();

        let master = core
            .attach_master("s", BackendSpec::Memory)
            .await
            .expect("master");
        let clone = core
            .attach_clone("s", CloneSettings::default())
            .await
            .expect("clone");

        // Scenario: put, put, add, erase.
        let m = master.clone();
        tokio::task::spawn_blocking(move || {
            m.put(Data::from("k1"), Data::Integer(1), None).expect("put");
            m.put(Data::from("k2"), Data::from("v"), None).expect("put");
            m.add(Data::from("k1"), Data::Integer(2), None).expect("add");
            m.erase(Data::from("k2")).expect("erase");
        })
        .await
        .expect("join");

        let c = clone.clone();
        eventually(move || {
            let c = c.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    c.get(Data::from("k1")) == Ok(Data::Integer(3))
                        && c.exists(Data::from("k2")) == Ok(false)
                        && c.size() == Ok(1)
                })
                .await
                .expect("join")
            }
        })
        .await;

        core.shutdown().await;
    }

    #[tokio::test]
    async fn attach_master_is_idempotent() {
        let core = spawn_core();
        let first = core
            .attach_master("s", BackendSpec::Memory)
            .await
            .expect("master");
        let second = core
            .attach_master("s", BackendSpec::Memory)
            .await
            .expect("same master");

        let (a, b) = (first.clone(), second.clone());
        tokio::task::spawn_blocking(move || {
            a.put(Data::from("k"), Data::Count(1), None).expect("put");
            assert_eq!(b.get(Data::from("k")), Ok(Data::Count(1)));
        })
        .await
        .expect("join");

        core.shutdown().await;
    }

    #[tokio::test]
    async fn replication_works_across_peered_endpoints() {
        let a = spawn_core();
        let b = spawn_core();

        let port = a.listen("127.0.0.1", 0).await.expect("listen");
        b.peer(local(port)).await.expect("peer");

        let master = a
            .attach_master("shared", BackendSpec::Memory)
            .await
            .expect("master");
        let clone = b
            .attach_clone("shared", CloneSettings::default())
            .await
            .expect("clone");

        // Wait until the subscription unions crossed, then write.
        let (a2, b2) = (a.clone(), b.clone());
        eventually(move || {
            let (a, b) = (a2.clone(), b2.clone());
            async move {
                a.peer_subscriptions()
                    .await
                    .contains(&Topic::store_clone("shared"))
                    && b.peer_subscriptions()
                        .await
                        .contains(&Topic::store_master("shared"))
            }
        })
        .await;

        let m = master.clone();
        tokio::task::spawn_blocking(move || {
            m.put(Data::from("k"), Data::Count(7), None).expect("put");
        })
        .await
        .expect("join");

        let c = clone.clone();
        eventually(move || {
            let c = c.clone();
            async move {
                tokio::task::spawn_blocking(move || c.get(Data::from("k")) == Ok(Data::Count(7)))
                    .await
                    .expect("join")
            }
        })
        .await;

        a.shutdown().await;
        b.shutdown().await;
    }
}
