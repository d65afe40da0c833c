//! The endpoint facade.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use magnetite_core::{
    BackendSpec, Clock, CloneSettings, CoreActor, CoreHandle, CoreOptions, Publisher,
    StatusSubscriber, Store, Subscriber, TlsConfig, Transport,
};
use magnetite_record::RecordWriter;
use magnetite_types::{
    Data, EndpointId, Message, NetworkInfo, PeerInfo, Timespan, Timestamp, Topic,
};

use crate::config::Config;
use crate::error::{EndpointError, Result};
use crate::fs::{Filesystem, StdFilesystem};

/// Name of the configuration dump inside the recording directory.
const CONFIG_DUMP_FILE: &str = "magnetite.conf";

/// Name of the message recording inside the recording directory.
const RECORDING_FILE: &str = "messages.dat";

/// How long runtime teardown waits for tasks before abandoning them.
const RUNTIME_GRACE: Duration = Duration::from_secs(5);

/// The application's handle on one broker instance.
///
/// An endpoint owns an actor runtime, a clock, a core router task, and
/// whatever masters, clones, publishers and subscribers get attached to
/// it. Dropping the endpoint (or calling [`shutdown`](Self::shutdown),
/// which is idempotent) tears all of that down.
///
/// The API is synchronous; calls must not be made from inside an async
/// runtime.
pub struct Endpoint {
    config: Config,
    clock: Arc<Clock>,
    core: CoreHandle,
    runtime: Option<tokio::runtime::Runtime>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Builds an endpoint on the real filesystem.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_filesystem(config, &StdFilesystem)
    }

    /// Builds an endpoint, performing recording-directory setup through
    /// `fs`.
    ///
    /// Construction requires TLS material unless `disable_ssl` is set;
    /// that failure is fatal. Recording-directory failures only warn.
    pub fn with_filesystem(config: Config, fs: &dyn Filesystem) -> Result<Self> {
        prepare_recording_directory(&config, fs);

        let transport = match (&config.tls, config.disable_ssl) {
            (_, true) => Transport::tcp(),
            (Some(tls), false) => {
                Transport::tls(&TlsConfig::new(&tls.cert, &tls.key, &tls.ca))?
            }
            (None, false) => return Err(EndpointError::TlsRequired),
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("magnetite")
            .build()?;
        let clock = Arc::new(Clock::new(runtime.handle().clone(), config.use_real_time));

        let recorder = open_recorder(&config);
        let options = CoreOptions {
            forward: config.forward,
            ttl: config.ttl,
        };
        let core = CoreActor::spawn(
            options,
            Arc::clone(&clock),
            transport,
            recorder,
            runtime.handle().clone(),
        );
        tracing::info!(endpoint = %core.id(), "endpoint created");

        Ok(Self {
            config,
            clock,
            core,
            runtime: Some(runtime),
        })
    }

    /// This endpoint's unique id.
    pub fn id(&self) -> EndpointId {
        self.core.id()
    }

    /// The endpoint's clock.
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// Current time on the endpoint clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Advances the virtual clock to `t`, dispatching deferred messages
    /// and waiting for their recipients to acknowledge. A no-op on
    /// real-time endpoints.
    pub fn advance_time(&self, t: Timestamp) {
        self.block_on(self.clock.advance_time(t));
    }

    // --- peering -----------------------------------------------------------

    /// Starts listening; returns the actual local port.
    pub fn listen(&self, address: &str, port: u16) -> Result<u16> {
        Ok(self.block_on(self.core.listen(address, port))?)
    }

    /// Peers with `address:port`, blocking until the handshake completes.
    /// A positive `retry` keeps the attempt alive across failures, so the
    /// call blocks until the peer eventually appears or `unpeer` cancels
    /// it.
    pub fn peer(&self, address: &str, port: u16, retry: Timespan) -> Result<()> {
        let info = NetworkInfo::new(address, port, retry);
        tracing::info!(peer = %info, "peering [synchronous]");
        Ok(self.block_on(self.core.peer(info))?)
    }

    /// Fire-and-forget variant of [`peer`](Self::peer).
    ///
    /// There is no completion signal; callers learn the outcome only via
    /// a status subscriber (`peer_added` or `peer_unreachable`).
    pub fn peer_nosync(&self, address: &str, port: u16, retry: Timespan) {
        let info = NetworkInfo::new(address, port, retry);
        tracing::info!(peer = %info, "peering [asynchronous]");
        self.core.peer_nosync(info);
    }

    /// Dissolves a peering (or cancels a pending one).
    pub fn unpeer(&self, address: &str, port: u16) -> Result<()> {
        let info = NetworkInfo::new(address, port, Timespan::ZERO);
        tracing::info!(peer = %info, "unpeering [synchronous]");
        Ok(self.block_on(self.core.unpeer(info))?)
    }

    /// Fire-and-forget variant of [`unpeer`](Self::unpeer).
    pub fn unpeer_nosync(&self, address: &str, port: u16) {
        let info = NetworkInfo::new(address, port, Timespan::ZERO);
        tracing::info!(peer = %info, "unpeering [asynchronous]");
        self.core.unpeer_nosync(info);
    }

    /// Current peer table.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.block_on(self.core.peers())
    }

    /// Union of all peers' advertised subscriptions.
    pub fn peer_subscriptions(&self) -> Vec<Topic> {
        self.block_on(self.core.peer_subscriptions())
    }

    // --- messaging ---------------------------------------------------------

    /// Publishes `data` on `topic`.
    pub fn publish(&self, topic: impl Into<Topic>, data: impl Into<Data>) {
        self.core.publish(topic.into(), data.into());
    }

    /// Publishes a batch in order.
    pub fn publish_batch(&self, messages: impl IntoIterator<Item = (Topic, Data)>) {
        for (topic, data) in messages {
            self.publish(topic, data);
        }
    }

    /// Publishes after `after` has elapsed on the endpoint clock. Under a
    /// virtual clock the message sits until `advance_time` reaches it.
    pub fn publish_later(&self, topic: impl Into<Topic>, data: impl Into<Data>, after: Timespan) {
        self.core
            .publish_later(Message::Data(topic.into(), data.into()), after);
    }

    /// Adds topics this endpoint forwards on behalf of others, without
    /// any local subscriber.
    pub fn forward(&self, topics: Vec<Topic>) {
        tracing::info!(?topics, "forwarding topics");
        self.core.forward(topics);
    }

    /// Creates a publisher fixed to `topic`.
    pub fn make_publisher(&self, topic: impl Into<Topic>) -> Publisher {
        self.core.make_publisher(topic.into())
    }

    /// Creates a subscriber over `filter` with a bounded queue.
    pub fn make_subscriber(&self, filter: Vec<Topic>, queue_size: usize) -> Subscriber {
        self.block_on(self.core.subscribe(filter, queue_size))
    }

    /// Creates a subscriber for status events.
    pub fn make_status_subscriber(&self) -> StatusSubscriber {
        self.core.make_status_subscriber()
    }

    // --- stores ------------------------------------------------------------

    /// Attaches (or finds) the master for `name`, owning `backend`.
    pub fn attach_master(&self, name: &str, backend: BackendSpec) -> Result<Store> {
        tracing::info!(store = name, ?backend, "attaching master");
        Ok(self.block_on(self.core.attach_master(name, backend))?)
    }

    /// Attaches a clone for `name` with the configured default intervals.
    pub fn attach_clone(&self, name: &str) -> Result<Store> {
        self.attach_clone_with(name, self.config.store.clone_settings())
    }

    /// Attaches a clone for `name` with explicit intervals.
    pub fn attach_clone_with(&self, name: &str, settings: CloneSettings) -> Result<Store> {
        tracing::info!(store = name, "attaching clone");
        Ok(self.block_on(self.core.attach_clone(name, settings))?)
    }

    // --- lifecycle ---------------------------------------------------------

    /// Shuts the endpoint down: stores, core, children, runtime, clock.
    /// Safe to call repeatedly; `Drop` calls it too.
    pub fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        tracing::info!(endpoint = %self.core.id(), "shutting down endpoint");
        if !self.config.await_stores_on_shutdown {
            self.core.terminate_stores();
        }
        runtime.block_on(self.core.shutdown());
        // Remaining tasks (peer readers, timers) get a grace period, then
        // the runtime abandons them.
        runtime.shutdown_timeout(RUNTIME_GRACE);
    }

    fn block_on<T>(&self, fut: impl std::future::Future<Output = T>) -> T {
        let runtime = self
            .runtime
            .as_ref()
            .expect("endpoint used after shutdown");
        runtime.block_on(fut)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Recording-directory setup: wipe any previous run, recreate, dump the
/// configuration. Failures warn and disable recording rather than abort
/// construction.
fn prepare_recording_directory(config: &Config, fs: &dyn Filesystem) {
    let dir = &config.recording_directory;
    if dir.as_os_str().is_empty() {
        return;
    }
    if fs.is_directory(dir) && !fs.remove_all(dir) {
        tracing::warn!(dir = %dir.display(), "failed to clear previous recording directory");
    }
    if !fs.mkdirs(dir) {
        tracing::warn!(dir = %dir.display(), "unable to create recording directory");
        return;
    }
    let dump_path = dir.join(CONFIG_DUMP_FILE);
    if let Err(err) = fs.write(&dump_path, config.dump().as_bytes()) {
        tracing::warn!(path = %dump_path.display(), %err, "failed to write configuration dump");
    }
}

/// Opens the message recorder when a recording directory is configured.
fn open_recorder(config: &Config) -> Option<RecordWriter> {
    let dir: &Path = &config.recording_directory;
    if dir.as_os_str().is_empty() {
        return None;
    }
    match RecordWriter::open(dir.join(RECORDING_FILE)) {
        Ok(writer) => Some(writer),
        Err(err) => {
            tracing::warn!(%err, "recording disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::fs::MemoryFilesystem;

    use super::*;

    #[test]
    fn recording_directory_is_wiped_and_recreated() {
        let fs = MemoryFilesystem::new();
        fs.mkdirs(Path::new("/rec/stale"));
        fs.write(Path::new("/rec/stale/old.dat"), b"old")
            .expect("seed");

        let config = Config {
            recording_directory: "/rec".into(),
            ..Config::default()
        };
        prepare_recording_directory(&config, &fs);

        assert!(!fs.exists(Path::new("/rec/stale/old.dat")));
        let dump = fs.read(Path::new("/rec/magnetite.conf")).expect("dump");
        let parsed: Config = toml::from_str(std::str::from_utf8(&dump).expect("utf8"))
            .expect("parseable dump");
        assert_eq!(parsed.recording_directory, Path::new("/rec"));
    }

    #[test]
    fn empty_recording_directory_is_untouched() {
        let fs = MemoryFilesystem::new();
        prepare_recording_directory(&Config::default(), &fs);
        assert!(fs.directories().is_empty());
    }

    #[test]
    fn tls_is_required_unless_disabled() {
        let err = Endpoint::new(Config::default()).expect_err("TLS must be required");
        assert!(matches!(err, EndpointError::TlsRequired));
    }
}
