//! Clone store actor.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use magnetite_backend::{Backend, MemoryBackend};
use magnetite_types::{Command, EndpointId, Message, StatusEvent, Timestamp, Topic};

use crate::clock::{Clock, Recipient, Tick, TimerMessage};

use super::{CloneSettings, StoreApi, StoreInput, apply_mutation, serve_read};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloneState {
    /// Waiting for a snapshot from the master.
    Bootstrapping,
    /// Applying the master's command stream.
    Synced,
    /// No master traffic for longer than the stale interval.
    Stale,
}

/// Holds an eventually consistent replica of one store.
///
/// The command stream and snapshots both arrive on `<name>/data/clone`,
/// and a master-to-clone stream is FIFO, so any command received before
/// a snapshot is already reflected in it. The bootstrap buffer therefore
/// only matters while no snapshot arrives at all; it is dropped once one
/// lands or once it outlives the mutation buffer interval.
pub(crate) struct CloneActor {
    name: String,
    backend: MemoryBackend,
    clock: Arc<Clock>,
    publish: mpsc::UnboundedSender<Message>,
    status: broadcast::Sender<StatusEvent>,
    endpoint_id: EndpointId,
    settings: CloneSettings,
    rx: mpsc::UnboundedReceiver<StoreInput>,
    timer_rx: mpsc::UnboundedReceiver<TimerMessage>,
    recipient: Recipient,
    state: CloneState,
    buffer: Vec<Command>,
    buffer_since: Timestamp,
    last_contact: Timestamp,
    /// Master's committed sequence as of our state.
    seq: u64,
    resync_armed: bool,
}

impl CloneActor {
    pub(crate) fn spawn(
        name: String,
        clock: Arc<Clock>,
        publish: mpsc::UnboundedSender<Message>,
        status: broadcast::Sender<StatusEvent>,
        endpoint_id: EndpointId,
        settings: CloneSettings,
        runtime: &tokio::runtime::Handle,
    ) -> mpsc::UnboundedSender<StoreInput> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (recipient, timer_rx) = Recipient::channel();
        let now = clock.now();
        let mut actor = Self {
            name,
            backend: MemoryBackend::new(),
            clock,
            publish,
            status,
            endpoint_id,
            settings,
            rx,
            timer_rx,
            recipient,
            state: CloneState::Bootstrapping,
            buffer: Vec::new(),
            buffer_since: now,
            last_contact: now,
            seq: 0,
            resync_armed: false,
        };
        actor.request_snapshot();
        actor.arm_resync();
        actor.arm_stale_check();
        runtime.spawn(actor.run());
        tx
    }

    async fn run(mut self) {
        tracing::debug!(store = %self.name, "clone attached");
        loop {
            tokio::select! {
                input = self.rx.recv() => match input {
                    None | Some(StoreInput::Terminate) => break,
                    Some(StoreInput::Command(cmd)) => self.handle_command(cmd),
                    Some(StoreInput::Api(api)) => self.handle_api(api),
                },
                timer = self.timer_rx.recv() => match timer {
                    None => break,
                    Some(TimerMessage::Tick(Tick::Resync)) => self.on_resync_tick(),
                    Some(TimerMessage::Tick(Tick::StaleCheck)) => self.on_stale_check(),
                    Some(TimerMessage::SyncPoint(ack)) => {
                        let _ = ack.send(());
                    }
                    Some(_) => {}
                },
            }
        }
        tracing::debug!(store = %self.name, "clone detached");
    }

    /// A command off the clone topic: the master is alive.
    fn handle_command(&mut self, cmd: Command) {
        self.last_contact = self.clock.now();
        match cmd {
            Command::SnapshotSync { snapshot, seq } => {
                tracing::debug!(store = %self.name, seq, entries = snapshot.len(), "installing snapshot");
                self.backend.reset(snapshot);
                self.seq = seq;
                // Everything buffered arrived before the snapshot on the
                // same FIFO stream, so the snapshot subsumes it.
                self.buffer.clear();
                self.state = CloneState::Synced;
            }
            Command::SnapshotRequest { .. } => {}
            Command::Expire { key } => {
                // The master already decided this key is gone; our clock
                // may trail its, so erase outright.
                if self.state == CloneState::Bootstrapping {
                    self.buffer_command(Command::Expire { key });
                } else if self.backend.erase(&key).is_ok() {
                    self.seq += 1;
                }
            }
            cmd if cmd.is_mutation() => {
                if self.state == CloneState::Bootstrapping {
                    self.buffer_command(cmd);
                } else {
                    self.state = CloneState::Synced;
                    match apply_mutation(&mut self.backend, cmd) {
                        Ok(()) => self.seq += 1,
                        Err(err) => {
                            tracing::warn!(store = %self.name, %err, "replicated command failed");
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_api(&mut self, api: StoreApi) {
        // Reads answer locally, stale or not; staleness is advertised via
        // status events instead of failing reads.
        let Some(api) = serve_read(&self.backend, api, self.clock.now()) else {
            return;
        };
        let (cmd, reply) = match api {
            StoreApi::Put {
                key,
                value,
                expiry,
                reply,
            } => (Command::Put { key, value, expiry }, reply),
            StoreApi::Add {
                key,
                value,
                expiry,
                reply,
            } => (Command::Add { key, value, expiry }, reply),
            StoreApi::Subtract {
                key,
                value,
                expiry,
                reply,
            } => (Command::Subtract { key, value, expiry }, reply),
            StoreApi::Erase { key, reply } => (Command::Erase { key }, reply),
            StoreApi::Clear { reply } => (Command::Clear, reply),
            _ => return,
        };
        // Mutations are not applied locally; they go to the master and
        // come back on the replication stream.
        let _ = self
            .publish
            .send(Message::Command(Topic::store_master(&self.name), cmd));
        let _ = reply.send(Ok(()));
    }

    /// Buffers a command during bootstrap, bounded by the buffer interval.
    fn buffer_command(&mut self, cmd: Command) {
        let now = self.clock.now();
        if self.buffer.is_empty() {
            self.buffer_since = now;
        } else if now - self.buffer_since > self.settings.mutation_buffer_interval {
            tracing::debug!(store = %self.name, dropped = self.buffer.len(), "mutation buffer aged out");
            self.buffer.clear();
            self.buffer_since = now;
        }
        self.buffer.push(cmd);
    }

    fn on_resync_tick(&mut self) {
        self.resync_armed = false;
        if self.state == CloneState::Synced {
            return;
        }
        tracing::debug!(store = %self.name, "looking for master");
        let _ = self.status.send(StatusEvent::MasterUnavailable {
            store: self.name.clone(),
        });
        self.request_snapshot();
        self.arm_resync();
    }

    fn on_stale_check(&mut self) {
        let now = self.clock.now();
        if self.state == CloneState::Synced
            && now - self.last_contact >= self.settings.stale_interval
        {
            tracing::info!(store = %self.name, "command stream went stale");
            self.state = CloneState::Stale;
            let _ = self.status.send(StatusEvent::CloneConnectionLost {
                store: self.name.clone(),
            });
            self.arm_resync();
        }
        self.arm_stale_check();
    }

    fn request_snapshot(&mut self) {
        if self.state != CloneState::Bootstrapping {
            self.state = CloneState::Bootstrapping;
            self.buffer.clear();
            self.buffer_since = self.clock.now();
        }
        let _ = self.publish.send(Message::Command(
            Topic::store_master(&self.name),
            Command::SnapshotRequest {
                requester: self.endpoint_id,
            },
        ));
    }

    fn arm_resync(&mut self) {
        if self.resync_armed {
            return;
        }
        self.resync_armed = true;
        self.clock.send_later(
            self.recipient.clone(),
            self.settings.resync_interval,
            TimerMessage::Tick(Tick::Resync),
        );
    }

    fn arm_stale_check(&self) {
        self.clock.send_later(
            self.recipient.clone(),
            self.settings.stale_interval,
            TimerMessage::Tick(Tick::StaleCheck),
        );
    }
}

#[cfg(test)]
mod tests {
    use magnetite_types::{Data, ErrorCode, Snapshot, StoreEntry};
    use tokio::sync::oneshot;

    use super::*;

    struct Fixture {
        tx: mpsc::UnboundedSender<StoreInput>,
        published: mpsc::UnboundedReceiver<Message>,
        status: broadcast::Receiver<StatusEvent>,
    }

    fn clone_store(settings: CloneSettings) -> Fixture {
        let clock = Arc::new(Clock::new(tokio::runtime::Handle::current(), true));
        let (pub_tx, published) = mpsc::unbounded_channel();
        let (status_tx, status) = broadcast::channel(16);
        let tx = CloneActor::spawn(
            "s".to_string(),
            clock,
            pub_tx,
            status_tx,
            EndpointId::random(),
            settings,
            &tokio::runtime::Handle::current(),
        );
        Fixture {
            tx,
            published,
            status,
        }
    }

    async fn get(tx: &mpsc::UnboundedSender<StoreInput>, key: &str) -> Result<Data, ErrorCode> {
        let (reply, rx) = oneshot::channel();
        tx.send(StoreInput::Api(StoreApi::Get {
            key: Data::from(key),
            reply,
        }))
        .expect("send");
        rx.await.expect("reply")
    }

    fn snapshot_with(key: &str, value: Data) -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.insert(Data::from(key), StoreEntry::new(value, None));
        snapshot
    }

    #[tokio::test]
    async fn bootstrap_requests_a_snapshot() {
        let mut fx = clone_store(CloneSettings::default());
        let first = fx.published.recv().await.expect("publish");
        match first {
            Message::Command(topic, Command::SnapshotRequest { .. }) => {
                assert_eq!(topic, Topic::store_master("s"));
            }
            other => panic!("unexpected publish {other:?}"),
        }
    }

    #[tokio::test]
    async fn commands_buffer_until_snapshot_then_stream_applies() {
        let mut fx = clone_store(CloneSettings::default());
        let _ = fx.published.recv().await; // snapshot request

        // A command racing ahead of the snapshot is buffered, not applied.
        fx.tx
            .send(StoreInput::Command(Command::Put {
                key: Data::from("early"),
                value: Data::Count(1),
                expiry: None,
            }))
            .expect("send");
        assert_eq!(get(&fx.tx, "early").await, Err(ErrorCode::NoSuchKey));

        // Snapshot lands; it already contains the racing command's effect.
        fx.tx
            .send(StoreInput::Command(Command::SnapshotSync {
                snapshot: snapshot_with("early", Data::Count(1)),
                seq: 1,
            }))
            .expect("send");
        assert_eq!(get(&fx.tx, "early").await.unwrap(), Data::Count(1));

        // Post-snapshot stream commands apply directly.
        fx.tx
            .send(StoreInput::Command(Command::Add {
                key: Data::from("early"),
                value: Data::Count(2),
                expiry: None,
            }))
            .expect("send");
        assert_eq!(get(&fx.tx, "early").await.unwrap(), Data::Count(3));
    }

    #[tokio::test]
    async fn mutations_forward_to_the_master_topic() {
        let mut fx = clone_store(CloneSettings::default());
        let _ = fx.published.recv().await; // snapshot request

        let (reply, rx) = oneshot::channel();
        fx.tx
            .send(StoreInput::Api(StoreApi::Put {
                key: Data::from("k"),
                value: Data::Count(5),
                expiry: None,
                reply,
            }))
            .expect("send");
        rx.await.expect("reply").expect("forwarded");

        let forwarded = fx.published.recv().await.expect("publish");
        match forwarded {
            Message::Command(topic, Command::Put { key, .. }) => {
                assert_eq!(topic, Topic::store_master("s"));
                assert_eq!(key, Data::from("k"));
            }
            other => panic!("unexpected publish {other:?}"),
        }

        // The clone did not apply the write locally.
        assert_eq!(get(&fx.tx, "k").await, Err(ErrorCode::NoSuchKey));
    }

    #[tokio::test]
    async fn replicated_expire_erases_locally() {
        let fx = clone_store(CloneSettings::default());

        fx.tx
            .send(StoreInput::Command(Command::SnapshotSync {
                snapshot: snapshot_with("k", Data::Count(1)),
                seq: 1,
            }))
            .expect("send");
        assert_eq!(get(&fx.tx, "k").await.unwrap(), Data::Count(1));

        fx.tx
            .send(StoreInput::Command(Command::Expire {
                key: Data::from("k"),
            }))
            .expect("send");
        assert_eq!(get(&fx.tx, "k").await, Err(ErrorCode::NoSuchKey));
    }

    #[tokio::test]
    async fn resync_fires_while_disconnected() {
        let mut fx = clone_store(CloneSettings {
            resync_interval: magnetite_types::Timespan::from_millis(10),
            ..CloneSettings::default()
        });
        let _ = fx.published.recv().await; // initial snapshot request

        // With no master answering, the resync tick requests again and
        // reports the master unavailable.
        let again = tokio::time::timeout(std::time::Duration::from_secs(5), fx.published.recv())
            .await
            .expect("resync within deadline")
            .expect("publish");
        assert!(matches!(
            again,
            Message::Command(_, Command::SnapshotRequest { .. })
        ));

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), fx.status.recv())
            .await
            .expect("status within deadline")
            .expect("event");
        assert_eq!(
            event,
            StatusEvent::MasterUnavailable {
                store: "s".to_string()
            }
        );
    }
}
