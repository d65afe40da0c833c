//! Master store actor.

use std::sync::Arc;

use tokio::sync::mpsc;

use magnetite_backend::Backend;
use magnetite_types::{Command, Data, Message, Timespan, Topic};

use crate::clock::{Clock, Recipient, Tick, TimerMessage};

use super::{StoreApi, StoreInput, apply_mutation, serve_read};

/// Owns the authoritative backend of one store.
///
/// Commands arrive sequentially through the mailbox (from local handles
/// and from the `<name>/data/master` topic alike); each applied mutation
/// is rebroadcast on `<name>/data/clone`, which makes the mailbox order
/// the store's canonical command order.
pub(crate) struct MasterActor {
    name: String,
    backend: Box<dyn Backend>,
    clock: Arc<Clock>,
    /// Published messages flow back into the core router.
    publish: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<StoreInput>,
    timer_rx: mpsc::UnboundedReceiver<TimerMessage>,
    recipient: Recipient,
    /// Count of committed mutations; carried in snapshots.
    seq: u64,
}

impl MasterActor {
    /// Spawns the actor, returning its mailbox.
    pub(crate) fn spawn(
        name: String,
        backend: Box<dyn Backend>,
        clock: Arc<Clock>,
        publish: mpsc::UnboundedSender<Message>,
        runtime: &tokio::runtime::Handle,
    ) -> mpsc::UnboundedSender<StoreInput> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (recipient, timer_rx) = Recipient::channel();
        let actor = Self {
            name,
            backend,
            clock,
            publish,
            rx,
            timer_rx,
            recipient,
            seq: 0,
        };
        runtime.spawn(actor.run());
        tx
    }

    async fn run(mut self) {
        tracing::debug!(store = %self.name, "master attached");
        loop {
            tokio::select! {
                input = self.rx.recv() => match input {
                    None | Some(StoreInput::Terminate) => break,
                    Some(StoreInput::Command(cmd)) => self.handle_command(cmd),
                    Some(StoreInput::Api(api)) => self.handle_api(api),
                },
                timer = self.timer_rx.recv() => match timer {
                    None => break,
                    Some(TimerMessage::Tick(Tick::Expire(key))) => self.sweep(key),
                    Some(TimerMessage::SyncPoint(ack)) => {
                        let _ = ack.send(());
                    }
                    Some(_) => {}
                },
            }
        }
        tracing::debug!(store = %self.name, "master detached");
    }

    /// A command from the pub/sub stream (a clone's forwarded mutation or
    /// snapshot request).
    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SnapshotRequest { requester } => {
                tracing::debug!(store = %self.name, %requester, "serving snapshot");
                match self.backend.snapshot(self.clock.now()) {
                    Ok(snapshot) => self.broadcast(Command::SnapshotSync {
                        snapshot,
                        seq: self.seq,
                    }),
                    Err(err) => {
                        tracing::warn!(store = %self.name, %err, "snapshot failed");
                    }
                }
            }
            // Only this actor originates expiries and snapshots.
            Command::Expire { .. } | Command::SnapshotSync { .. } => {}
            cmd => {
                if let Err(err) = self.commit(cmd) {
                    tracing::warn!(store = %self.name, %err, "dropping bad command");
                }
            }
        }
    }

    fn handle_api(&mut self, api: StoreApi) {
        let Some(api) = serve_read(self.backend.as_ref(), api, self.clock.now()) else {
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
            // serve_read answered everything else already.
            _ => return,
        };
        let result = self.commit(cmd).map_err(|e| e.code());
        let _ = reply.send(result);
    }

    /// Applies a mutation; on success bumps the sequence and rebroadcasts
    /// to clones.
    fn commit(&mut self, cmd: Command) -> Result<(), magnetite_backend::BackendError> {
        apply_mutation(self.backend.as_mut(), cmd.clone())?;
        self.schedule_expiry(&cmd);
        self.seq += 1;
        self.broadcast(cmd);
        Ok(())
    }

    /// Arms an expiry sweep for commands that set one.
    fn schedule_expiry(&self, cmd: &Command) {
        let (key, expiry) = match cmd {
            Command::Put {
                key,
                expiry: Some(at),
                ..
            }
            | Command::Add {
                key,
                expiry: Some(at),
                ..
            }
            | Command::Subtract {
                key,
                expiry: Some(at),
                ..
            } => (key.clone(), *at),
            _ => return,
        };
        let delay = (expiry - self.clock.now()).max(Timespan::ZERO);
        self.clock
            .send_later(self.recipient.clone(), delay, TimerMessage::Tick(Tick::Expire(key)));
    }

    /// An armed expiry came due. The sweep re-checks the backend: the key
    /// may have been overwritten with a later expiry in the meantime.
    fn sweep(&mut self, key: Data) {
        let now = self.clock.now();
        match self.backend.expire(&key, now) {
            Ok(true) => {
                self.seq += 1;
                self.broadcast(Command::Expire { key });
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(store = %self.name, %err, "expiry sweep failed");
            }
        }
    }

    fn broadcast(&self, cmd: Command) {
        let _ = self
            .publish
            .send(Message::Command(Topic::store_clone(&self.name), cmd));
    }
}
