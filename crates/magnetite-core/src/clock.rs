//! Endpoint clock: wall-clock or virtual time plus deferred delivery.
//!
//! In real-time mode, `send_later` hands the message to the tokio timer.
//! In virtual mode the clock holds a pending map keyed by delivery time;
//! [`Clock::advance_time`] moves time forward, dispatches everything that
//! came due in ascending order (FIFO at equal timestamps), and then runs a
//! synchronization barrier: each recipient that got a message is probed
//! with a [`TimerMessage::SyncPoint`] and the call returns only once every
//! probe was answered or timed out. Callers replaying captures in logical
//! time rely on downstream actors having observed their messages before
//! `advance_time` returns.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{mpsc, oneshot};

use magnetite_types::{Data, Message, NetworkInfo, Timespan, Timestamp};

use crate::timeout;

/// Maintenance ticks delivered through the clock.
#[derive(Debug)]
pub enum Tick {
    /// Re-attempt a pending peering.
    RetryPeer(NetworkInfo),
    /// A store key's expiry came due.
    Expire(Data),
    /// A clone should look for its master again.
    Resync,
    /// A clone should check how long its master has been silent.
    StaleCheck,
}

/// Payloads deliverable via [`Clock::send_later`].
#[derive(Debug)]
pub enum TimerMessage {
    /// Internal maintenance.
    Tick(Tick),
    /// A deferred published message, routed by the core on arrival.
    Deliver(Message),
    /// Barrier probe; the receiver acknowledges by completing the channel.
    SyncPoint(oneshot::Sender<()>),
}

static NEXT_RECIPIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A mailbox that can receive timer messages.
///
/// Identity (for barrier deduplication) is the id assigned at
/// construction, so clones of one recipient count as the same actor.
#[derive(Debug, Clone)]
pub struct Recipient {
    id: u64,
    tx: mpsc::UnboundedSender<TimerMessage>,
}

impl Recipient {
    pub fn new(tx: mpsc::UnboundedSender<TimerMessage>) -> Self {
        Self {
            id: NEXT_RECIPIENT_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Creates a recipient together with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TimerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Delivers a message; failures mean the actor is gone and are
    /// ignored, like any send to a dead mailbox.
    pub fn send(&self, msg: TimerMessage) {
        let _ = self.tx.send(msg);
    }
}

type PendingMap = BTreeMap<Timestamp, VecDeque<(Recipient, TimerMessage)>>;

/// The endpoint's clock.
pub struct Clock {
    real_time: bool,
    runtime: tokio::runtime::Handle,
    /// Virtual time; unused in real-time mode.
    virtual_now: AtomicI64,
    /// Messages awaiting a future virtual time.
    pending: Mutex<PendingMap>,
    /// Entry count, readable without the lock so the common no-work case
    /// stays cheap.
    pending_count: AtomicUsize,
}

impl Clock {
    pub fn new(runtime: tokio::runtime::Handle, use_real_time: bool) -> Self {
        Self {
            real_time: use_real_time,
            runtime,
            virtual_now: AtomicI64::new(0),
            pending: Mutex::new(PendingMap::new()),
            pending_count: AtomicUsize::new(0),
        }
    }

    /// Whether this clock follows the wall clock.
    pub fn is_real_time(&self) -> bool {
        self.real_time
    }

    /// Current time: wall clock, or the last-advanced virtual time.
    pub fn now(&self) -> Timestamp {
        if self.real_time {
            Timestamp::now()
        } else {
            Timestamp::from_nanos(self.virtual_now.load(Ordering::SeqCst))
        }
    }

    /// Schedules `msg` for delivery to `to` after `after` has elapsed.
    pub fn send_later(&self, to: Recipient, after: Timespan, msg: TimerMessage) {
        if self.real_time {
            let delay = after.to_duration();
            self.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                to.send(msg);
            });
            return;
        }
        let at = self.now() + after;
        let mut pending = self.pending.lock().expect("clock mutex");
        pending.entry(at).or_default().push_back((to, msg));
        self.pending_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of messages waiting for a future virtual time.
    pub fn pending_count(&self) -> usize {
        self.pending_count.load(Ordering::SeqCst)
    }

    /// Advances virtual time to `t` and dispatches everything due.
    ///
    /// A no-op in real-time mode or when `t` does not move time forward.
    /// The pending lock is released before the barrier so dispatched
    /// actors can schedule follow-ups without deadlocking.
    pub async fn advance_time(&self, t: Timestamp) {
        if self.real_time {
            return;
        }
        if t.as_nanos() <= self.virtual_now.load(Ordering::SeqCst) {
            return;
        }
        self.virtual_now.store(t.as_nanos(), Ordering::SeqCst);

        if self.pending_count.load(Ordering::SeqCst) == 0 {
            return;
        }

        let due = {
            let mut pending = self.pending.lock().expect("clock mutex");
            // Everything strictly after `t` stays pending.
            let keep = pending.split_off(&Timestamp::from_nanos(t.as_nanos() + 1));
            std::mem::replace(&mut *pending, keep)
        };

        let mut sync_with: HashMap<u64, Recipient> = HashMap::new();
        let mut dispatched = 0usize;
        for (_, queue) in due {
            for (recipient, msg) in queue {
                sync_with
                    .entry(recipient.id)
                    .or_insert_with(|| recipient.clone());
                recipient.send(msg);
                dispatched += 1;
            }
        }
        self.pending_count.fetch_sub(dispatched, Ordering::SeqCst);

        for (_, recipient) in sync_with {
            let (ack_tx, ack_rx) = oneshot::channel();
            recipient.send(TimerMessage::SyncPoint(ack_tx));
            match tokio::time::timeout(timeout::FRONTEND, ack_rx).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    tracing::debug!("advance_time sync target dropped its mailbox");
                }
                Err(_) => {
                    tracing::debug!("advance_time actor syncing timed out");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn clock(real_time: bool) -> Arc<Clock> {
        Arc::new(Clock::new(tokio::runtime::Handle::current(), real_time))
    }

    #[tokio::test]
    async fn virtual_now_starts_at_zero_and_advances() {
        let clock = clock(false);
        assert_eq!(clock.now(), Timestamp::ZERO);

        clock.advance_time(Timestamp::from_nanos(1_000)).await;
        assert_eq!(clock.now(), Timestamp::from_nanos(1_000));

        // Moving backwards is ignored.
        clock.advance_time(Timestamp::from_nanos(500)).await;
        assert_eq!(clock.now(), Timestamp::from_nanos(1_000));
    }

    #[tokio::test]
    async fn deferred_messages_dispatch_in_order_with_fifo_ties() {
        let clock = clock(false);
        let (recipient, mut rx) = Recipient::channel();

        // Two messages at the same instant, one later.
        clock.send_later(
            recipient.clone(),
            Timespan::from_nanos(100),
            TimerMessage::Deliver(Message::Data("/a".into(), Data::Count(1))),
        );
        clock.send_later(
            recipient.clone(),
            Timespan::from_nanos(100),
            TimerMessage::Deliver(Message::Data("/a".into(), Data::Count(2))),
        );
        clock.send_later(
            recipient.clone(),
            Timespan::from_nanos(200),
            TimerMessage::Deliver(Message::Data("/a".into(), Data::Count(3))),
        );
        assert_eq!(clock.pending_count(), 3);

        // Answer the barrier probe from a helper task so advance_time can
        // complete.
        let answer = tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                match rx.recv().await {
                    Some(TimerMessage::SyncPoint(ack)) => {
                        let _ = ack.send(());
                        if seen.len() == 3 {
                            break;
                        }
                    }
                    Some(TimerMessage::Deliver(Message::Data(_, Data::Count(n)))) => seen.push(n),
                    Some(_) => {}
                    None => break,
                }
            }
            seen
        });

        clock.advance_time(Timestamp::from_nanos(250)).await;
        assert_eq!(clock.pending_count(), 0);
        assert_eq!(answer.await.expect("join"), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn advance_leaves_future_messages_pending() {
        let clock = clock(false);
        let (recipient, mut rx) = Recipient::channel();

        clock.send_later(
            recipient.clone(),
            Timespan::from_nanos(100),
            TimerMessage::Tick(Tick::Resync),
        );
        clock.send_later(
            recipient.clone(),
            Timespan::from_nanos(1_000),
            TimerMessage::Tick(Tick::StaleCheck),
        );

        let answer = tokio::spawn(async move {
            let mut got = Vec::new();
            loop {
                match rx.recv().await {
                    Some(TimerMessage::SyncPoint(ack)) => {
                        let _ = ack.send(());
                        break;
                    }
                    Some(msg) => got.push(msg),
                    None => break,
                }
            }
            (got, rx)
        });

        clock.advance_time(Timestamp::from_nanos(100)).await;
        let (got, mut rx) = answer.await.expect("join");
        assert_eq!(got.len(), 1);
        assert!(matches!(got[0], TimerMessage::Tick(Tick::Resync)));
        assert_eq!(clock.pending_count(), 1);

        let answer = tokio::spawn(async move {
            let mut got = Vec::new();
            loop {
                match rx.recv().await {
                    Some(TimerMessage::SyncPoint(ack)) => {
                        let _ = ack.send(());
                        break;
                    }
                    Some(msg) => got.push(msg),
                    None => break,
                }
            }
            got
        });
        clock.advance_time(Timestamp::from_nanos(2_000)).await;
        let rest = answer.await.expect("join");
        assert_eq!(rest.len(), 1);
        assert!(matches!(rest[0], TimerMessage::Tick(Tick::StaleCheck)));
    }

    #[tokio::test]
    async fn advance_time_is_noop_in_real_time_mode() {
        let clock = clock(true);
        let before = clock.now();
        clock.advance_time(before + Timespan::from_secs(3600)).await;
        // Wall clock keeps its own counsel.
        assert!(clock.now() - before < Timespan::from_secs(60));
    }

    #[tokio::test]
    async fn real_time_send_later_uses_the_runtime_timer() {
        let clock = clock(true);
        let (recipient, mut rx) = Recipient::channel();
        clock.send_later(
            recipient,
            Timespan::from_millis(10),
            TimerMessage::Tick(Tick::Resync),
        );
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timer fired")
            .expect("message");
        assert!(matches!(msg, TimerMessage::Tick(Tick::Resync)));
    }
}
