//! Application-facing publish/subscribe handles.
//!
//! These are thin, synchronous wrappers over the core's channels; the
//! actors behind them live inside the endpoint's runtime.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use magnetite_types::{Data, Filter, Message, StatusEvent, Topic};

use crate::router::CoreRequest;

/// Publishes onto one fixed topic.
#[derive(Debug, Clone)]
pub struct Publisher {
    topic: Topic,
    core: mpsc::UnboundedSender<CoreRequest>,
}

impl Publisher {
    pub(crate) fn new(topic: Topic, core: mpsc::UnboundedSender<CoreRequest>) -> Self {
        Self { topic, core }
    }

    /// The topic this publisher writes to.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Publishes `data`. Fire-and-forget; sends after shutdown vanish.
    pub fn publish(&self, data: impl Into<Data>) {
        let _ = self.core.send(CoreRequest::Publish {
            message: Message::Data(self.topic.clone(), data.into()),
        });
    }
}

/// Receives messages matching a topic filter.
///
/// The core drops messages instead of blocking when a subscriber's queue
/// is full, so a stalled consumer slows nobody else down.
#[derive(Debug)]
pub struct Subscriber {
    filter: Filter,
    rx: mpsc::Receiver<(Topic, Data)>,
    runtime: tokio::runtime::Handle,
}

impl Subscriber {
    pub(crate) fn new(
        filter: Filter,
        rx: mpsc::Receiver<(Topic, Data)>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            filter,
            rx,
            runtime,
        }
    }

    /// The filter this subscriber registered.
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Blocks until the next message. `None` once the endpoint shut down.
    pub fn get(&mut self) -> Option<(Topic, Data)> {
        self.rx.blocking_recv()
    }

    /// Async variant of [`get`](Self::get), for consumers living on the
    /// runtime.
    pub async fn recv(&mut self) -> Option<(Topic, Data)> {
        self.rx.recv().await
    }

    /// Blocks up to `timeout` for the next message.
    pub fn get_timeout(&mut self, timeout: Duration) -> Option<(Topic, Data)> {
        self.runtime
            .block_on(async { tokio::time::timeout(timeout, self.rx.recv()).await.ok() })
            .flatten()
    }

    /// Returns a message iff one is already queued.
    pub fn try_get(&mut self) -> Option<(Topic, Data)> {
        self.rx.try_recv().ok()
    }
}

/// Receives endpoint status events.
#[derive(Debug)]
pub struct StatusSubscriber {
    rx: broadcast::Receiver<StatusEvent>,
    runtime: tokio::runtime::Handle,
}

impl StatusSubscriber {
    pub(crate) fn new(rx: broadcast::Receiver<StatusEvent>, runtime: tokio::runtime::Handle) -> Self {
        Self { rx, runtime }
    }

    /// Blocks until the next event. `None` once the endpoint shut down.
    /// A slow subscriber that lagged behind skips to the oldest retained
    /// event rather than erroring out.
    pub fn get(&mut self) -> Option<StatusEvent> {
        loop {
            match self.rx.blocking_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "status subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Blocks up to `timeout` for the next event.
    pub fn get_timeout(&mut self, timeout: Duration) -> Option<StatusEvent> {
        self.runtime.block_on(async {
            loop {
                match tokio::time::timeout(timeout, self.rx.recv()).await {
                    Ok(Ok(event)) => return Some(event),
                    Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                        tracing::warn!(missed, "status subscriber lagged");
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
                }
            }
        })
    }

    /// Async variant of [`get`](Self::get), for consumers living on the
    /// runtime.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "status subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns an event iff one is already queued.
    pub fn try_get(&mut self) -> Option<StatusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "status subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}
