//! Bounded in-memory queues connecting pipeline stages.
//!
//! Every stage reads from exactly one queue. Producers stall when a queue is
//! full (backpressure); an optional send timeout turns a stall into
//! [`QueueError::Timeout`]. Dropping every consumer of a queue closes it, so
//! producers for stages that were never started fail fast instead of
//! blocking forever.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use crate::domain::Event;

use super::diagnostics::MaskReport;
use super::shutdown::ShutdownListener;

/// Errors raised by queue operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Queue '{0}' is closed")]
    Closed(String),

    #[error("Queue '{0}' is full")]
    Full(String),

    #[error("Timed out after {timeout:?} on queue '{queue}'")]
    Timeout { queue: String, timeout: Duration },
}

/// Role of an event queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    /// Decoded events handed over by the ingress adapter
    Ingress,
    /// Events awaiting routing
    Pipeline,
    Storage,
    Masking,
    /// Masked and synthesized events awaiting persistence
    MaskedStorage,
    Synthesis,
    Chat,
}

impl QueueRole {
    pub const ALL: [QueueRole; 7] = [
        QueueRole::Ingress,
        QueueRole::Pipeline,
        QueueRole::Storage,
        QueueRole::Masking,
        QueueRole::MaskedStorage,
        QueueRole::Synthesis,
        QueueRole::Chat,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Pipeline => "pipeline",
            Self::Storage => "storage",
            Self::Masking => "masking",
            Self::MaskedStorage => "masked_storage",
            Self::Synthesis => "synthesis",
            Self::Chat => "chat",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Ingress => 0,
            Self::Pipeline => 1,
            Self::Storage => 2,
            Self::Masking => 3,
            Self::MaskedStorage => 4,
            Self::Synthesis => 5,
            Self::Chat => 6,
        }
    }
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Queue capacity and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Capacity of every queue (default: 1000)
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Give up on a full queue after this long (default: wait forever)
    #[serde(default)]
    pub send_timeout_ms: Option<u64>,

    /// Idle interval between shutdown checks while a queue is empty
    #[serde(default)]
    pub recv_timeout_ms: Option<u64>,
}

fn default_capacity() -> usize {
    1000
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            send_timeout_ms: None,
            recv_timeout_ms: None,
        }
    }
}

impl QueueSettings {
    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        self.recv_timeout_ms.map(Duration::from_millis)
    }
}

/// Create a bounded queue
pub fn bounded<T>(name: &str, settings: &QueueSettings) -> (Producer<T>, Consumer<T>) {
    let (sender, receiver) = mpsc::channel(settings.capacity.max(1));
    (
        Producer {
            name: name.to_string(),
            sender,
            send_timeout: settings.send_timeout(),
        },
        Consumer {
            name: name.to_string(),
            receiver,
            recv_timeout: settings.recv_timeout(),
        },
    )
}

/// Sending half of a queue
#[derive(Debug)]
pub struct Producer<T> {
    name: String,
    sender: mpsc::Sender<T>,
    send_timeout: Option<Duration>,
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
            send_timeout: self.send_timeout,
        }
    }
}

impl<T> Producer<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue, waiting for capacity (bounded by the send timeout, if any)
    pub async fn send(&self, item: T) -> Result<(), QueueError> {
        match self.send_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.sender.send(item))
                .await
                .map_err(|_| QueueError::Timeout {
                    queue: self.name.clone(),
                    timeout,
                })?
                .map_err(|_| QueueError::Closed(self.name.clone())),
            None => self
                .sender
                .send(item)
                .await
                .map_err(|_| QueueError::Closed(self.name.clone())),
        }
    }

    /// Enqueue without waiting
    pub fn try_send(&self, item: T) -> Result<(), QueueError> {
        self.sender.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed(self.name.clone()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Receiving half of a queue
#[derive(Debug)]
pub struct Consumer<T> {
    name: String,
    receiver: mpsc::Receiver<T>,
    recv_timeout: Option<Duration>,
}

impl<T> Consumer<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dequeue; `None` once every producer is gone and the queue is drained
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Dequeue with a deadline. `Ok(None)` means the queue is closed.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<T>, QueueError> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .map_err(|_| QueueError::Timeout {
                queue: self.name.clone(),
                timeout,
            })
    }

    /// Next item for a worker loop: `None` on close or shutdown
    pub async fn next(&mut self, shutdown: &mut ShutdownListener) -> Option<T> {
        loop {
            if shutdown.is_shutdown() {
                return None;
            }

            let received = match self.recv_timeout {
                Some(timeout) => tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return None,
                    result = self.recv_timeout(timeout) => result,
                },
                None => tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return None,
                    item = self.receiver.recv() => Ok(item),
                },
            };

            match received {
                Ok(item) => return item,
                Err(_) => trace!(queue = %self.name, "Queue idle"),
            }
        }
    }

    /// Number of items waiting
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

struct Slot {
    producer: Producer<Event>,
    consumer: Option<Consumer<Event>>,
}

/// The fixed set of queues connecting the pipeline stages.
///
/// Producers are cloned out; each consumer can be taken exactly once. The
/// fabric itself holds a producer for every queue, so it must be dropped
/// once wiring is done for close-cascades to reach the workers.
pub struct QueueFabric {
    settings: QueueSettings,
    slots: Vec<Slot>,
    errors: Producer<MaskReport>,
    error_consumer: Option<Consumer<MaskReport>>,
}

impl QueueFabric {
    pub fn new(settings: QueueSettings) -> Self {
        let slots = QueueRole::ALL
            .iter()
            .map(|role| {
                let (producer, consumer) = bounded(role.name(), &settings);
                Slot {
                    producer,
                    consumer: Some(consumer),
                }
            })
            .collect();
        let (errors, error_consumer) = bounded("error", &settings);

        Self {
            settings,
            slots,
            errors,
            error_consumer: Some(error_consumer),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Producer for a queue
    pub fn producer(&self, role: QueueRole) -> Producer<Event> {
        self.slots[role.index()].producer.clone()
    }

    /// Take the consumer for a queue; `None` if already taken
    pub fn take_consumer(&mut self, role: QueueRole) -> Option<Consumer<Event>> {
        self.slots[role.index()].consumer.take()
    }

    /// Drop a queue's consumer so its producers see it as closed
    pub fn close(&mut self, role: QueueRole) {
        self.slots[role.index()].consumer = None;
    }

    /// Producer for diagnostic records
    pub fn error_producer(&self) -> Producer<MaskReport> {
        self.errors.clone()
    }

    /// Take the diagnostics consumer; `None` if already taken
    pub fn take_error_consumer(&mut self) -> Option<Consumer<MaskReport>> {
        self.error_consumer.take()
    }
}

impl Default for QueueFabric {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shutdown::ShutdownSignal;
    use crate::domain::Payload;

    fn event(n: usize) -> Event {
        Event::new(format!("e{}", n), Payload::new())
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let mut fabric = QueueFabric::default();
        let producer = fabric.producer(QueueRole::Storage);
        let mut consumer = fabric.take_consumer(QueueRole::Storage).unwrap();
        assert!(fabric.take_consumer(QueueRole::Storage).is_none());

        for n in 0..5 {
            producer.send(event(n)).await.unwrap();
        }
        for n in 0..5 {
            assert_eq!(consumer.recv().await.unwrap().event_type, format!("e{}", n));
        }
    }

    #[tokio::test]
    async fn test_send_timeout_on_full_queue() {
        let settings = QueueSettings {
            capacity: 1,
            send_timeout_ms: Some(20),
            recv_timeout_ms: None,
        };
        let (producer, _consumer) = bounded::<Event>("tiny", &settings);

        producer.send(event(0)).await.unwrap();
        let result = producer.send(event(1)).await;
        assert!(matches!(result, Err(QueueError::Timeout { .. })));
        assert!(matches!(producer.try_send(event(2)), Err(QueueError::Full(_))));
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_sends() {
        let mut fabric = QueueFabric::default();
        let producer = fabric.producer(QueueRole::Chat);
        fabric.close(QueueRole::Chat);

        assert_eq!(
            producer.send(event(0)).await,
            Err(QueueError::Closed("chat".to_string()))
        );
    }

    #[tokio::test]
    async fn test_next_stops_on_shutdown() {
        let settings = QueueSettings {
            recv_timeout_ms: Some(5),
            ..Default::default()
        };
        let (_producer, mut consumer) = bounded::<Event>("idle", &settings);
        let signal = ShutdownSignal::new();
        let mut listener = signal.subscribe();

        signal.trigger();
        assert!(consumer.next(&mut listener).await.is_none());
    }

    #[tokio::test]
    async fn test_next_ends_when_producers_drop() {
        let (producer, mut consumer) = bounded::<Event>("short", &QueueSettings::default());
        let signal = ShutdownSignal::new();
        let mut listener = signal.subscribe();

        producer.send(event(1)).await.unwrap();
        drop(producer);

        assert!(consumer.next(&mut listener).await.is_some());
        assert!(consumer.next(&mut listener).await.is_none());
    }
}
