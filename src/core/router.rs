//! Event router.
//!
//! The [`Router`] drains the pipeline queue and fans each event out to the
//! queues of the currently active stages:
//!
//! ```text
//! Event (type: "sensor")          Event (type: "chat")
//!     │                               │
//!     ▼                               ▼
//! ┌──────────────────────┐       ┌──────────────┐
//! │ storage  ◄── copy    │       │ chat only    │
//! │ masking  ◄── copy    │       └──────────────┘
//! │ synth    ◄── copy    │
//! └──────────────────────┘
//! ```
//!
//! The active service list is read from [`SharedConfig`] for every event,
//! so changing it at runtime takes effect on the next event.

use std::fmt;

use tracing::{debug, info, instrument, warn};

use crate::config::SharedConfig;
use crate::domain::Event;

use super::queues::{Consumer, Producer, QueueError, QueueFabric, QueueRole};
use super::shutdown::ShutdownListener;

/// A service name from the configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Service {
    /// Persist raw events
    Storage,
    /// Mask events
    Masking,
    /// Persist masked and synthesized events
    MaskStorage,
    /// Synthesize replicas without a masked copy
    Synth,
    /// Answer chat events
    Model,
    /// Ignored everywhere
    Unknown(String),
}

impl Service {
    pub fn parse(name: &str) -> Self {
        match name.trim() {
            "storage" => Self::Storage,
            "masking" => Self::Masking,
            "mask_storage" => Self::MaskStorage,
            "synth" => Self::Synth,
            "model" => Self::Model,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Storage => "storage",
            Self::Masking => "masking",
            Self::MaskStorage => "mask_storage",
            Self::Synth => "synth",
            Self::Model => "model",
            Self::Unknown(name) => name,
        }
    }

    /// Queue that receives broadcast copies for this service, if any
    pub fn broadcast_queue(&self) -> Option<QueueRole> {
        match self {
            Self::Storage => Some(QueueRole::Storage),
            Self::Masking => Some(QueueRole::Masking),
            Self::Synth => Some(QueueRole::Synthesis),
            _ => None,
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Outcome of routing one event
#[derive(Debug, Default)]
pub struct RouteResult {
    /// Queues that received a copy
    pub delivered: Vec<QueueRole>,

    /// Queues that refused it
    pub failed: Vec<(QueueRole, QueueError)>,
}

impl RouteResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Fans events out to stage queues
#[derive(Debug, Clone)]
pub struct Router {
    storage: Producer<Event>,
    masking: Producer<Event>,
    synthesis: Producer<Event>,
    chat: Producer<Event>,
}

impl Router {
    pub fn new(fabric: &QueueFabric) -> Self {
        Self {
            storage: fabric.producer(QueueRole::Storage),
            masking: fabric.producer(QueueRole::Masking),
            synthesis: fabric.producer(QueueRole::Synthesis),
            chat: fabric.producer(QueueRole::Chat),
        }
    }

    fn producer(&self, role: QueueRole) -> Option<&Producer<Event>> {
        match role {
            QueueRole::Storage => Some(&self.storage),
            QueueRole::Masking => Some(&self.masking),
            QueueRole::Synthesis => Some(&self.synthesis),
            QueueRole::Chat => Some(&self.chat),
            _ => None,
        }
    }

    /// Targets for an event: chat events go to the chat queue only, anything
    /// else to each active broadcast stage once
    pub fn targets(event: &Event, services: &[Service]) -> Vec<QueueRole> {
        if event.is_chat() {
            return vec![QueueRole::Chat];
        }

        let mut targets = Vec::new();
        for role in services.iter().filter_map(Service::broadcast_queue) {
            if !targets.contains(&role) {
                targets.push(role);
            }
        }
        targets
    }

    /// Deliver one event. Failed deliveries are logged and dropped.
    pub async fn route(&self, event: Event, services: &[Service]) -> RouteResult {
        let mut result = RouteResult::default();

        for role in Self::targets(&event, services) {
            let Some(producer) = self.producer(role) else {
                continue;
            };

            match producer.send(event.clone()).await {
                Ok(()) => result.delivered.push(role),
                Err(e) => {
                    warn!(
                        event_type = %event.event_type,
                        queue = %role,
                        error = %e,
                        "Dropping event for stage"
                    );
                    result.failed.push((role, e));
                }
            }
        }

        if result.delivered.is_empty() && result.failed.is_empty() {
            debug!(event_type = %event.event_type, "No active stage for event");
        }
        result
    }

    #[instrument(name = "router", skip_all)]
    pub async fn run(
        self,
        mut input: Consumer<Event>,
        config: SharedConfig,
        mut shutdown: ShutdownListener,
    ) {
        info!("Router started");

        let mut routed = 0usize;
        while let Some(event) = input.next(&mut shutdown).await {
            let snapshot = config.snapshot();
            debug!(event_type = %event.event_type, "Routing event");
            self.route(event, &snapshot.services).await;
            routed += 1;
        }

        info!(routed, "Router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Payload;

    fn event(event_type: &str) -> Event {
        Event::new(event_type, Payload::new())
    }

    #[test]
    fn test_parse_services() {
        assert_eq!(Service::parse("mask_storage"), Service::MaskStorage);
        assert_eq!(Service::parse(" synth "), Service::Synth);
        assert_eq!(
            Service::parse("telemetry"),
            Service::Unknown("telemetry".to_string())
        );
        assert_eq!(Service::MaskStorage.to_string(), "mask_storage");
    }

    #[test]
    fn test_targets_broadcast_once() {
        let services = vec![
            Service::Storage,
            Service::MaskStorage,
            Service::Masking,
            Service::Storage,
            Service::Model,
            Service::Unknown("x".to_string()),
        ];

        assert_eq!(
            Router::targets(&event("sensor"), &services),
            vec![QueueRole::Storage, QueueRole::Masking]
        );
    }

    #[test]
    fn test_chat_bypasses_fanout() {
        let services = vec![Service::Storage, Service::Masking, Service::Synth];
        assert_eq!(
            Router::targets(&event("chat"), &services),
            vec![QueueRole::Chat]
        );
    }

    #[tokio::test]
    async fn test_route_reports_closed_queue() {
        let mut fabric = QueueFabric::default();
        let mut storage = fabric.take_consumer(QueueRole::Storage).unwrap();
        fabric.close(QueueRole::Masking);
        let router = Router::new(&fabric);

        let result = router
            .route(event("sensor"), &[Service::Storage, Service::Masking])
            .await;

        assert_eq!(result.delivered, vec![QueueRole::Storage]);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].0, QueueRole::Masking);
        assert_eq!(storage.recv().await.unwrap().event_type, "sensor");
    }
}
