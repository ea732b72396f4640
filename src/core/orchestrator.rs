//! Pipeline assembly and lifecycle.
//!
//! The [`Orchestrator`] builds the queue fabric, primes one worker per
//! active service and starts the router. Priming order:
//!
//! 1. diagnostics and the ingress relay (always)
//! 2. masked-storage persistence, if `mask_storage` is active; this also
//!    turns on forwarding from the masking stage
//! 3. one worker per recognized service (`storage`, `masking`, `synth`,
//!    `model`), in configured order
//!
//! Queues of stages that were not started are closed, so anything routed to
//! them is rejected instead of filling up.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::adapters::{DocumentStore, LanguageModel};
use crate::config::{Config, SharedConfig};
use crate::domain::Event;

use super::diagnostics::run_diagnostics;
use super::masking::{MaskingEngine, MaskingWorker};
use super::queues::{QueueFabric, QueueRole, QueueSettings};
use super::router::{Router, Service};
use super::shutdown::ShutdownSignal;
use super::synthesis::{SynthesisEngine, SynthesisPool, SynthesisSettings, SynthesisWorker};
use super::workers::{run_persistence, run_relay, ChatWorker, Ingress, IngressError};

/// Builds and starts the pipeline
pub struct Orchestrator {
    queues: QueueSettings,
    synthesis: SynthesisSettings,
    engine: MaskingEngine,
    store: Arc<dyn DocumentStore>,
    model: Option<Arc<dyn LanguageModel>>,
}

impl Orchestrator {
    /// Orchestrator with default queue and synthesis settings
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            queues: QueueSettings::default(),
            synthesis: SynthesisSettings::default(),
            engine: MaskingEngine::new(),
            store,
            model: None,
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        model: Option<Arc<dyn LanguageModel>>,
    ) -> Self {
        Self::new(store)
            .with_queue_settings(config.queues.clone())
            .with_synthesis_settings(config.synthesis.clone())
            .with_model(model)
    }

    pub fn with_queue_settings(mut self, settings: QueueSettings) -> Self {
        self.queues = settings;
        self
    }

    pub fn with_synthesis_settings(mut self, settings: SynthesisSettings) -> Self {
        self.synthesis = settings;
        self
    }

    pub fn with_model(mut self, model: Option<Arc<dyn LanguageModel>>) -> Self {
        self.model = model;
        self
    }

    pub fn with_engine(mut self, engine: MaskingEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Prime workers for the services active in `shared` and start routing.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip_all)]
    pub fn start(&self, shared: SharedConfig) -> PipelineHandle {
        let mut fabric = QueueFabric::new(self.queues.clone());
        let signal = ShutdownSignal::new();
        let mut tasks = JoinSet::new();
        let services = dedup(&shared.snapshot().services);

        if let Some(errors) = fabric.take_error_consumer() {
            tasks.spawn(run_diagnostics(errors, signal.subscribe()));
        }

        if let Some(ingress) = fabric.take_consumer(QueueRole::Ingress) {
            tasks.spawn(run_relay(
                ingress,
                fabric.producer(QueueRole::Pipeline),
                signal.subscribe(),
            ));
        }

        let forwarding = services.contains(&Service::MaskStorage);
        if forwarding {
            if let Some(input) = fabric.take_consumer(QueueRole::MaskedStorage) {
                tasks.spawn(run_persistence(
                    "mask_storage",
                    input,
                    self.store.clone(),
                    signal.subscribe(),
                ));
            }
        }

        for service in &services {
            match service {
                Service::Storage => {
                    if let Some(input) = fabric.take_consumer(QueueRole::Storage) {
                        tasks.spawn(run_persistence(
                            "storage",
                            input,
                            self.store.clone(),
                            signal.subscribe(),
                        ));
                    }
                }
                Service::Masking => {
                    if let Some(input) = fabric.take_consumer(QueueRole::Masking) {
                        let mut worker = MaskingWorker::new(
                            self.engine.clone(),
                            shared.clone(),
                            self.synthesis_pool(&fabric),
                            fabric.error_producer(),
                        );
                        if forwarding {
                            worker = worker.forward_to(fabric.producer(QueueRole::MaskedStorage));
                        }
                        tasks.spawn(worker.run(input, signal.subscribe()));
                    }
                }
                Service::Synth => {
                    if let Some(input) = fabric.take_consumer(QueueRole::Synthesis) {
                        let pool = self.synthesis_pool(&fabric);
                        let worker = SynthesisWorker::new(shared.clone(), pool);
                        tasks.spawn(worker.run(input, signal.subscribe()));
                    }
                }
                Service::Model => {
                    if let Some(input) = fabric.take_consumer(QueueRole::Chat) {
                        let worker = ChatWorker::new(self.store.clone(), self.model.clone());
                        tasks.spawn(worker.run(input, signal.subscribe()));
                    }
                }
                Service::MaskStorage => {}
                Service::Unknown(name) => warn!(service = %name, "Ignoring unknown service"),
            }
        }

        for role in [
            QueueRole::Storage,
            QueueRole::Masking,
            QueueRole::MaskedStorage,
            QueueRole::Synthesis,
            QueueRole::Chat,
        ] {
            fabric.close(role);
        }

        if let Some(pipeline) = fabric.take_consumer(QueueRole::Pipeline) {
            let router = Router::new(&fabric);
            tasks.spawn(router.run(pipeline, shared, signal.subscribe()));
        }

        let ingress = Ingress::new(fabric.producer(QueueRole::Ingress));
        info!(
            services = ?services.iter().map(Service::name).collect::<Vec<_>>(),
            workers = tasks.len(),
            "Pipeline started"
        );

        PipelineHandle {
            ingress,
            shutdown: signal,
            tasks,
        }
    }

    fn synthesis_pool(&self, fabric: &QueueFabric) -> SynthesisPool {
        let output = fabric.producer(QueueRole::MaskedStorage);
        let engine = SynthesisEngine::new(self.engine.clone(), output)
            .with_diagnostics(fabric.error_producer());
        SynthesisPool::new(engine, &self.synthesis)
    }
}

fn dedup(services: &[Service]) -> Vec<Service> {
    let mut unique = Vec::with_capacity(services.len());
    for service in services {
        if !unique.contains(service) {
            unique.push(service.clone());
        }
    }
    unique
}

/// A running pipeline
pub struct PipelineHandle {
    ingress: Ingress,
    shutdown: ShutdownSignal,
    tasks: JoinSet<()>,
}

impl PipelineHandle {
    /// Handle for feeding events in; clones keep the pipeline open
    pub fn ingress(&self) -> Ingress {
        self.ingress.clone()
    }

    /// Deliver one event
    pub async fn deliver(&self, event: Event) -> Result<(), IngressError> {
        self.ingress.deliver(event).await
    }

    /// Signal that stops every worker
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Number of workers still running
    pub fn workers(&self) -> usize {
        self.tasks.len()
    }

    /// Stop accepting events and wait until every queued event is processed.
    ///
    /// Waits for outstanding [`Ingress`] clones to be dropped as well.
    pub async fn close(self) {
        let Self {
            ingress,
            shutdown: _shutdown,
            tasks,
        } = self;
        drop(ingress);
        join_all(tasks).await;
        info!("Pipeline closed");
    }

    /// Stop every worker now; queued events are dropped
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        join_all(self.tasks).await;
        info!("Pipeline shut down");
    }
}

async fn join_all(mut tasks: JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Pipeline worker failed");
        }
    }
}
