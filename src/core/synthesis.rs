//! Synthetic replica generation.
//!
//! For a raw event whose rule set asks for `synthetic_count = k`, the
//! [`SynthesisEngine`] produces `k` replicas typed `synthed_<type>`. Every
//! replica starts from a fresh copy of the raw payload and re-runs the whole
//! rule set, so randomizing operators sample independently per replica.
//!
//! Jobs run on a [`SynthesisPool`] that bounds how many are in flight and
//! reports every completion.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SharedConfig;
use crate::domain::{Event, RuleBook};

use super::diagnostics::{publish, MaskReport};
use super::masking::MaskingEngine;
use super::queues::{Consumer, Producer, QueueError};
use super::shutdown::ShutdownListener;

/// Synthesis pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisSettings {
    /// Maximum concurrent synthesis jobs (default: 16)
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_max_in_flight() -> usize {
    16
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
        }
    }
}

/// Result of one synthesis job
#[derive(Debug, Clone)]
pub struct SynthesisReport {
    /// Type of the raw event
    pub event_type: String,

    /// Replicas requested by the rule set
    pub requested: usize,

    /// Replicas enqueued
    pub produced: usize,

    /// Why the job stopped early, if it did
    pub error: Option<QueueError>,
}

impl SynthesisReport {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.produced == self.requested
    }
}

/// Generates replicas and enqueues them onto the masked-storage queue
pub struct SynthesisEngine {
    engine: MaskingEngine,
    output: Producer<Event>,
    diagnostics: Option<Producer<MaskReport>>,
}

impl SynthesisEngine {
    pub fn new(engine: MaskingEngine, output: Producer<Event>) -> Self {
        Self {
            engine,
            output,
            diagnostics: None,
        }
    }

    /// Send rule diagnostics for every replica to this queue
    pub fn with_diagnostics(mut self, diagnostics: Producer<MaskReport>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Produce and enqueue every replica the event's rule set asks for
    pub async fn synthesize(&self, raw: &Event, rules: &RuleBook) -> SynthesisReport {
        let mut report = SynthesisReport {
            event_type: raw.event_type.clone(),
            requested: 0,
            produced: 0,
            error: None,
        };

        let Some(set) = rules.get(&raw.rule_key()) else {
            return report;
        };
        report.requested = set.synth_amount;

        for replica in 0..set.synth_amount {
            let (event, rule_report) = self.engine.synthesize_replica(raw, set, replica);
            if let Some(ref diagnostics) = self.diagnostics {
                publish(diagnostics, rule_report);
            }

            if let Err(e) = self.output.send(event).await {
                report.error = Some(e);
                break;
            }
            report.produced += 1;
        }

        report
    }
}

/// Bounded pool of in-flight synthesis jobs.
///
/// `submit` waits for a free slot (backpressure on the submitter) but never
/// for the job itself. Finished jobs are reaped on each submit; `drain`
/// waits for everything still running.
pub struct SynthesisPool {
    engine: Arc<SynthesisEngine>,
    permits: Arc<Semaphore>,
    tasks: JoinSet<SynthesisReport>,
}

impl SynthesisPool {
    pub fn new(engine: SynthesisEngine, settings: &SynthesisSettings) -> Self {
        Self {
            engine: Arc::new(engine),
            permits: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
            tasks: JoinSet::new(),
        }
    }

    /// Start a synthesis job for `raw`
    pub async fn submit(&mut self, raw: Event, rules: Arc<RuleBook>) {
        self.reap();

        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(event_type = %raw.event_type, "Synthesis pool closed, dropping job");
                return;
            }
        };

        let engine = self.engine.clone();
        self.tasks.spawn(async move {
            let _permit = permit;
            engine.synthesize(&raw, &rules).await
        });
    }

    /// Jobs not yet reaped
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Collect reports of jobs that already finished
    pub fn reap(&mut self) -> Vec<SynthesisReport> {
        let mut reports = Vec::new();
        while let Some(result) = self.tasks.try_join_next() {
            if let Some(report) = log_completion(result) {
                reports.push(report);
            }
        }
        reports
    }

    /// Wait for every in-flight job
    pub async fn drain(&mut self) -> Vec<SynthesisReport> {
        let mut reports = Vec::new();
        while let Some(result) = self.tasks.join_next().await {
            if let Some(report) = log_completion(result) {
                reports.push(report);
            }
        }
        reports
    }
}

fn log_completion(
    result: Result<SynthesisReport, tokio::task::JoinError>,
) -> Option<SynthesisReport> {
    match result {
        Ok(report) => {
            match report.error {
                Some(ref e) => warn!(
                    event_type = %report.event_type,
                    produced = report.produced,
                    requested = report.requested,
                    error = %e,
                    "Synthesis stopped early"
                ),
                None => debug!(
                    event_type = %report.event_type,
                    produced = report.produced,
                    "Synthesis complete"
                ),
            }
            Some(report)
        }
        Err(e) => {
            error!(error = %e, "Synthesis job panicked");
            None
        }
    }
}

/// Worker for the `synth` service: synthesizes every event it receives
pub struct SynthesisWorker {
    config: SharedConfig,
    pool: SynthesisPool,
}

impl SynthesisWorker {
    pub fn new(config: SharedConfig, pool: SynthesisPool) -> Self {
        Self { config, pool }
    }

    #[instrument(name = "synth", skip_all)]
    pub async fn run(mut self, mut input: Consumer<Event>, mut shutdown: ShutdownListener) {
        info!("Synthesis service started");

        while let Some(event) = input.next(&mut shutdown).await {
            debug!(event_type = %event.event_type, "Synthesizing event");
            let rules = self.config.rules();
            self.pool.submit(event, rules).await;
        }

        let reports = self.pool.drain().await;
        info!(pending_jobs = reports.len(), "Synthesis service stopped");
    }
}
