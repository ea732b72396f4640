//! Rule-driven masking.
//!
//! [`MaskingEngine`] is the pure part: it turns one event and a rule book
//! into a masked copy plus a diagnostic record. [`MaskingWorker`] is the
//! `masking` service loop around it, which also forwards masked events to
//! storage and hands synthesis off to a [`SynthesisPool`].

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::SharedConfig;
use crate::domain::{
    Event, MaskOperation, MaskedEvent, Payload, RuleBook, RuleSet, MASKED_PREFIX, SYNTHED_PREFIX,
};

use super::diagnostics::{publish, MaskReport, RuleOutcome, SkipReason};
use super::operators::OperatorRegistry;
use super::queues::{Consumer, Producer};
use super::shutdown::ShutdownListener;
use super::synthesis::SynthesisPool;

/// Result of masking one event
#[derive(Debug, Clone)]
pub struct MaskOutcome {
    pub masked: MaskedEvent,

    /// Per-rule outcomes
    pub report: MaskReport,

    /// Replicas the event's rule set asks for
    pub synth_amount: usize,
}

/// Applies rule sets to events
#[derive(Debug, Clone, Default)]
pub struct MaskingEngine {
    registry: Arc<OperatorRegistry>,
}

impl MaskingEngine {
    /// Engine with the built-in operators
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: OperatorRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &OperatorRegistry {
        &self.registry
    }

    /// Mask one event with the rule set for its type.
    ///
    /// An event type without a rule set is only renamed.
    pub fn mask_one(&self, event: &Event, rules: &RuleBook) -> MaskOutcome {
        let set = rules.get(&event.rule_key());
        let operations = set.map(|s| s.operations.as_slice()).unwrap_or(&[]);

        let mut masked = MaskedEvent::from_raw(event, MASKED_PREFIX);
        let mut report = MaskReport::new(&event.event_type, None);
        self.apply_rules(&mut masked.masked_event.payload, operations, &mut report);

        MaskOutcome {
            masked,
            report,
            synth_amount: set.map(|s| s.synth_amount).unwrap_or(0),
        }
    }

    /// Build one synthetic replica from the raw event
    pub fn synthesize_replica(
        &self,
        raw: &Event,
        set: &RuleSet,
        replica: usize,
    ) -> (Event, MaskReport) {
        let mut synthed = MaskedEvent::from_raw(raw, SYNTHED_PREFIX);
        let mut report = MaskReport::new(&raw.event_type, Some(replica));
        self.apply_rules(&mut synthed.masked_event.payload, &set.operations, &mut report);

        (synthed.into_masked(), report)
    }

    /// Apply operations in declared order; each sees the previous ones' writes
    pub fn apply_rules(
        &self,
        payload: &mut Payload,
        operations: &[MaskOperation],
        report: &mut MaskReport,
    ) {
        for (index, operation) in operations.iter().enumerate() {
            let outcome = self.apply_rule(payload, operation);
            report.record(index, &operation.key, &operation.operator, outcome);
        }
    }

    /// Apply one operation. Never fails the event: a rule that cannot apply
    /// leaves the payload untouched and says why.
    pub fn apply_rule(&self, payload: &mut Payload, operation: &MaskOperation) -> RuleOutcome {
        let Some(spec) = self.registry.get(&operation.rule_type, &operation.operator) else {
            return RuleOutcome::Skipped(SkipReason::UnsupportedOperator);
        };

        let current = match payload.get(&operation.key) {
            None => return RuleOutcome::Skipped(SkipReason::MissingField),
            Some(Value::String(s)) => s.as_str(),
            Some(_) => return RuleOutcome::Skipped(SkipReason::NonStringField),
        };

        match (spec.apply)(current, &operation.input) {
            Ok(value) => {
                payload.insert(operation.key.clone(), Value::String(value));
                RuleOutcome::Applied
            }
            Err(e) => RuleOutcome::Failed(e),
        }
    }
}

/// The `masking` service
pub struct MaskingWorker {
    engine: MaskingEngine,
    config: SharedConfig,
    pool: SynthesisPool,
    diagnostics: Producer<MaskReport>,
    forward: Option<Producer<Event>>,
}

impl MaskingWorker {
    pub fn new(
        engine: MaskingEngine,
        config: SharedConfig,
        pool: SynthesisPool,
        diagnostics: Producer<MaskReport>,
    ) -> Self {
        Self {
            engine,
            config,
            pool,
            diagnostics,
            forward: None,
        }
    }

    /// Forward every masked event to this queue (masked-storage)
    pub fn forward_to(mut self, output: Producer<Event>) -> Self {
        self.forward = Some(output);
        self
    }

    /// Mask one event, submit its synthesis, forward the masked copy
    pub async fn process(&mut self, event: Event) -> MaskedEvent {
        let rules = self.config.rules();
        let outcome = self.engine.mask_one(&event, &rules);

        debug!(
            event_type = %event.event_type,
            applied = outcome.report.applied(),
            synth_amount = outcome.synth_amount,
            "Masked event"
        );
        publish(&self.diagnostics, outcome.report);

        if outcome.synth_amount > 0 {
            self.pool.submit(event, rules).await;
        }

        if let Some(ref forward) = self.forward {
            if let Err(e) = forward.send(outcome.masked.masked_event.clone()).await {
                warn!(
                    event_type = %outcome.masked.event_type,
                    error = %e,
                    "Failed to forward masked event"
                );
            }
        }

        outcome.masked
    }

    #[instrument(name = "masking", skip_all)]
    pub async fn run(mut self, mut input: Consumer<Event>, mut shutdown: ShutdownListener) {
        info!(
            rule_sets = self.config.rules().len(),
            forwarding = self.forward.is_some(),
            "Masking service started"
        );

        while let Some(event) = input.next(&mut shutdown).await {
            self.process(event).await;
        }

        let reports = self.pool.drain().await;
        info!(pending_jobs = reports.len(), "Masking service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Operator, Params};
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap_or_default()
    }

    fn sensor() -> Event {
        Event::new("sensor", params(json!({ "id": "4", "status": "running" })))
    }

    fn book(set: RuleSet) -> RuleBook {
        let mut book = RuleBook::new();
        book.insert("sensor_mask", set);
        book
    }

    #[test]
    fn test_no_rules_only_renames() {
        let engine = MaskingEngine::new();
        let outcome = engine.mask_one(&sensor(), &RuleBook::new());

        assert_eq!(outcome.masked.masked_event.event_type, "masked_sensor");
        assert_eq!(outcome.masked.masked_event.payload, sensor().payload);
        assert_eq!(outcome.masked.raw_event, sensor());
        assert_eq!(outcome.synth_amount, 0);
        assert!(outcome.report.results.is_empty());
    }

    #[test]
    fn test_rules_apply_in_order() {
        let set = RuleSet {
            synth_amount: 0,
            operations: vec![
                MaskOperation::string(
                    "status",
                    Operator::Replace,
                    params(json!({ "value": "first" })),
                ),
                MaskOperation::string(
                    "status",
                    Operator::Replace,
                    params(json!({ "value": "second" })),
                ),
            ],
        };

        let outcome = MaskingEngine::new().mask_one(&sensor(), &book(set));
        assert_eq!(outcome.masked.masked_event.str_field("status"), Some("second"));
        assert_eq!(outcome.report.applied(), 2);
    }

    #[test]
    fn test_skip_reasons() {
        let mut event = sensor();
        event.payload.insert("count".to_string(), json!(3));

        let set = RuleSet {
            synth_amount: 0,
            operations: vec![
                MaskOperation::string("foo", Operator::Replace, params(json!({ "value": "x" }))),
                MaskOperation::string("count", Operator::Replace, params(json!({ "value": "x" }))),
                MaskOperation::string("status", Operator::Other("HASH".into()), Params::new()),
            ],
        };

        let outcome = MaskingEngine::new().mask_one(&event, &book(set));
        let outcomes: Vec<_> = outcome.report.results.iter().map(|r| r.outcome.clone()).collect();
        assert_eq!(
            outcomes,
            vec![
                RuleOutcome::Skipped(SkipReason::MissingField),
                RuleOutcome::Skipped(SkipReason::NonStringField),
                RuleOutcome::Skipped(SkipReason::UnsupportedOperator),
            ]
        );

        assert_eq!(outcome.masked.masked_event.payload, event.payload);
    }

    #[test]
    fn test_failed_operator_keeps_value() {
        let set = RuleSet {
            synth_amount: 0,
            operations: vec![MaskOperation::string(
                "id",
                Operator::RandomInt,
                params(json!({ "lower_limit": "low", "upper_limit": "10" })),
            )],
        };

        let outcome = MaskingEngine::new().mask_one(&sensor(), &book(set));
        assert_eq!(outcome.masked.masked_event.str_field("id"), Some("4"));
        assert!(matches!(outcome.report.results[0].outcome, RuleOutcome::Failed(_)));
    }

    #[test]
    fn test_replica_starts_from_raw_payload() {
        let set = RuleSet {
            synth_amount: 1,
            operations: vec![MaskOperation::string(
                "id",
                Operator::RandomInt,
                params(json!({ "lower_limit": 100, "upper_limit": 200 })),
            )],
        };

        let (replica, report) = MaskingEngine::new().synthesize_replica(&sensor(), &set, 0);
        assert_eq!(replica.event_type, "synthed_sensor");
        assert_eq!(report.replica, Some(0));

        let id: i64 = replica.str_field("id").unwrap().parse().unwrap();
        assert!((100..200).contains(&id));
        assert_eq!(replica.str_field("status"), Some("running"));
    }
}
