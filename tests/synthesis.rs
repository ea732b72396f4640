//! Synthesis Integration Tests
//!
//! Replica cardinality, independence from each other, and the bounded pool.

use std::collections::HashSet;
use std::sync::Arc;

use clutch::core::operators::random_int;
use clutch::core::queues::bounded;
use clutch::core::{
    MaskingEngine, OperatorInputError, QueueError, QueueSettings, SynthesisEngine, SynthesisPool,
    SynthesisSettings,
};
use clutch::domain::{Event, MaskOperation, Operator, Params, Payload, RuleBook, RuleSet};
use serde_json::{json, Value};

fn object(value: Value) -> Payload {
    value.as_object().cloned().unwrap_or_default()
}

fn sensor() -> Event {
    Event::new(
        "sensor",
        object(json!({ "id": "4", "status": "running", "location": { "field": "north" } })),
    )
}

fn randomize_id(synth_amount: usize) -> RuleBook {
    let mut book = RuleBook::new();
    book.insert(
        "sensor_mask",
        RuleSet {
            synth_amount,
            operations: vec![MaskOperation::string(
                "id",
                Operator::RandomInt,
                object(json!({ "lower_limit": 0, "upper_limit": 1_000_000 })),
            )],
        },
    );
    book
}

#[tokio::test]
async fn test_replica_count_and_shape() {
    let (output, mut replicas) = bounded("masked_storage", &QueueSettings::default());
    let engine = SynthesisEngine::new(MaskingEngine::new(), output);

    let report = engine.synthesize(&sensor(), &randomize_id(5)).await;
    assert!(report.is_complete());
    assert_eq!(report.produced, 5);

    let mut ids = HashSet::new();
    for _ in 0..5 {
        let replica = replicas.recv().await.unwrap();
        assert_eq!(replica.event_type, "synthed_sensor");
        assert_eq!(replica.str_field("status"), Some("running"));
        assert_eq!(replica.payload["location"], json!({ "field": "north" }));

        let id: i64 = replica.str_field("id").unwrap().parse().unwrap();
        assert!((0..1_000_000).contains(&id));
        ids.insert(id);
    }
    assert!(replicas.is_empty());

    // Fresh randomness per replica
    assert!(ids.len() > 1);
}

#[tokio::test]
async fn test_no_rule_set_means_no_replicas() {
    let (output, replicas) = bounded::<Event>("masked_storage", &QueueSettings::default());
    let engine = SynthesisEngine::new(MaskingEngine::new(), output);

    let report = engine.synthesize(&sensor(), &RuleBook::new()).await;
    assert_eq!(report.requested, 0);
    assert!(report.is_complete());
    assert!(replicas.is_empty());
}

#[tokio::test]
async fn test_closed_output_stops_job() {
    let (output, replicas) = bounded::<Event>("masked_storage", &QueueSettings::default());
    drop(replicas);
    let engine = SynthesisEngine::new(MaskingEngine::new(), output);

    let report = engine.synthesize(&sensor(), &randomize_id(3)).await;
    assert_eq!(report.produced, 0);
    assert_eq!(
        report.error,
        Some(QueueError::Closed("masked_storage".to_string()))
    );
}

#[tokio::test]
async fn test_pool_drains_every_job() {
    let (output, mut replicas) = bounded("masked_storage", &QueueSettings::default());
    let engine = SynthesisEngine::new(MaskingEngine::new(), output);
    let mut pool = SynthesisPool::new(engine, &SynthesisSettings { max_in_flight: 2 });

    let rules = Arc::new(randomize_id(2));
    for _ in 0..6 {
        pool.submit(sensor(), rules.clone()).await;
    }

    let reports = pool.drain().await;
    assert_eq!(pool.in_flight(), 0);
    assert!(reports.iter().all(|r| r.is_complete()));
    assert_eq!(replicas.len(), 12);

    drop(pool);
    let mut received = 0;
    while replicas.recv().await.is_some() {
        received += 1;
    }
    assert_eq!(received, 12);
}

#[test]
fn test_random_int_range() {
    let params = object(json!({ "lower_limit": -5, "upper_limit": "5" }));
    for _ in 0..500 {
        let value: i64 = random_int("x", &params).unwrap().parse().unwrap();
        assert!((-5..5).contains(&value));
    }

    let equal = object(json!({ "lower_limit": 7, "upper_limit": 7 }));
    assert_eq!(random_int("x", &equal).unwrap(), "7");
}

#[test]
fn test_random_int_rejects_bad_limits() {
    let inverted = object(json!({ "lower_limit": 9, "upper_limit": 3 }));
    assert_eq!(
        random_int("x", &inverted),
        Err(OperatorInputError::InvertedRange { lower: 9, upper: 3 })
    );

    let missing: Params = object(json!({ "lower_limit": 1 }));
    assert!(matches!(
        random_int("x", &missing),
        Err(OperatorInputError::MissingParam { .. })
    ));

    let garbage = object(json!({ "lower_limit": "1.5", "upper_limit": 3 }));
    assert!(matches!(
        random_int("x", &garbage),
        Err(OperatorInputError::InvalidInteger { .. })
    ));
}
