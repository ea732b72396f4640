//! Rule Store Integration Tests
//!
//! Loading rule directories into shared configuration, and hot reload.

use std::time::Duration;

use clutch::config::{Config, RulesConfig};
use clutch::core::{MaskingEngine, RuleLoadError, RuleStore};
use clutch::domain::{Event, Operator};
use clutch::SharedConfig;
use serde_json::json;
use tempfile::TempDir;

const SENSOR_RULES: &str = r#"
synthetic_count: 3
masks:
  - key: status
    type: string
    operator: REPLACE
    input:
      value: REDACTED
  - key: id
    type: string
    operator: RANDOM_INT
    input:
      lower_limit: "1"
      upper_limit: 100
"#;

fn write(dir: &TempDir, name: &str, content: &str) {
    std::fs::write(dir.path().join(name), content).unwrap();
}

#[test]
fn test_install_from_config() {
    let dir = TempDir::new().unwrap();
    write(&dir, "sensor_mask.yaml", SENSOR_RULES);
    write(&dir, "broken_mask.yaml", "synthetic_count: [1, 2");

    let config = Config {
        rules: RulesConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        },
        ..Default::default()
    };

    let shared = SharedConfig::from_config(&config);
    let load = RuleStore::from_config(&config.rules).install(&shared).unwrap();
    assert_eq!(load.rejected.len(), 1);
    assert!(matches!(load.rejected[0], RuleLoadError::Parse { .. }));

    let rules = shared.rules();
    let set = rules.get("sensor_mask").unwrap();
    assert_eq!(set.synth_amount, 3);
    assert_eq!(set.operations[1].operator, Operator::RandomInt);
    assert!(rules.get("broken_mask").is_none());
}

#[test]
fn test_rejected_edit_keeps_previous_rules() {
    let dir = TempDir::new().unwrap();
    write(&dir, "sensor_mask.yaml", SENSOR_RULES);
    write(&dir, "device_mask.yaml", SENSOR_RULES);

    let shared = SharedConfig::default();
    let store = RuleStore::new(dir.path());
    store.install(&shared).unwrap();

    write(
        &dir,
        "sensor_mask.yaml",
        &SENSOR_RULES.replace("upper_limit: 100", "upper_limit: ten"),
    );
    std::fs::remove_file(dir.path().join("device_mask.yaml")).unwrap();
    let load = store.install(&shared).unwrap();
    assert!(matches!(load.rejected[0], RuleLoadError::InvalidRule { .. }));

    let rules = shared.rules();
    assert_eq!(rules.get("sensor_mask").unwrap().synth_amount, 3);
    assert!(rules.get("device_mask").is_none());

    let payload = json!({ "id": "4", "status": "secret" });
    let event = Event::new("sensor", payload.as_object().cloned().unwrap());
    let outcome = MaskingEngine::new().mask_one(&event, &rules);
    assert_eq!(outcome.masked.masked_event.str_field("status"), Some("REDACTED"));
}

#[test]
fn test_custom_pattern() {
    let dir = TempDir::new().unwrap();
    write(&dir, "sensor_mask.yaml", SENSOR_RULES);
    write(&dir, "sensor.rules.yaml", SENSOR_RULES);

    let load = RuleStore::new(dir.path())
        .with_pattern("*.rules.yaml")
        .load_all()
        .unwrap();
    assert_eq!(load.book.len(), 1);
    assert!(load.book.get("sensor.rules").is_some());
}

#[test]
fn test_invalid_pattern_is_an_error() {
    let dir = TempDir::new().unwrap();
    let result = RuleStore::new(dir.path()).with_pattern("[").load_all();
    assert!(matches!(result, Err(RuleLoadError::Pattern { .. })));
}

#[tokio::test]
async fn test_watch_reloads_on_change() {
    let dir = TempDir::new().unwrap();
    let shared = SharedConfig::default();

    let store = RuleStore::new(dir.path());
    store.install(&shared).unwrap();
    assert!(shared.rules().is_empty());

    let handle = store.watch(shared.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    write(&dir, "sensor_mask.yaml", SENSOR_RULES);

    let mut updates = shared.subscribe();
    let reloaded = tokio::time::timeout(Duration::from_secs(10), async {
        while shared.rules().get("sensor_mask").is_none() {
            if updates.changed().await.is_err() {
                break;
            }
        }
    })
    .await;

    handle.stop().await;
    assert!(reloaded.is_ok());
    assert_eq!(shared.rules().get("sensor_mask").unwrap().synth_amount, 3);
}
