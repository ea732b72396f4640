//! Configuration for clutch.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CLUTCH_RULES_DIR, CLUTCH_SERVICES)
//! 2. Config file (--config, CLUTCH_CONFIG, .clutch/config.yaml, ~/.clutch/config.yaml)
//! 3. Defaults
//!
//! The parsed [`Config`] is read once at startup. The parts that change at
//! runtime (active services, rule sets) live in [`SharedConfig`], which
//! hands out immutable snapshots and only ever replaces whole fields.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::core::queues::QueueSettings;
use crate::core::router::Service;
use crate::core::synthesis::SynthesisSettings;
use crate::domain::RuleBook;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "CLUTCH_CONFIG";

/// Environment variable overriding the rules directory
pub const RULES_DIR_ENV: &str = "CLUTCH_RULES_DIR";

/// Environment variable overriding the active services (comma-separated)
pub const SERVICES_ENV: &str = "CLUTCH_SERVICES";

/// Config file schema (matches YAML structure)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub model: ModelConfig,

    /// Active services, in start order
    #[serde(default = "default_services")]
    pub services: Vec<String>,

    #[serde(default)]
    pub rules: RulesConfig,

    #[serde(default)]
    pub queues: QueueSettings,

    #[serde(default)]
    pub synthesis: SynthesisSettings,
}

fn default_services() -> Vec<String> {
    vec![
        "storage".to_string(),
        "masking".to_string(),
        "mask_storage".to_string(),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            model: ModelConfig::default(),
            services: default_services(),
            rules: RulesConfig::default(),
            queues: QueueSettings::default(),
            synthesis: SynthesisSettings::default(),
        }
    }
}

/// Document store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// In-process store (nothing survives a restart)
    #[default]
    Memory,

    /// Qdrant over its REST API
    Qdrant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type", default)]
    pub kind: StoreKind,

    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    /// API key sent as `api-key` header
    #[serde(default)]
    pub api_key: Option<String>,

    /// Drop and recreate this collection on startup
    #[serde(default)]
    pub new_index_on_launch: Option<String>,
}

fn default_db_host() -> String {
    "localhost".to_string()
}
fn default_db_port() -> u16 {
    6333
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            host: default_db_host(),
            port: default_db_port(),
            api_key: None,
            new_index_on_launch: None,
        }
    }
}

impl DatabaseConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Language model backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    None,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(rename = "type", default)]
    pub kind: ModelKind,

    #[serde(default = "default_model_url")]
    pub url: String,

    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Defaults to `url`
    #[serde(default)]
    pub embedder_url: Option<String>,

    #[serde(default = "default_embedder_model")]
    pub embedder_model_name: String,

    /// Prompt template with `{context}` and `{question}` placeholders
    #[serde(default = "default_base_prompt")]
    pub base_prompt: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_model_timeout")]
    pub timeout_seconds: u64,
}

fn default_model_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model_name() -> String {
    "llama3.2".to_string()
}
fn default_embedder_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_base_prompt() -> String {
    "Answer the question using only this context.\n\nContext: {context}\n\nQuestion: {question}"
        .to_string()
}
fn default_model_timeout() -> u64 {
    60
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: ModelKind::default(),
            url: default_model_url(),
            model_name: default_model_name(),
            embedder_url: None,
            embedder_model_name: default_embedder_model(),
            base_prompt: default_base_prompt(),
            timeout_seconds: default_model_timeout(),
        }
    }
}

impl ModelConfig {
    pub fn embedder_url(&self) -> &str {
        self.embedder_url.as_deref().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Directory holding rule files
    #[serde(default = "default_rules_dir")]
    pub dir: PathBuf,

    /// Glob (relative to `dir`) selecting rule files
    #[serde(default = "default_rules_pattern")]
    pub pattern: String,

    /// Reload rule sets when files in `dir` change
    #[serde(default)]
    pub watch: bool,
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("schemas")
}
fn default_rules_pattern() -> String {
    "*_mask*".to_string()
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            dir: default_rules_dir(),
            pattern: default_rules_pattern(),
            watch: false,
        }
    }
}

impl Config {
    /// Load a config from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse a config from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse config YAML")
    }

    /// Load from all sources. `explicit` wins over discovery.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .or_else(find_config_file);

        let mut config = match path {
            Some(ref path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_overrides(
            std::env::var(RULES_DIR_ENV).ok(),
            std::env::var(SERVICES_ENV).ok(),
        );

        Ok((config, path))
    }

    /// Apply environment-style overrides
    pub fn apply_overrides(&mut self, rules_dir: Option<String>, services: Option<String>) {
        if let Some(dir) = rules_dir.filter(|d| !d.trim().is_empty()) {
            self.rules.dir = PathBuf::from(dir);
        }

        if let Some(list) = services {
            self.services = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    /// Parsed active services
    pub fn active_services(&self) -> Vec<Service> {
        self.services.iter().map(|s| Service::parse(s)).collect()
    }
}

/// Find config file: `.clutch/config.yaml` in the current directory or a
/// parent, then `~/.clutch/config.yaml`
fn find_config_file() -> Option<PathBuf> {
    if let Ok(mut current) = std::env::current_dir() {
        loop {
            let candidate = current.join(".clutch").join("config.yaml");
            if candidate.exists() {
                return Some(candidate);
            }
            if !current.pop() {
                break;
            }
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".clutch").join("config.yaml"))
        .filter(|p| p.exists())
}

/// Immutable view of the runtime-mutable configuration
#[derive(Debug, Clone, Default)]
pub struct RuntimeSnapshot {
    pub services: Vec<Service>,
    pub rules: Arc<RuleBook>,
}

impl RuntimeSnapshot {
    pub fn is_active(&self, service: &Service) -> bool {
        self.services.contains(service)
    }
}

/// Process-wide runtime configuration.
///
/// Readers take an `Arc` snapshot without blocking writers; writers swap in
/// a new snapshot in one step, so no reader ever sees a half-updated value.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    sender: Arc<watch::Sender<Arc<RuntimeSnapshot>>>,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(Vec::new(), RuleBook::new())
    }
}

impl SharedConfig {
    pub fn new(services: Vec<Service>, rules: RuleBook) -> Self {
        let snapshot = RuntimeSnapshot {
            services,
            rules: Arc::new(rules),
        };
        let (sender, _) = watch::channel(Arc::new(snapshot));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Shared config seeded with a file config's services and no rules
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.active_services(), RuleBook::new())
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<RuntimeSnapshot> {
        self.sender.borrow().clone()
    }

    /// Current rule book
    pub fn rules(&self) -> Arc<RuleBook> {
        self.snapshot().rules.clone()
    }

    /// Replace the whole rule book
    pub fn set_rules(&self, rules: RuleBook) {
        let rules = Arc::new(rules);
        self.sender.send_modify(|snapshot| {
            *snapshot = Arc::new(RuntimeSnapshot {
                services: snapshot.services.clone(),
                rules,
            });
        });
    }

    /// Build a new rule book from the current one and install it
    pub fn update_rules<F>(&self, update: F)
    where
        F: FnOnce(&RuleBook) -> RuleBook,
    {
        self.sender.send_modify(|snapshot| {
            let rules = Arc::new(update(&snapshot.rules));
            *snapshot = Arc::new(RuntimeSnapshot {
                services: snapshot.services.clone(),
                rules,
            });
        });
    }

    /// Replace the whole service list
    pub fn set_services(&self, services: Vec<Service>) {
        self.sender.send_modify(|snapshot| {
            *snapshot = Arc::new(RuntimeSnapshot {
                services,
                rules: snapshot.rules.clone(),
            });
        });
    }

    /// Watch for snapshot replacements
    pub fn subscribe(&self) -> watch::Receiver<Arc<RuntimeSnapshot>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RuleSet;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.database.kind, StoreKind::Memory);
        assert_eq!(config.model.kind, ModelKind::None);
        assert_eq!(config.queues.capacity, 1000);
        assert_eq!(config.rules.pattern, "*_mask*");
        assert_eq!(config.services, default_services());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
database:
  type: qdrant
  host: qdrant.local
  port: 6334
model:
  type: ollama
  model_name: llama3.2
  embedder_model_name: nomic-embed-text
services:
  - storage
  - model
  - masking
  - mask_storage
rules:
  dir: ./rules
  watch: true
queues:
  capacity: 10
  send_timeout_ms: 250
"#
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.database.kind, StoreKind::Qdrant);
        assert_eq!(config.database.base_url(), "http://qdrant.local:6334");
        assert_eq!(config.model.kind, ModelKind::Ollama);
        assert_eq!(config.model.embedder_url(), "http://localhost:11434");
        assert_eq!(config.services.len(), 4);
        assert!(config.rules.watch);
        assert_eq!(config.queues.capacity, 10);
        assert_eq!(
            config.queues.send_timeout(),
            Some(std::time::Duration::from_millis(250))
        );
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(Some("/etc/rules".to_string()), Some("storage, synth,".to_string()));

        assert_eq!(config.rules.dir, PathBuf::from("/etc/rules"));
        assert_eq!(config.services, vec!["storage", "synth"]);
        assert_eq!(
            config.active_services(),
            vec![Service::Storage, Service::Synth]
        );
    }

    #[test]
    fn test_shared_config_swaps_whole_fields() {
        let shared = SharedConfig::new(vec![Service::Masking], RuleBook::new());
        let before = shared.snapshot();

        let mut book = RuleBook::new();
        book.insert("sensor_mask", RuleSet::default());
        shared.set_rules(book);

        // Old snapshot is untouched
        assert!(before.rules.is_empty());

        let after = shared.snapshot();
        assert_eq!(after.rules.len(), 1);
        assert_eq!(after.services, vec![Service::Masking]);

        shared.set_services(vec![Service::Storage]);
        assert_eq!(shared.snapshot().services, vec![Service::Storage]);
        assert_eq!(shared.rules().len(), 1);
    }

    #[test]
    fn test_update_rules_sees_current_book() {
        let shared = SharedConfig::new(vec![Service::Masking], RuleBook::new());
        let mut book = RuleBook::new();
        book.insert("sensor_mask", RuleSet::default());
        shared.set_rules(book);

        shared.update_rules(|previous| {
            let mut next = previous.clone();
            next.insert("device_mask", RuleSet::default());
            next
        });

        let rules = shared.rules();
        assert_eq!(rules.len(), 2);
        assert!(rules.get("sensor_mask").is_some());
        assert_eq!(shared.snapshot().services, vec![Service::Masking]);
    }
}
