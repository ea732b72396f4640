//! Rule set discovery and loading.
//!
//! Rule files live in one directory and are selected by a glob pattern
//! (default `*_mask*`). Each file holds one [`RuleSet`]; its key is the file
//! name without extension, so `sensor_mask.yaml` serves events of type
//! `sensor`. Loading always produces a whole new [`RuleBook`] which is
//! installed into [`SharedConfig`] in one replacement.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::config::{RulesConfig, SharedConfig};
use crate::domain::{RuleBook, RuleSet};

use super::operators::{OperatorInputError, OperatorRegistry};

/// Debounce window for rule directory changes
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

/// A rule file (or the rule directory) that could not be used
#[derive(Debug, Error)]
pub enum RuleLoadError {
    #[error("Invalid rule file pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Failed to read rule file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse rule file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Rule {index} ('{key}') in {} is invalid: {source}", .path.display())]
    InvalidRule {
        path: PathBuf,
        index: usize,
        key: String,
        #[source]
        source: OperatorInputError,
    },

    #[error("Failed to watch rules directory: {0}")]
    Watch(#[from] notify::Error),
}

impl RuleLoadError {
    /// Rule file the error belongs to, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Read { path, .. }
            | Self::Parse { path, .. }
            | Self::InvalidRule { path, .. } => Some(path),
            Self::Pattern { .. } | Self::Watch(_) => None,
        }
    }
}

/// Result of loading a rules directory
#[derive(Debug, Default)]
pub struct RuleLoad {
    pub book: RuleBook,

    /// Files that were skipped, with the reason
    pub rejected: Vec<RuleLoadError>,
}

/// Loads rule sets from a directory
#[derive(Debug, Clone)]
pub struct RuleStore {
    dir: PathBuf,
    pattern: String,
    registry: Arc<OperatorRegistry>,
}

impl RuleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pattern: "*_mask*".to_string(),
            registry: Arc::new(OperatorRegistry::builtin()),
        }
    }

    pub fn from_config(config: &RulesConfig) -> Self {
        Self::new(&config.dir).with_pattern(&config.pattern)
    }

    /// Glob (relative to the directory) selecting rule files
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    /// Operators used to validate rule parameters
    pub fn with_registry(mut self, registry: Arc<OperatorRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Matching rule files, in sorted order
    pub fn files(&self) -> Result<Vec<PathBuf>, RuleLoadError> {
        let dir = glob::Pattern::escape(&self.dir.to_string_lossy());
        let pattern = format!("{}/{}", dir, self.pattern);

        let entries = glob::glob(&pattern).map_err(|source| RuleLoadError::Pattern {
            pattern: self.pattern.clone(),
            source,
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(error = %e, "Unreadable rules directory entry");
                    None
                }
            })
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        Ok(files)
    }

    /// Load and validate one rule file. Returns its key and rule set.
    pub fn load_file(&self, path: &Path) -> Result<(String, RuleSet), RuleLoadError> {
        let content = std::fs::read_to_string(path).map_err(|source| RuleLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let set = RuleSet::from_yaml(&content).map_err(|source| RuleLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        for (index, operation) in set.operations.iter().enumerate() {
            if !self.registry.supports(operation) {
                warn!(
                    file = %path.display(),
                    rule = index,
                    key = %operation.key,
                    rule_type = %operation.rule_type,
                    operator = %operation.operator,
                    "Unsupported operator, rule will be skipped"
                );
                continue;
            }

            self.registry
                .validate(operation)
                .map_err(|source| RuleLoadError::InvalidRule {
                    path: path.to_path_buf(),
                    index,
                    key: operation.key.clone(),
                    source,
                })?;
        }

        Ok((rule_key(path), set))
    }

    /// Load every matching file. Later files win on key collisions; files
    /// that fail to load are logged and skipped.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub fn load_all(&self) -> Result<RuleLoad, RuleLoadError> {
        let files = self.files()?;
        if files.is_empty() {
            warn!(pattern = %self.pattern, "No rule files found");
        }

        let mut load = RuleLoad::default();
        for path in files {
            match self.load_file(&path) {
                Ok((key, set)) => {
                    debug!(
                        rule_key = %key,
                        operations = set.operations.len(),
                        synth_amount = set.synth_amount,
                        "Loaded rule set"
                    );
                    if load.book.insert(key.clone(), set).is_some() {
                        warn!(
                            rule_key = %key,
                            file = %path.display(),
                            "Rule set replaced by later file"
                        );
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Skipping rule file");
                    load.rejected.push(e);
                }
            }
        }

        info!(
            rule_sets = load.book.len(),
            rejected = load.rejected.len(),
            "Rules loaded"
        );
        Ok(load)
    }

    /// Load the directory and replace the shared rule book with the result.
    ///
    /// A file that fails to load keeps the rule set it had before.
    pub fn install(&self, shared: &SharedConfig) -> Result<RuleLoad, RuleLoadError> {
        let load = self.load_all()?;
        shared.update_rules(|previous| retain_rejected(&load, previous));
        Ok(load)
    }

    /// Reinstall rules whenever a matching file in the directory changes
    pub fn watch(self, shared: SharedConfig) -> Result<RuleWatchHandle, RuleLoadError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DebounceEventResult>();
        let mut debouncer = new_debouncer(RELOAD_DEBOUNCE, move |result: DebounceEventResult| {
            let _ = tx.send(result);
        })?;
        debouncer
            .watcher()
            .watch(&self.dir, RecursiveMode::NonRecursive)?;

        let matcher = glob::Pattern::new(&self.pattern).map_err(|source| RuleLoadError::Pattern {
            pattern: self.pattern.clone(),
            source,
        })?;

        info!(dir = %self.dir.display(), "Watching rules directory");

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    received = rx.recv() => match received {
                        Some(Ok(events)) => {
                            let relevant = events.iter().any(|event| {
                                event
                                    .path
                                    .file_name()
                                    .map(|name| matcher.matches(&name.to_string_lossy()))
                                    .unwrap_or(false)
                            });
                            if !relevant {
                                continue;
                            }

                            if let Err(e) = self.install(&shared) {
                                warn!(error = %e, "Rule reload failed, keeping previous rules");
                            }
                        }
                        Some(Err(e)) => warn!(error = ?e, "Rules watcher error"),
                        None => break,
                    }
                }
            }
            debug!("Rules watcher stopped");
        });

        Ok(RuleWatchHandle {
            _debouncer: debouncer,
            stop_tx,
            task,
        })
    }
}

/// Loaded book plus the previous rule sets of files that were rejected
fn retain_rejected(load: &RuleLoad, previous: &RuleBook) -> RuleBook {
    let mut book = load.book.clone();
    for path in load.rejected.iter().filter_map(RuleLoadError::path) {
        let key = rule_key(path);
        if book.get(&key).is_some() {
            continue;
        }
        if let Some(set) = previous.get(&key) {
            warn!(
                rule_key = %key,
                file = %path.display(),
                "Keeping previous rules for rejected file"
            );
            book.insert(key, set.clone());
        }
    }
    book
}

/// Rule key for a file: its name without extension
pub fn rule_key(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Running rules watcher; dropping it stops file notifications
pub struct RuleWatchHandle {
    _debouncer: Debouncer<RecommendedWatcher>,
    stop_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl RuleWatchHandle {
    /// Stop watching and wait for the reload task to finish
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "Rules watcher task failed");
        }
    }
}
