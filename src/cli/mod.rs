//! Command-line interface for clutch.
//!
//! Provides commands for running the pipeline over a stream of events
//! and for inspecting how rules mask a single event.

use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::adapters::{build_model, build_store};
use crate::config::{Config, SharedConfig};
use crate::core::{
    Ingress, IngressError, MaskingEngine, Orchestrator, RuleLoad, RuleStore, RuleWatchHandle,
    ShutdownListener,
};
use crate::domain::Event;

/// clutch - Event distribution with rule-driven masking and synthesis
#[derive(Parser, Debug)]
#[command(name = "clutch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to CLUTCH_CONFIG, then .clutch/config.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline over JSON-lines events
    Run {
        /// Events file, one JSON event per line (reads stdin if not provided)
        #[arg(short, long)]
        events: Option<PathBuf>,
    },

    /// Mask a single event and print the result
    Mask {
        /// Event as JSON (reads stdin if not provided)
        #[arg(short, long)]
        event: Option<String>,

        /// Also print the synthetic replicas
        #[arg(short, long)]
        synth: bool,
    },

    /// List loaded rule sets
    Rules,

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let (config, source) = Config::load(self.config.as_deref())?;

        match self.command {
            Commands::Run { events } => run_pipeline(config, events).await,
            Commands::Mask { event, synth } => mask_event(&config, event, synth),
            Commands::Rules => list_rules(&config),
            Commands::Config => show_config(&config, source.as_deref()),
        }
    }
}

/// Start the pipeline, feed it events, and close it once input ends
async fn run_pipeline(config: Config, events: Option<PathBuf>) -> Result<()> {
    let model = build_model(&config.model).context("Failed to initialize model")?;
    let store = build_store(&config.database, model.clone()).context("Failed to initialize store")?;

    if let Some(ref collection) = config.database.new_index_on_launch {
        store
            .delete_collection(collection)
            .await
            .with_context(|| format!("Failed to reset collection '{}'", collection))?;
        info!(collection = %collection, "Reset collection on launch");
    }

    let shared = SharedConfig::from_config(&config);
    let rules = RuleStore::from_config(&config.rules);
    rules.install(&shared).context("Failed to load rules")?;

    let watcher = if config.rules.watch {
        watch_rules(rules, &shared)
    } else {
        None
    };

    let handle = Orchestrator::from_config(&config, store, model).start(shared);

    let signal = handle.shutdown_signal();
    tokio::spawn(async move {
        if let Err(e) = signal.trigger_on_signal().await {
            warn!(error = %e, "Failed to listen for shutdown signals");
        }
    });

    let ingress = handle.ingress();
    let listener = handle.shutdown_signal().subscribe();
    let delivered = match events {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open events file: {}", path.display()))?;
            feed_lines(BufReader::new(file), ingress, listener).await?
        }
        None => feed_lines(BufReader::new(tokio::io::stdin()), ingress, listener).await?,
    };

    info!(delivered, "Input finished, draining pipeline");
    handle.close().await;

    if let Some(watcher) = watcher {
        watcher.stop().await;
    }
    Ok(())
}

/// Start hot reload, or run without it when the directory cannot be watched
fn watch_rules(rules: RuleStore, shared: &SharedConfig) -> Option<RuleWatchHandle> {
    let dir = rules.dir().to_path_buf();
    match rules.watch(shared.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Rules hot reload disabled");
            None
        }
    }
}

/// Deliver one JSON event per line until input ends or shutdown.
///
/// Lines that do not parse, and events with an empty type, are logged and
/// skipped. Returns the number of events delivered.
pub async fn feed_lines<R>(
    reader: R,
    ingress: Ingress,
    mut shutdown: ShutdownListener,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut delivered = 0usize;
    let mut line_number = 0usize;

    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read events")?,
        };
        let Some(line) = line else {
            break;
        };
        line_number += 1;

        if line.trim().is_empty() {
            continue;
        }

        let event = match Event::from_json(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_number, error = %e, "Skipping malformed event");
                continue;
            }
        };

        match ingress.deliver(event).await {
            Ok(()) => delivered += 1,
            Err(IngressError::EmptyType) => {
                warn!(line = line_number, "Skipping event with empty type");
            }
            Err(e) => return Err(e).context("Pipeline stopped accepting events"),
        }
    }

    Ok(delivered)
}

fn load_rules(config: &Config) -> Result<RuleLoad> {
    RuleStore::from_config(&config.rules)
        .load_all()
        .with_context(|| format!("Failed to load rules from {}", config.rules.dir.display()))
}

/// Mask one event against the rules directory
fn mask_event(config: &Config, event: Option<String>, synth: bool) -> Result<()> {
    let json = match event {
        Some(json) => json,
        None if !io::stdin().is_terminal() => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read from stdin")?;
            buffer
        }
        None => bail!("No event provided. Use --event <json> or pipe to stdin"),
    };

    let event = Event::from_json(json.trim()).context("Failed to parse event")?;
    if event.event_type.trim().is_empty() {
        bail!("Event has an empty type");
    }

    let load = load_rules(config)?;
    let engine = MaskingEngine::new();
    let outcome = engine.mask_one(&event, &load.book);

    println!("{}", serde_json::to_string_pretty(&outcome.masked.masked_event)?);
    for issue in outcome.report.issues() {
        eprintln!("  rule {} ({} {}): {}", issue.index, issue.operator, issue.key, issue.outcome);
    }

    if synth {
        if let Some(set) = load.book.get(&event.rule_key()) {
            for replica in 0..set.synth_amount {
                let (synthed, _) = engine.synthesize_replica(&event, set, replica);
                println!("{}", serde_json::to_string_pretty(&synthed)?);
            }
        }
    }

    Ok(())
}

/// List every loaded rule set and every rejected file
fn list_rules(config: &Config) -> Result<()> {
    let load = load_rules(config)?;

    println!("Rules directory: {}", config.rules.dir.display());
    println!();
    if load.book.is_empty() {
        println!("No rule sets loaded.");
    }

    for (key, set) in load.book.sorted() {
        println!("{} (synthetic_count: {})", key, set.synth_amount);
        for op in &set.operations {
            let input = serde_json::Value::Object(op.input.clone());
            println!(
                "  {:<20} {:<8} {:<12} {}",
                op.key,
                op.rule_type.to_string(),
                op.operator.to_string(),
                input
            );
        }
    }

    if !load.rejected.is_empty() {
        println!();
        println!("Rejected files:");
        for error in &load.rejected {
            println!("  {}", error);
        }
    }

    Ok(())
}

/// Print the resolved configuration
fn show_config(config: &Config, source: Option<&Path>) -> Result<()> {
    println!(
        "Config file: {}",
        source
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    print!("{}", serde_yaml::to_string(config).context("Failed to render config")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_rules_dir_runs_without_watcher() {
        let dir = TempDir::new().unwrap();
        let shared = SharedConfig::default();
        let rules = RuleStore::new(dir.path().join("missing"));

        let load = rules.install(&shared).unwrap();
        assert!(load.book.is_empty());
        assert!(watch_rules(rules, &shared).is_none());
    }

    #[tokio::test]
    async fn test_existing_rules_dir_is_watched() {
        let dir = TempDir::new().unwrap();
        let shared = SharedConfig::default();

        let watcher = watch_rules(RuleStore::new(dir.path()), &shared);
        assert!(watcher.is_some());
        if let Some(watcher) = watcher {
            watcher.stop().await;
        }
    }

    #[test]
    fn test_config_flag_is_optional() {
        let cli = Cli::try_parse_from(["clutch", "rules"]).unwrap();
        assert!(cli.config.is_none());

        let cli = Cli::try_parse_from(["clutch", "config", "-c", "custom.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("custom.yaml")));
    }
}
