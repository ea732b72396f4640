//! clutch - Event distribution with rule-driven masking and synthesis
//!
//! Events enter through an ingress contract, are routed to every active
//! processing stage, and may be persisted raw, masked, or multiplied into
//! synthetic replicas.
//!
//! # Architecture
//!
//! ```text
//! ingress → relay → router ─┬─► storage ────────► DocumentStore
//!                           ├─► masking ─┬──────► masked storage ─► DocumentStore
//!                           │            └─ synthesis pool ─┘
//!                           ├─► synth ── synthesis pool ────┘
//!                           └─► chat ──► LanguageModel
//! ```
//!
//! # Modules
//!
//! - `adapters`: Document store and language model backends
//! - `core`: Queues, routing, masking, synthesis, rule loading
//! - `domain`: Events and rule definitions
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the pipeline over JSON-lines events
//! clutch run --events events.jsonl
//!
//! # Mask one event against the rules directory
//! clutch mask --event '{"type":"sensor","payload":{"status":"running"}}' --synth
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::config::{Config, SharedConfig};
pub use crate::core::{MaskingEngine, Orchestrator, PipelineHandle, RuleStore, Service};
pub use crate::domain::{Event, MaskedEvent, RuleBook, RuleSet};
