//! Core distribution and masking logic.
//!
//! This module contains:
//! - Queues: bounded queues connecting pipeline stages
//! - Router: fan-out of events to active stages
//! - Masking / Synthesis: rule-driven event transformation
//! - RuleStore: rule set loading and hot reload
//! - Orchestrator: pipeline assembly and lifecycle

pub mod diagnostics;
pub mod flatten;
pub mod masking;
pub mod operators;
pub mod orchestrator;
pub mod queues;
pub mod router;
pub mod rule_store;
pub mod shutdown;
pub mod synthesis;
pub mod workers;

// Re-export commonly used types
pub use diagnostics::{MaskReport, RuleOutcome, RuleResult, SkipReason};
pub use flatten::{embedding_text, flatten};
pub use masking::{MaskOutcome, MaskingEngine, MaskingWorker};
pub use operators::{OperatorInputError, OperatorRegistry, OperatorSpec};
pub use orchestrator::{Orchestrator, PipelineHandle};
pub use queues::{Consumer, Producer, QueueError, QueueFabric, QueueRole, QueueSettings};
pub use router::{RouteResult, Router, Service};
pub use rule_store::{RuleLoad, RuleLoadError, RuleStore, RuleWatchHandle};
pub use shutdown::{ShutdownListener, ShutdownSignal};
pub use synthesis::{
    SynthesisEngine, SynthesisPool, SynthesisReport, SynthesisSettings, SynthesisWorker,
};
pub use workers::{ChatRequest, ChatWorker, Ingress, IngressError};
