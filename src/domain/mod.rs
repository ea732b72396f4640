//! Domain types for the distribution fabric.
//!
//! This module contains the core data structures:
//! - Event: Typed payload bags routed between stages
//! - Rules: Masking operations and per-type rule sets

pub mod event;
pub mod rules;

// Re-export commonly used types
pub use event::{Event, MaskedEvent, Payload, CHAT_EVENT_TYPE, MASKED_PREFIX, SYNTHED_PREFIX};
pub use rules::{MaskOperation, Operator, Params, RuleBook, RuleSet, RuleType};
