//! Per-event diagnostic records for rule application.
//!
//! A rule that cannot apply never fails its event. Its outcome is recorded
//! here instead, and records with issues are surfaced on the error queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::Operator;

use super::operators::OperatorInputError;
use super::queues::{Consumer, Producer};
use super::shutdown::ShutdownListener;

/// Why a rule was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The payload has no such key
    MissingField,

    /// The field exists but is not a string
    NonStringField,

    /// No operator registered for the rule's `(type, operator)` pair
    UnsupportedOperator,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField => write!(f, "missing field"),
            Self::NonStringField => write!(f, "field is not a string"),
            Self::UnsupportedOperator => write!(f, "unsupported operator"),
        }
    }
}

/// Outcome of applying one rule to one event
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Applied,
    Skipped(SkipReason),
    /// Operator rejected its parameters; the field kept its value
    Failed(OperatorInputError),
}

impl RuleOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

impl fmt::Display for RuleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::Skipped(reason) => write!(f, "skipped: {}", reason),
            Self::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Outcome of one rule, with enough context to find it in its rule file
#[derive(Debug, Clone, PartialEq)]
pub struct RuleResult {
    /// Position of the rule in its rule set
    pub index: usize,
    pub key: String,
    pub operator: Operator,
    pub outcome: RuleOutcome,
}

/// Diagnostic record for one masking pass over one event
#[derive(Debug, Clone)]
pub struct MaskReport {
    /// Type of the raw event
    pub event_type: String,

    /// Replica number for synthesis passes, `None` for the masking pass
    pub replica: Option<usize>,

    pub results: Vec<RuleResult>,

    pub created_at: DateTime<Utc>,
}

impl MaskReport {
    pub fn new(event_type: impl Into<String>, replica: Option<usize>) -> Self {
        Self {
            event_type: event_type.into(),
            replica,
            results: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn record(&mut self, index: usize, key: &str, operator: &Operator, outcome: RuleOutcome) {
        self.results.push(RuleResult {
            index,
            key: key.to_string(),
            operator: operator.clone(),
            outcome,
        });
    }

    /// Number of rules applied
    pub fn applied(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_applied()).count()
    }

    /// Rules that were skipped or failed
    pub fn issues(&self) -> impl Iterator<Item = &RuleResult> {
        self.results.iter().filter(|r| !r.outcome.is_applied())
    }

    pub fn has_issues(&self) -> bool {
        self.issues().next().is_some()
    }

    fn log_issues(&self) {
        for issue in self.issues() {
            warn!(
                event_type = %self.event_type,
                replica = ?self.replica,
                rule = issue.index,
                key = %issue.key,
                operator = %issue.operator,
                outcome = %issue.outcome,
                "Mask rule not applied"
            );
        }
    }
}

/// Push a report with issues onto the error queue without blocking.
///
/// Reports without issues are dropped. If the queue is full or closed the
/// issues are logged here instead.
pub fn publish(errors: &Producer<MaskReport>, report: MaskReport) {
    if !report.has_issues() {
        return;
    }

    if let Err(e) = errors.try_send(report.clone()) {
        warn!(error = %e, "Diagnostics queue unavailable");
        report.log_issues();
    }
}

/// Drain the error queue, logging every issue
pub async fn run_diagnostics(mut input: Consumer<MaskReport>, mut shutdown: ShutdownListener) {
    info!("Diagnostics service started");

    let mut reports = 0usize;
    while let Some(report) = input.next(&mut shutdown).await {
        report.log_issues();
        reports += 1;
    }

    info!(reports, "Diagnostics service stopped");
}
