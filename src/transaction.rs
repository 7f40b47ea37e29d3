//! The lifecycle record of one idempotent operation.
//!
//! Every operation moves through the same state machine: probe the current
//! state, record it, decide whether the desired state differs, then either
//! return unchanged, simulate the change (dry-run), or act. A transaction
//! must end in exactly one terminal outcome; the engine in
//! [`crate::context::Context::transaction`] synthesizes `failed` for
//! operations that forget.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Probed and desired state are flat maps of scalar values.
pub type StateMap = BTreeMap<String, serde_json::Value>;

/// Terminal (and initial) states of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Not yet decided; never reported.
    Pending,
    /// Current state already matched the desired state.
    Unchanged,
    /// The target was mutated (or would have been, under dry-run).
    Changed,
    /// The operation could not reach the desired state.
    Failed,
}

/// One pending idempotent operation.
#[derive(Debug)]
pub struct Transaction {
    pub title: String,
    pub name: String,
    pub initial_state: StateMap,
    pub final_state: StateMap,
    outcome: Outcome,
    pub error: Option<String>,
    /// Set when the change was only simulated under dry-run.
    pub simulated: bool,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl Transaction {
    #[must_use]
    pub fn begin(title: &str, name: &str) -> Self {
        Self {
            title: title.to_owned(),
            name: name.to_owned(),
            initial_state: StateMap::new(),
            final_state: StateMap::new(),
            outcome: Outcome::Pending,
            error: None,
            simulated: false,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Record the probed state. Must happen before any mutation.
    pub fn initial_state<K, I>(&mut self, entries: I)
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, serde_json::Value)>,
    {
        debug_assert_eq!(self.outcome, Outcome::Pending, "state set after outcome");
        self.initial_state
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v)));
    }

    /// Record the desired state. Must happen before acting.
    pub fn final_state<K, I>(&mut self, entries: I)
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, serde_json::Value)>,
    {
        debug_assert_eq!(self.outcome, Outcome::Pending, "state set after outcome");
        self.final_state
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v)));
    }

    /// Whether the recorded states agree, i.e. there is nothing to do.
    #[must_use]
    pub fn states_match(&self) -> bool { self.initial_state == self.final_state }

    pub fn unchanged(&mut self) { self.set_outcome(Outcome::Unchanged); }

    pub fn changed(&mut self) { self.set_outcome(Outcome::Changed); }

    /// Terminal outcome for a change that dry-run only simulated.
    pub fn pretend(&mut self) {
        self.simulated = true;
        self.set_outcome(Outcome::Changed);
    }

    pub fn failed(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.set_outcome(Outcome::Failed);
    }

    fn set_outcome(&mut self, outcome: Outcome) {
        debug_assert_eq!(self.outcome, Outcome::Pending, "outcome set twice");
        self.outcome = outcome;
    }

    #[must_use]
    pub const fn outcome(&self) -> Outcome { self.outcome }

    #[must_use]
    pub const fn is_terminal(&self) -> bool { !matches!(self.outcome, Outcome::Pending) }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Human-readable `key: old => new` lines for the recorded change.
    #[must_use]
    pub fn diff(&self) -> String {
        let mut lines = Vec::new();
        for (key, desired) in &self.final_state {
            let current = self.initial_state.get(key);
            if current != Some(desired) {
                let current = current.map_or_else(|| "(absent)".to_owned(), ToString::to_string);
                lines.push(format!("{key}: {current} => {desired}"));
            }
        }
        lines.join(", ")
    }
}
