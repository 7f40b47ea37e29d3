//! Operation reports and the shared report sink.
//!
//! Exactly one [`Report`] is recorded per transaction. The sink is shared by
//! all host workers and internally synchronized; within a host, records
//! arrive in operation start order, across hosts they interleave freely.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::transaction::{Outcome, StateMap, Transaction};

/// The record of one finished operation.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub host: String,
    pub task: String,
    pub title: String,
    pub name: String,
    pub initial_state: StateMap,
    pub final_state: StateMap,
    pub outcome: Outcome,
    pub simulated: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl Report {
    /// Build the report for a terminated transaction.
    #[must_use]
    pub fn for_transaction(host: &str, task: &str, txn: &Transaction) -> Self {
        debug_assert!(txn.is_terminal(), "reporting a pending transaction");
        Self {
            host: host.to_owned(),
            task: task.to_owned(),
            title: txn.title.clone(),
            name: txn.name.clone(),
            initial_state: txn.initial_state.clone(),
            final_state: txn.final_state.clone(),
            outcome: txn.outcome(),
            simulated: txn.simulated,
            error: txn.error.clone(),
            started_at: txn.started_at,
            elapsed_ms: txn.elapsed_ms(),
        }
    }
}

/// Synchronized sink collecting reports from all host workers.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    records: Arc<Mutex<Vec<Report>>>,
}

impl Reporter {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Log the report for the operator and retain it for the summary.
    pub fn record(&self, report: Report, diff: &str) {
        let label = match (report.outcome, report.simulated) {
            (Outcome::Changed, true) => "changed (pretend)",
            (Outcome::Changed, false) => "changed",
            (Outcome::Unchanged, _) => "unchanged",
            (Outcome::Failed, _) => "failed",
            (Outcome::Pending, _) => "pending",
        };
        match report.outcome {
            Outcome::Failed => warn!(
                host = %report.host,
                task = %report.task,
                elapsed_ms = report.elapsed_ms,
                error = report.error.as_deref().unwrap_or("unknown"),
                "[{label}] {} {}",
                report.title,
                report.name,
            ),
            _ => info!(
                host = %report.host,
                task = %report.task,
                elapsed_ms = report.elapsed_ms,
                diff = %diff,
                "[{label}] {} {}",
                report.title,
                report.name,
            ),
        }
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(report);
    }

    /// Snapshot of everything recorded so far.
    #[must_use]
    pub fn reports(&self) -> Vec<Report> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Count reports for one host with the given outcome.
    #[must_use]
    pub fn count(&self, host: &str, outcome: Outcome) -> usize {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|r| r.host == host && r.outcome == outcome)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn finished(host: &str, outcome: Outcome) -> Report {
        let mut txn = Transaction::begin("package", "zsh");
        txn.initial_state([("installed", json!(false))]);
        match outcome {
            Outcome::Changed => {
                txn.final_state([("installed", json!(true))]);
                txn.changed();
            }
            Outcome::Failed => txn.failed("boom"),
            _ => txn.unchanged(),
        }
        Report::for_transaction(host, "zsh", &txn)
    }

    #[test]
    fn reports_accumulate_per_host() {
        let reporter = Reporter::new();
        reporter.record(finished("a", Outcome::Changed), "");
        reporter.record(finished("a", Outcome::Failed), "");
        reporter.record(finished("b", Outcome::Unchanged), "");

        assert_eq!(reporter.reports().len(), 3);
        assert_eq!(reporter.count("a", Outcome::Changed), 1);
        assert_eq!(reporter.count("a", Outcome::Failed), 1);
        assert_eq!(reporter.count("b", Outcome::Failed), 0);
    }
}
