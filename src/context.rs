//! Per-host execution environment.
//!
//! A [`Context`] is created when a host's connector opens and destroyed when
//! it closes. It owns the connector and a stack of defaults frames; every
//! operation reads its effective settings from the top of that stack, with
//! unset keys inherited from the frames below. The context also runs the
//! transaction engine: [`Context::begin_transaction`] and
//! [`Context::finish_transaction`] bracket one operation, make sure exactly
//! one terminal outcome is recorded, and emit the report.

use tracing::warn;

use crate::config::Runtime;
use crate::connector::{Connector, RunOptions};
use crate::inventory::{Host, VarMap};
use crate::ops::OpError;
use crate::report::{Report, Reporter};
use crate::transaction::{Outcome, Transaction};

/// One frame of scoped execution defaults.
///
/// Modes and umask are octal strings, exactly as they travel on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Defaults {
    /// User remote commands run as.
    pub user: Option<String>,
    /// Group remote commands run as.
    pub group: Option<String>,
    /// Umask for remote commands.
    pub umask: Option<String>,
    /// Mode for directories created by operations.
    pub dir_mode: Option<String>,
    /// Mode for files written by operations.
    pub file_mode: Option<String>,
    /// Owner applied to files and directories.
    pub owner: Option<String>,
    /// Working directory for remote commands.
    pub cwd: Option<String>,
    /// Whether non-zero exit statuses raise.
    pub check: Option<bool>,
    /// Per-scope verbosity override.
    pub verbosity: Option<u8>,
}

impl Defaults {
    /// Overlay `other` on top of `self`: keys set in `other` win.
    fn overlay(&mut self, other: &Self) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field.clone();
                }
            };
        }
        take!(user);
        take!(group);
        take!(umask);
        take!(dir_mode);
        take!(file_mode);
        take!(owner);
        take!(cwd);
        take!(check);
        take!(verbosity);
    }
}

/// Token returned by [`Context::push_defaults`]; hand it back to
/// [`Context::pop_defaults`] to restore the previous frame.
#[must_use = "a pushed defaults frame must be popped"]
#[derive(Debug)]
pub struct DefaultsGuard {
    depth: usize,
}

/// The per-host mutable execution environment.
pub struct Context {
    pub host: Host,
    /// Effective host variables (globals, groups, host).
    pub vars: VarMap,
    pub connector: Box<dyn Connector>,
    stack: Vec<Defaults>,
    pub dry_run: bool,
    pub verbosity: u8,
    pub reporter: Reporter,
    /// Id of the task currently executing, for reports.
    pub current_task: String,
    /// Abort the host on the first failed transaction.
    pub abort_on_failure: bool,
    active_transaction: Option<String>,
}

impl Context {
    #[must_use]
    pub fn new(
        host: Host,
        vars: VarMap,
        connector: Box<dyn Connector>,
        runtime: &Runtime,
        reporter: Reporter,
    ) -> Self {
        Self {
            host,
            vars,
            connector,
            stack: vec![Defaults::default()],
            dry_run: runtime.dry_run,
            verbosity: runtime.verbosity,
            reporter,
            current_task: String::new(),
            abort_on_failure: false,
            active_transaction: None,
        }
    }

    /// The merged defaults currently in effect.
    #[must_use]
    pub fn defaults(&self) -> Defaults {
        let mut merged = Defaults::default();
        for frame in &self.stack {
            merged.overlay(frame);
        }
        merged
    }

    /// Push a defaults frame; unset keys inherit from the frames below.
    pub fn push_defaults(&mut self, frame: Defaults) -> DefaultsGuard {
        self.stack.push(frame);
        DefaultsGuard {
            depth: self.stack.len(),
        }
    }

    /// Pop the frame belonging to `guard`, restoring the previous scope.
    pub fn pop_defaults(&mut self, guard: DefaultsGuard) {
        debug_assert_eq!(self.stack.len(), guard.depth, "unbalanced defaults pop");
        if self.stack.len() > 1 {
            self.stack.pop();
        }
    }

    /// Run options seeded from the effective defaults.
    #[must_use]
    pub fn run_options(&self) -> RunOptions {
        let defaults = self.defaults();
        RunOptions {
            stdin: None,
            capture_output: true,
            check: defaults.check.unwrap_or(true),
            user: defaults.user,
            group: defaults.group,
            umask: defaults.umask,
            cwd: defaults.cwd,
        }
    }

    /// Effective verbosity, honouring a scoped override.
    #[must_use]
    pub fn effective_verbosity(&self) -> u8 {
        self.defaults().verbosity.unwrap_or(self.verbosity)
    }

    /// Open the transaction for one operation.
    ///
    /// Operations pair this with [`Context::finish_transaction`]: probe and
    /// mutate in between, then hand the transaction back together with the
    /// body's result. Transactions do not nest.
    pub fn begin_transaction(&mut self, title: &str, name: &str) -> Transaction {
        debug_assert!(
            self.active_transaction.is_none(),
            "transactions do not nest"
        );
        self.active_transaction = Some(format!("{title} {name}"));
        Transaction::begin(title, name)
    }

    /// Terminate a transaction and record its report.
    ///
    /// Guarantees exactly one terminal outcome (synthesizing `failed` when
    /// the operation forgot to set one) and exactly one report record.
    /// Operation-local errors leave the transaction `failed` and the host
    /// continues; fatal errors (and failures under `abort_on_failure`)
    /// propagate to the host worker.
    ///
    /// # Errors
    /// Returns the error that must abort this host.
    pub fn finish_transaction(
        &mut self,
        mut txn: Transaction,
        result: Result<(), OpError>,
    ) -> Result<Outcome, OpError> {
        self.active_transaction = None;

        let fatal = match result {
            Ok(()) => {
                if !txn.is_terminal() {
                    warn!(
                        title = %txn.title,
                        name = %txn.name,
                        "operation finished without an outcome"
                    );
                    txn.failed("operation finished without an outcome");
                }
                None
            }
            Err(err) => {
                if !txn.is_terminal() {
                    txn.failed(err.to_string());
                }
                err.is_fatal().then_some(err)
            }
        };

        let diff = txn.diff();
        let report = Report::for_transaction(&self.host.id, &self.current_task, &txn);
        self.reporter.record(report, &diff);

        if let Some(err) = fatal {
            return Err(err);
        }
        let outcome = txn.outcome();
        if outcome == Outcome::Failed && self.abort_on_failure {
            return Err(OpError::AbortPolicy {
                title: txn.title,
                name: txn.name,
            });
        }
        Ok(outcome)
    }
}
