//! The host runner: parallel per-host execution.
//!
//! Each selected host gets its own worker task: open the connector
//! (handshake included), execute the script in a fresh context, close the
//! connector. Workers are independent; a host that cannot connect is marked
//! aborted and the others continue. Fan-out is bounded by the configured
//! limit, and an interrupt aborts the remaining workers while keeping the
//! overall result well-defined.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Runtime;
use crate::connector::{Connector, ConnectorError, connect};
use crate::context::Context;
use crate::inventory::Inventory;
use crate::ops::OpError;
use crate::report::{Report, Reporter};
use crate::script::{self, Script};
use crate::transaction::Outcome;

/// Terminal state of one host's run.
#[derive(Debug, Clone)]
pub enum HostStatus {
    /// The script ran to completion (operations may still have failed).
    Completed {
        changed: usize,
        unchanged: usize,
        failed: usize,
    },
    /// The host was abandoned before the script finished.
    Aborted {
        reason: String,
        /// The abort was a packet protocol fault, not mere transport loss.
        protocol: bool,
    },
}

/// Result of one host worker.
#[derive(Debug, Clone)]
pub struct HostResult {
    pub host: String,
    pub status: HostStatus,
}

impl HostResult {
    /// A host counts as successful when it completed with no failures.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.status, HostStatus::Completed { failed: 0, .. })
    }
}

/// Aggregate of a whole run.
#[derive(Debug)]
pub struct RunSummary {
    pub hosts: Vec<HostResult>,
    pub reports: Vec<Report>,
}

impl RunSummary {
    #[must_use]
    pub fn success(&self) -> bool { self.hosts.iter().all(HostResult::is_ok) }

    /// Whether any host died of a packet protocol fault.
    #[must_use]
    pub fn protocol_fault(&self) -> bool {
        self.hosts
            .iter()
            .any(|h| matches!(h.status, HostStatus::Aborted { protocol: true, .. }))
    }
}

fn is_protocol_fault(err: &OpError) -> bool {
    matches!(
        err,
        OpError::Connector(ConnectorError::Protocol(_))
    )
}

async fn run_host(
    host: crate::inventory::Host,
    vars: crate::inventory::VarMap,
    script: Arc<Script>,
    runtime: Runtime,
    reporter: Reporter,
) -> HostResult {
    let id = host.id.clone();
    info!(host = %id, url = %host.url, "connecting");

    let mut connector = match connect(&host, &runtime) {
        Ok(connector) => connector,
        Err(err) => {
            error!(host = %id, %err, "no usable transport");
            return HostResult {
                host: id,
                status: HostStatus::Aborted {
                    reason: err.to_string(),
                    protocol: false,
                },
            };
        }
    };
    if let Err(err) = connector.open().await {
        error!(host = %id, %err, "could not open connection");
        return HostResult {
            host: id,
            status: HostStatus::Aborted {
                reason: err.to_string(),
                protocol: matches!(err, ConnectorError::Protocol(_)),
            },
        };
    }

    let mut ctx = Context::new(host, vars, connector, &runtime, reporter.clone());
    let result = script::execute(&mut ctx, &script).await;

    if let Err(err) = ctx.connector.close().await {
        warn!(host = %id, %err, "error while closing connection");
    }

    match result {
        Ok(()) => HostResult {
            host: id.clone(),
            status: HostStatus::Completed {
                changed: reporter.count(&id, Outcome::Changed),
                unchanged: reporter.count(&id, Outcome::Unchanged),
                failed: reporter.count(&id, Outcome::Failed),
            },
        },
        Err(err) => {
            error!(host = %id, %err, "host aborted");
            HostResult {
                host: id,
                status: HostStatus::Aborted {
                    reason: err.to_string(),
                    protocol: is_protocol_fault(&err),
                },
            }
        }
    }
}

/// Run the script on every selected host, `fanout` hosts at a time.
pub async fn run_hosts(
    runtime: &Runtime,
    inventory: &Inventory,
    script: &Script,
    selected: &[String],
    reporter: &Reporter,
) -> RunSummary {
    let script = Arc::new(script.clone());
    let limit = runtime.config.fanout.max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut join_set = JoinSet::new();

    for id in selected {
        let Some(host) = inventory.hosts.get(id) else {
            continue;
        };
        let host = host.clone();
        let vars = inventory.effective_vars(&host);
        let script = Arc::clone(&script);
        let runtime = runtime.clone();
        let reporter = reporter.clone();
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            run_host(host, vars, script, runtime, reporter).await
        });
    }

    let mut results: Vec<HostResult> = Vec::new();
    let mut interrupted = false;
    loop {
        tokio::select! {
            joined = join_set.join_next() => match joined {
                None => break,
                Some(Ok(result)) => results.push(result),
                Some(Err(err)) if err.is_cancelled() => {}
                Some(Err(err)) => error!(%err, "host worker crashed"),
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                warn!("interrupt received; aborting remaining hosts");
                interrupted = true;
                join_set.abort_all();
            }
        }
    }

    // Hosts whose workers never finished (interrupt, panic) are aborted.
    let finished: BTreeSet<String> = results.iter().map(|r| r.host.clone()).collect();
    for id in selected {
        if !finished.contains(id) {
            results.push(HostResult {
                host: id.clone(),
                status: HostStatus::Aborted {
                    reason: "cancelled".to_owned(),
                    protocol: false,
                },
            });
        }
    }
    results.sort_by(|a, b| a.host.cmp(&b.host));

    RunSummary {
        hosts: results,
        reports: reporter.reports(),
    }
}
