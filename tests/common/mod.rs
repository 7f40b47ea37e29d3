//! Shared helpers for integration tests.
//!
//! The tests drive the real binary: the local connector spawns
//! `bosun dispatch` exactly as a production run would, so the full packet
//! stream, bootstrap-free, is exercised end to end.

use bosun::config::{RunnerConfig, Runtime};
use bosun::connector::{Connector, LocalConnector};
use bosun::context::Context;
use bosun::inventory::Inventory;
use bosun::report::Reporter;

/// Path of the compiled `bosun` binary under test.
#[must_use]
pub fn bosun_exe() -> &'static str { env!("CARGO_BIN_EXE_bosun") }

/// A runtime whose dispatcher is the binary under test.
#[must_use]
pub fn test_runtime(dry_run: bool) -> Runtime {
    let config = RunnerConfig {
        dispatcher: Some(bosun_exe().into()),
        ..RunnerConfig::default()
    };
    Runtime::new(config, dry_run, 0, false)
}

/// An opened local connector backed by a freshly spawned dispatcher.
pub async fn open_local(runtime: &Runtime) -> Box<dyn Connector> {
    let mut connector: Box<dyn Connector> = Box::new(LocalConnector::new("local", runtime));
    connector.open().await.expect("dispatcher handshake");
    connector
}

/// A full per-host context over the local transport.
pub async fn local_context(dry_run: bool) -> Context {
    let runtime = test_runtime(dry_run);
    let inventory = Inventory::load(&["local://localhost".to_owned()]).expect("inventory");
    let host = inventory.hosts.values().next().expect("host").clone();
    let vars = inventory.effective_vars(&host);
    let connector = open_local(&runtime).await;
    Context::new(host, vars, connector, &runtime, Reporter::new())
}
