//! Command-line entry point for both halves of bosun.
//!
//! `bosun run` is the controller; the hidden `bosun dispatch` subcommand is
//! what the bootstrap executes on targets. Exit codes: 0 success, 1 one or
//! more hosts aborted or had failed operations, 2 usage error, 3 fatal
//! protocol error.

use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand};

use bosun::config::{RunnerConfig, Runtime};
use bosun::inventory::Inventory;
use bosun::report::Reporter;
use bosun::runner::{self, HostStatus, RunSummary};
use bosun::script::Script;

#[derive(Parser)]
#[command(name = "bosun", version, about = "Agentless remote configuration runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a site script against an inventory.
    Run(RunArgs),
    /// Dispatcher entry point; spawned on targets during bootstrap.
    #[command(hide = true)]
    Dispatch {
        /// Verbose dispatcher logging on stderr.
        #[arg(long)]
        debug: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Restrict the run to a comma-separated list of host ids.
    #[arg(short = 'H', long = "hosts", value_name = "CSV")]
    hosts: Option<String>,

    /// Probe current state but perform no mutations.
    #[arg(long = "dry", visible_alias = "pretend", alias = "dry-run")]
    dry: bool,

    /// Increase output verbosity; may be given multiple times.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Enable debug logging on both sides of the connection.
    #[arg(long)]
    debug: bool,

    /// Maximum number of hosts driven in parallel.
    #[arg(long, value_name = "N")]
    fanout: Option<usize>,

    /// One or more inventories (TOML files or ssh destinations), followed
    /// by the site script.
    #[arg(value_name = "INVENTORY... SCRIPT", required = true, num_args = 2..)]
    args: Vec<String>,
}

fn init_tracing(directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

const fn log_level(verbose: u8, debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

const EXIT_FAILURES: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_PROTOCOL: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Dispatch { debug } => {
            init_tracing(if debug { "debug" } else { "warn" });
            let code = bosun::dispatcher::run().await;
            ExitCode::from(u8::try_from(code).unwrap_or(EXIT_PROTOCOL))
        }
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> ExitCode {
    init_tracing(log_level(args.verbose, args.debug));

    let mut config = match RunnerConfig::load() {
        Ok(config) => config,
        Err(err) => return usage_error(&err.to_string()),
    };
    if let Some(fanout) = args.fanout {
        config.fanout = fanout;
    }
    let runtime = Runtime::new(config, args.dry, args.verbose, args.debug);

    // Positionals are INVENTORY... SCRIPT; clap guarantees at least two.
    let Some((script_path, inventory_args)) = args.args.split_last() else {
        return usage_error("expected at least one inventory and a script");
    };

    let inventory = match Inventory::load(inventory_args) {
        Ok(inventory) => inventory,
        Err(err) => return usage_error(&err.to_string()),
    };
    let script = match Script::load(script_path) {
        Ok(script) => script,
        Err(err) => return usage_error(&err.to_string()),
    };
    let selected = match inventory.select_hosts(args.hosts.as_deref()) {
        Ok(selected) => selected,
        Err(err) => return usage_error(&err.to_string()),
    };
    if selected.is_empty() {
        return usage_error("the inventory defines no hosts");
    }

    let reporter = Reporter::new();
    let summary = runner::run_hosts(&runtime, &inventory, &script, &selected, &reporter).await;
    print_summary(&summary, runtime.dry_run);

    if summary.protocol_fault() {
        ExitCode::from(EXIT_PROTOCOL)
    } else if summary.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILURES)
    }
}

fn usage_error(message: &str) -> ExitCode {
    eprintln!("error: {message}");
    ExitCode::from(EXIT_USAGE)
}

fn print_summary(summary: &RunSummary, dry_run: bool) {
    for host in &summary.hosts {
        match &host.status {
            HostStatus::Completed {
                changed,
                unchanged,
                failed,
            } => println!(
                "host {}: {changed} changed, {unchanged} unchanged, {failed} failed",
                host.host
            ),
            HostStatus::Aborted { reason, .. } => {
                println!("host {}: aborted ({reason})", host.host);
            }
        }
    }
    if dry_run {
        println!("(dry-run: no changes were applied)");
    }
}
