//! Package installation and removal via pacman.
//!
//! The probe is a query (`pacman -Ql <atom>`: exit 0 means installed), the
//! action an install or removal. The atom and extra options are templated.

use serde::Deserialize;
use serde_json::json;

use super::{OpError, action_error};
use crate::connector::Connector;
use crate::context::Context;
use crate::template::render_str;
use crate::transaction::{Outcome, Transaction};

/// Desired package state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageState {
    #[default]
    Present,
    Absent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageOp {
    /// Package identifier, passed opaquely to the package manager.
    pub atom: String,
    #[serde(default)]
    pub state: PackageState,
    /// Extra pacman options, inserted before the atom.
    #[serde(default)]
    pub opts: Vec<String>,
}

async fn is_installed(ctx: &mut Context, atom: &str) -> Result<bool, OpError> {
    let mut options = ctx.run_options();
    options.check = false;
    let query = vec!["pacman".to_owned(), "-Ql".to_owned(), atom.to_owned()];
    let result = ctx.connector.run(&query, options).await?;
    Ok(result.returncode == 0)
}

/// Ensure a package is installed or absent.
///
/// # Errors
/// Returns only errors that must abort the host.
pub async fn package(ctx: &mut Context, op: &PackageOp) -> Result<Outcome, OpError> {
    let mut txn = ctx.begin_transaction("package", &op.atom);
    let result = converge(ctx, &mut txn, op).await;
    ctx.finish_transaction(txn, result)
}

async fn converge(ctx: &mut Context, txn: &mut Transaction, op: &PackageOp) -> Result<(), OpError> {
    let atom = render_str(&op.atom, &ctx.vars)?;
    let opts = op
        .opts
        .iter()
        .map(|o| render_str(o, &ctx.vars))
        .collect::<Result<Vec<_>, _>>()?;

    let installed = is_installed(ctx, &atom).await?;
    txn.initial_state([("installed", json!(installed))]);
    let want_installed = op.state == PackageState::Present;
    if installed == want_installed {
        txn.unchanged();
        return Ok(());
    }
    txn.final_state([("installed", json!(want_installed))]);
    if ctx.dry_run {
        txn.pretend();
        return Ok(());
    }

    let mut command = vec![
        "pacman".to_owned(),
        "--color".to_owned(),
        "always".to_owned(),
        "--noconfirm".to_owned(),
    ];
    command.push(if want_installed { "-S" } else { "-Rs" }.to_owned());
    command.extend(opts);
    command.push(atom);
    let options = ctx.run_options();
    ctx.connector
        .run(&command, options)
        .await
        .map_err(action_error)?;
    txn.changed();
    Ok(())
}
