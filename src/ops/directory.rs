//! Directory creation and attribute drift correction.

use serde::Deserialize;
use serde_json::json;

use super::{OpError, action_error, normalize_mode, resolve_owner_group};
use crate::connector::Connector;
use crate::context::Context;
use crate::template::render_str;
use crate::transaction::{Outcome, Transaction};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryOp {
    pub path: String,
    /// Octal mode; defaults to the scoped `dir_mode`.
    pub mode: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

/// Ensure a directory exists with the requested mode and ownership.
///
/// Attributes are only managed when requested (directly or through scoped
/// defaults); unmanaged attributes are left alone.
///
/// # Errors
/// Returns only errors that must abort the host.
pub async fn directory(ctx: &mut Context, op: &DirectoryOp) -> Result<Outcome, OpError> {
    let mut txn = ctx.begin_transaction("directory", &op.path);
    let result = converge(ctx, &mut txn, op).await;
    ctx.finish_transaction(txn, result)
}

async fn converge(
    ctx: &mut Context,
    txn: &mut Transaction,
    op: &DirectoryOp,
) -> Result<(), OpError> {
    let path = render_str(&op.path, &ctx.vars)?;
    let defaults = ctx.defaults();
    let mode = match op.mode.clone().or(defaults.dir_mode) {
        Some(mode) => Some(normalize_mode(&mode)?),
        None => None,
    };
    let (owner, group) = resolve_owner_group(
        ctx,
        op.owner.clone().or(defaults.owner),
        op.group.clone().or(defaults.group),
    )
    .await?;

    let current = ctx.connector.stat(&path, true, false).await?;
    match &current {
        None => txn.initial_state([("exists", json!(false))]),
        Some(stat) if stat.file_type == "dir" => {
            txn.initial_state([("exists", json!(true))]);
            if mode.is_some() {
                txn.initial_state([("mode", json!(format!("{:o}", stat.mode)))]);
            }
            if owner.is_some() {
                txn.initial_state([("owner", json!(stat.owner))]);
            }
            if group.is_some() {
                txn.initial_state([("group", json!(stat.group))]);
            }
        }
        Some(stat) => {
            txn.failed(format!(
                "path exists but is of type '{}', not a directory",
                stat.file_type
            ));
            return Ok(());
        }
    }

    txn.final_state([("exists", json!(true))]);
    if let Some(mode) = &mode {
        txn.final_state([("mode", json!(mode))]);
    }
    if let Some(owner) = &owner {
        txn.final_state([("owner", json!(owner))]);
    }
    if let Some(group) = &group {
        txn.final_state([("group", json!(group))]);
    }

    if txn.states_match() {
        txn.unchanged();
        return Ok(());
    }
    if ctx.dry_run {
        txn.pretend();
        return Ok(());
    }

    let options = ctx.run_options();
    if current.is_none() {
        let mkdir = vec!["mkdir".to_owned(), "-p".to_owned(), path.clone()];
        ctx.connector
            .run(&mkdir, options.clone())
            .await
            .map_err(action_error)?;
    }
    if let Some(mode) = &mode {
        let chmod = vec!["chmod".to_owned(), mode.clone(), path.clone()];
        ctx.connector
            .run(&chmod, options.clone())
            .await
            .map_err(action_error)?;
    }
    if owner.is_some() || group.is_some() {
        let spec = match (&owner, &group) {
            (Some(owner), Some(group)) => format!("{owner}:{group}"),
            (Some(owner), None) => owner.clone(),
            (None, Some(group)) => format!(":{group}"),
            (None, None) => unreachable!(),
        };
        let chown = vec!["chown".to_owned(), spec, path];
        ctx.connector
            .run(&chown, options)
            .await
            .map_err(action_error)?;
    }
    txn.changed();
    Ok(())
}
