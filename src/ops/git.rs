//! Git repository checkout and update.
//!
//! The probe resolves the desired revision on the remote side of the url
//! (`git ls-remote`) and compares it with the checkout's current `HEAD`,
//! so the state comparison works without touching the repository. The
//! action is a uniform init/fetch/checkout sequence that handles both the
//! first clone and later updates, honouring shallow `depth` fetches.

use serde::Deserialize;
use serde_json::json;

use super::{OpError, action_error};
use crate::connector::Connector;
use crate::context::Context;
use crate::template::render_str;
use crate::transaction::{Outcome, Transaction};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitCheckoutOp {
    pub url: String,
    pub dst: String,
    /// Shallow history depth for clone and fetch.
    pub depth: Option<u32>,
    /// Branch, tag, or commit id; remote `HEAD` when absent.
    pub rev: Option<String>,
}

async fn remote_rev(ctx: &mut Context, url: &str, rev: Option<&str>) -> Result<String, OpError> {
    let command = vec![
        "git".to_owned(),
        "ls-remote".to_owned(),
        url.to_owned(),
        rev.unwrap_or("HEAD").to_owned(),
    ];
    let mut options = ctx.run_options();
    options.check = false;
    let result = ctx.connector.run(&command, options).await?;
    if result.returncode != 0 {
        return Err(OpError::Failed(format!(
            "git ls-remote {url} failed with status {}",
            result.returncode
        )));
    }
    if let Some(hash) = result.stdout_text().split_whitespace().next() {
        return Ok(hash.to_owned());
    }
    // An empty listing with an explicit rev usually means a raw commit id.
    rev.map(str::to_owned).ok_or_else(|| {
        OpError::Failed(format!("cannot resolve remote HEAD of {url}"))
    })
}

async fn current_head(ctx: &mut Context, dst: &str) -> Result<Option<String>, OpError> {
    let command = vec![
        "git".to_owned(),
        "-C".to_owned(),
        dst.to_owned(),
        "rev-parse".to_owned(),
        "HEAD".to_owned(),
    ];
    let mut options = ctx.run_options();
    options.check = false;
    let result = ctx.connector.run(&command, options).await?;
    if result.returncode == 0 {
        Ok(Some(result.stdout_text()))
    } else {
        Ok(None)
    }
}

/// Ensure a checkout of `url` at `dst` points at the desired revision.
///
/// # Errors
/// Returns only errors that must abort the host.
pub async fn checkout(ctx: &mut Context, op: &GitCheckoutOp) -> Result<Outcome, OpError> {
    let mut txn = ctx.begin_transaction("git", &op.dst);
    let result = converge(ctx, &mut txn, op).await;
    ctx.finish_transaction(txn, result)
}

async fn converge(
    ctx: &mut Context,
    txn: &mut Transaction,
    op: &GitCheckoutOp,
) -> Result<(), OpError> {
    let url = render_str(&op.url, &ctx.vars)?;
    let dst = render_str(&op.dst, &ctx.vars)?;

    let desired = remote_rev(ctx, &url, op.rev.as_deref()).await?;
    let current = current_head(ctx, &dst).await?;
    txn.initial_state([("head", json!(current))]);
    txn.final_state([("head", json!(desired))]);

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
        let init = vec![
            "git".to_owned(),
            "init".to_owned(),
            "-q".to_owned(),
            dst.clone(),
        ];
        ctx.connector
            .run(&init, options.clone())
            .await
            .map_err(action_error)?;
    }
    let mut fetch = vec![
        "git".to_owned(),
        "-C".to_owned(),
        dst.clone(),
        "fetch".to_owned(),
        "-q".to_owned(),
    ];
    if let Some(depth) = op.depth {
        fetch.push("--depth".to_owned());
        fetch.push(depth.to_string());
    }
    fetch.push(url);
    fetch.push(op.rev.clone().unwrap_or_else(|| "HEAD".to_owned()));
    ctx.connector
        .run(&fetch, options.clone())
        .await
        .map_err(action_error)?;

    let switch = vec![
        "git".to_owned(),
        "-C".to_owned(),
        dst,
        "checkout".to_owned(),
        "-q".to_owned(),
        "--detach".to_owned(),
        "FETCH_HEAD".to_owned(),
    ];
    ctx.connector
        .run(&switch, options)
        .await
        .map_err(action_error)?;
    txn.changed();
    Ok(())
}
