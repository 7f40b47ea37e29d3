//! File content synchronization.
//!
//! The probe downloads nothing: it compares the SHA-512 the dispatcher
//! reports against the hash of the desired content, and uploads only on
//! drift. [`sync_remote_file`] carries the shared probe/compare/upload flow
//! also used by the template operation.

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha512};

use super::{OpError, normalize_mode, resolve_owner_group};
use crate::connector::Connector;
use crate::context::Context;
use crate::template::render_str;
use crate::transaction::{Outcome, Transaction};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileOp {
    pub dst: String,
    /// Local file whose raw bytes are uploaded.
    pub src: Option<Utf8PathBuf>,
    /// Literal content, alternative to `src`.
    pub content: Option<String>,
    /// Octal mode; defaults to the scoped `file_mode`.
    pub mode: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

/// Ensure a remote file has the given content, mode, and ownership.
///
/// # Errors
/// Returns only errors that must abort the host.
pub async fn file(ctx: &mut Context, op: &FileOp) -> Result<Outcome, OpError> {
    let mut txn = ctx.begin_transaction("file", &op.dst);
    let result = converge(ctx, &mut txn, op).await;
    ctx.finish_transaction(txn, result)
}

async fn converge(ctx: &mut Context, txn: &mut Transaction, op: &FileOp) -> Result<(), OpError> {
    let content = match (&op.src, &op.content) {
        (Some(src), None) => std::fs::read(src.as_std_path())?,
        (None, Some(content)) => content.clone().into_bytes(),
        _ => {
            return Err(OpError::InvalidSpec(
                "file requires exactly one of 'src' or 'content'".to_owned(),
            ));
        }
    };
    let dst = render_str(&op.dst, &ctx.vars)?;
    sync_remote_file(
        ctx,
        txn,
        &dst,
        content,
        op.mode.clone(),
        op.owner.clone(),
        op.group.clone(),
    )
    .await
}

/// Probe, compare, and (when drifted) upload one remote file.
///
/// Scoped defaults supply unset mode/owner/group. Expects to run inside an
/// open transaction and records its states there.
pub(super) async fn sync_remote_file(
    ctx: &mut Context,
    txn: &mut Transaction,
    dst: &str,
    content: Vec<u8>,
    mode: Option<String>,
    owner: Option<String>,
    group: Option<String>,
) -> Result<(), OpError> {
    let defaults = ctx.defaults();
    let mode = match mode.or(defaults.file_mode) {
        Some(mode) => Some(normalize_mode(&mode)?),
        None => None,
    };
    let (owner, group) = resolve_owner_group(
        ctx,
        owner.or(defaults.owner),
        group.or(defaults.group),
    )
    .await?;

    let desired_sha = hex::encode(Sha512::digest(&content));
    let current = ctx.connector.stat(dst, true, true).await?;
    match &current {
        None => txn.initial_state([("exists", json!(false))]),
        Some(stat) if stat.file_type == "file" => {
            txn.initial_state([("exists", json!(true))]);
            let current_sha = stat.sha512sum.as_deref().map(hex::encode).unwrap_or_default();
            txn.initial_state([("sha512", json!(current_sha))]);
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
                "destination exists but is of type '{}', not a regular file",
                stat.file_type
            ));
            return Ok(());
        }
    }

    txn.final_state([("exists", json!(true)), ("sha512", json!(desired_sha))]);
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

    ctx.connector
        .upload(dst, content, mode, owner, group)
        .await?;
    txn.changed();
    Ok(())
}
