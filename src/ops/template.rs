//! Rendered configuration files.
//!
//! Renders a local template with the host's effective variables and keeps
//! the remote file in sync with the rendered output; the upload path is
//! shared with the plain file operation.

use camino::Utf8PathBuf;
use serde::Deserialize;

use super::OpError;
use super::file::sync_remote_file;
use crate::context::Context;
use crate::template::{render_file, render_str};
use crate::transaction::{Outcome, Transaction};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateOp {
    /// Local template file, relative to the working directory.
    pub src: Utf8PathBuf,
    pub dst: String,
    /// Octal mode; defaults to the scoped `file_mode`.
    pub mode: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

/// Render a template and ensure the remote file matches the output.
///
/// # Errors
/// Returns only errors that must abort the host.
pub async fn template(ctx: &mut Context, op: &TemplateOp) -> Result<Outcome, OpError> {
    let mut txn = ctx.begin_transaction("template", &op.dst);
    let result = converge(ctx, &mut txn, op).await;
    ctx.finish_transaction(txn, result)
}

async fn converge(
    ctx: &mut Context,
    txn: &mut Transaction,
    op: &TemplateOp,
) -> Result<(), OpError> {
    let rendered = render_file(&op.src, &ctx.vars)?;
    let dst = render_str(&op.dst, &ctx.vars)?;
    sync_remote_file(
        ctx,
        txn,
        &dst,
        rendered.into_bytes(),
        op.mode.clone(),
        op.owner.clone(),
        op.group.clone(),
    )
    .await
}
