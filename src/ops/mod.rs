//! The idempotent operation library.
//!
//! Every operation runs inside a transaction bracketed by
//! [`crate::context::Context::begin_transaction`] and
//! [`crate::context::Context::finish_transaction`]: probe current state,
//! record it, compare with the desired state, and act only on drift. Under
//! dry-run the probes still execute but mutation is replaced by a simulated
//! `changed` outcome. Operation parameters are template-expanded with the
//! host's variables before use.

pub mod directory;
pub mod file;
pub mod git;
pub mod package;
pub mod template;
pub mod user;

use serde::Deserialize;
use thiserror::Error;

use crate::connector::{Connector, ConnectorError};
use crate::context::Context;
use crate::template::TemplateError;
use crate::transaction::Outcome;

/// Errors raised by operations.
///
/// Only transport/protocol trouble (and the abort-on-failure policy) is
/// fatal to the host; everything else terminates the current transaction as
/// `failed` and execution continues.
#[derive(Debug, Error)]
pub enum OpError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid operation: {0}")]
    InvalidSpec(String),
    #[error("{0}")]
    Failed(String),
    #[error("aborting host: operation '{title} {name}' failed")]
    AbortPolicy { title: String, name: String },
}

impl OpError {
    /// Whether this error must abort the host worker.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Connector(err) => err.is_fatal(),
            Self::AbortPolicy { .. } => true,
            _ => false,
        }
    }
}

/// Convert an action-step connector error into an operator-readable failure.
///
/// Command failures carry the remote stderr; transport errors pass through
/// untouched so they keep aborting the host.
pub(crate) fn action_error(err: ConnectorError) -> OpError {
    if let ConnectorError::CommandFailed { returncode, .. } = &err {
        let mut message = format!("command exited with status {returncode}");
        if let Some(stderr) = err.stderr_text() {
            if !stderr.is_empty() {
                message.push_str(": ");
                message.push_str(&stderr);
            }
        }
        return OpError::Failed(message);
    }
    OpError::Connector(err)
}

/// One operation as declared in a site script.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpSpec {
    Package(package::PackageOp),
    Directory(directory::DirectoryOp),
    File(file::FileOp),
    Template(template::TemplateOp),
    GitCheckout(git::GitCheckoutOp),
    User(user::UserOp),
}

impl OpSpec {
    /// Operation kind, as written in scripts.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Package(_) => "package",
            Self::Directory(_) => "directory",
            Self::File(_) => "file",
            Self::Template(_) => "template",
            Self::GitCheckout(_) => "git_checkout",
            Self::User(_) => "user",
        }
    }

    /// Execute the operation against the context's host.
    ///
    /// # Errors
    /// Returns only errors that must abort the host.
    pub async fn apply(&self, ctx: &mut Context) -> Result<Outcome, OpError> {
        match self {
            Self::Package(op) => package::package(ctx, op).await,
            Self::Directory(op) => directory::directory(ctx, op).await,
            Self::File(op) => file::file(ctx, op).await,
            Self::Template(op) => template::template(ctx, op).await,
            Self::GitCheckout(op) => git::checkout(ctx, op).await,
            Self::User(op) => user::user(ctx, op).await,
        }
    }
}

/// Canonicalize requested ownership on the target.
///
/// Resolution happens remotely so that `"0"` and `"root"` compare equal in
/// state maps. A nonexistent owner or group fails the transaction.
pub(crate) async fn resolve_owner_group(
    ctx: &mut Context,
    owner: Option<String>,
    group: Option<String>,
) -> Result<(Option<String>, Option<String>), OpError> {
    let owner = match owner {
        Some(owner) => Some(ctx.connector.resolve_user(&owner).await?),
        None => None,
    };
    let group = match group {
        Some(group) => Some(ctx.connector.resolve_group(&group).await?),
        None => None,
    };
    Ok((owner, group))
}

/// Normalize an octal mode string for state maps (`"0755"` -> `"755"`).
pub(crate) fn normalize_mode(mode: &str) -> Result<String, OpError> {
    u32::from_str_radix(mode, 8)
        .map(|bits| format!("{bits:o}"))
        .map_err(|_| OpError::InvalidSpec(format!("invalid octal mode '{mode}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_specs_parse_from_script_toml() {
        let op: OpSpec = toml::from_str("package = { atom = \"app-shells/zsh\" }").unwrap();
        assert_eq!(op.kind(), "package");

        let op: OpSpec =
            toml::from_str("git_checkout = { url = \"https://x\", dst = \"/srv/x\", depth = 1 }")
                .unwrap();
        assert_eq!(op.kind(), "git_checkout");

        let op: OpSpec =
            toml::from_str("template = { src = \"motd.j2\", dst = \"/etc/motd\" }").unwrap();
        assert_eq!(op.kind(), "template");
    }

    #[test]
    fn unknown_op_fields_are_rejected() {
        let err = toml::from_str::<OpSpec>("package = { atom = \"x\", banana = true }");
        assert!(err.is_err());
    }

    #[test]
    fn modes_normalize_or_fail() {
        assert_eq!(normalize_mode("0755").unwrap(), "755");
        assert_eq!(normalize_mode("644").unwrap(), "644");
        assert!(normalize_mode("rwx").is_err());
    }
}
