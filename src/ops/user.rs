//! System user accounts.

use serde::Deserialize;
use serde_json::json;

use super::{OpError, action_error};
use crate::connector::{Connector, ConnectorError};
use crate::context::Context;
use crate::template::render_str;
use crate::transaction::{Outcome, Transaction};

/// Desired account state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserState {
    #[default]
    Present,
    Absent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserOp {
    pub name: String,
    #[serde(default)]
    pub state: UserState,
    pub uid: Option<u32>,
    /// Primary group; must already exist.
    pub group: Option<String>,
    pub home: Option<String>,
    pub shell: Option<String>,
    /// Create as a system account.
    #[serde(default)]
    pub system: bool,
    pub comment: Option<String>,
}

/// Ensure a user account exists or is absent.
///
/// The probe asks the dispatcher to resolve the name; creation and removal
/// go through `useradd`/`userdel`. Attributes are applied on creation only:
/// reconciling attribute drift of an existing account is out of scope.
///
/// # Errors
/// Returns only errors that must abort the host.
pub async fn user(ctx: &mut Context, op: &UserOp) -> Result<Outcome, OpError> {
    let mut txn = ctx.begin_transaction("user", &op.name);
    let result = converge(ctx, &mut txn, op).await;
    ctx.finish_transaction(txn, result)
}

async fn converge(ctx: &mut Context, txn: &mut Transaction, op: &UserOp) -> Result<(), OpError> {
    let name = render_str(&op.name, &ctx.vars)?;

    let exists = match ctx.connector.resolve_user(&name).await {
        Ok(_) => true,
        Err(ConnectorError::InvalidField { .. }) => false,
        Err(err) => return Err(err.into()),
    };
    txn.initial_state([("exists", json!(exists))]);
    let want_exists = op.state == UserState::Present;
    if exists == want_exists {
        txn.unchanged();
        return Ok(());
    }
    txn.final_state([("exists", json!(want_exists))]);
    if ctx.dry_run {
        txn.pretend();
        return Ok(());
    }

    let command = if want_exists {
        let mut command = vec!["useradd".to_owned()];
        if let Some(uid) = op.uid {
            command.push("-u".to_owned());
            command.push(uid.to_string());
        }
        if let Some(group) = &op.group {
            command.push("-g".to_owned());
            command.push(group.clone());
        }
        if let Some(home) = &op.home {
            command.push("-m".to_owned());
            command.push("-d".to_owned());
            command.push(home.clone());
        }
        if let Some(shell) = &op.shell {
            command.push("-s".to_owned());
            command.push(shell.clone());
        }
        if op.system {
            command.push("-r".to_owned());
        }
        if let Some(comment) = &op.comment {
            command.push("-c".to_owned());
            command.push(comment.clone());
        }
        command.push(name);
        command
    } else {
        vec!["userdel".to_owned(), name]
    };

    let options = ctx.run_options();
    ctx.connector
        .run(&command, options)
        .await
        .map_err(action_error)?;
    txn.changed();
    Ok(())
}
