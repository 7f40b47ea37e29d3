//! Site scripts: the operator's declaration of what hosts should look like.
//!
//! A script is an ordered list of tasks; each task scopes a defaults frame,
//! names tracked paths for reporting, and lists operations executed in
//! order. Scripts are data, not code: anything dynamic goes through the
//! template engine.
//!
//! ```toml
//! [[task]]
//! id = "zsh"
//! description = "Install zsh and a global configuration"
//! track = ["/etc/zsh"]
//! defaults = { user = "root", umask = "022", dir_mode = "755", file_mode = "644" }
//!
//! [[task.op]]
//! package = { atom = "app-shells/zsh" }
//!
//! [[task.op]]
//! template = { src = "templates/zshrc.j2", dst = "/etc/zsh/zshrc" }
//! ```

use std::collections::BTreeSet;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::connector::Connector;
use crate::context::{Context, Defaults};
use crate::ops::{OpError, OpSpec};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("cannot read script '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse script '{path}': {source}")]
    Parse {
        path: String,
        source: Box<toml::de::Error>,
    },
    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),
}

/// A named unit of operator logic.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    /// Stable identifier used in reports.
    pub id: String,
    pub description: Option<String>,
    /// Paths whose state is probed after the task at high verbosity.
    #[serde(default)]
    pub track: Vec<String>,
    /// Defaults frame pushed around this task's operations.
    pub defaults: Option<Defaults>,
    /// Abort the host on the first failed operation of this task.
    #[serde(default)]
    pub abort_on_failure: bool,
    #[serde(default, rename = "op")]
    pub ops: Vec<OpSpec>,
}

/// A parsed site script.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    #[serde(default, rename = "task")]
    pub tasks: Vec<Task>,
}

impl Script {
    /// Load a script file.
    ///
    /// # Errors
    /// Returns an error for unreadable files, malformed TOML, or duplicate
    /// task ids.
    pub fn load(path: &str) -> Result<Self, ScriptError> {
        let text = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_owned(),
            source,
        })?;
        let script: Self = toml::from_str(&text).map_err(|source| ScriptError::Parse {
            path: path.to_owned(),
            source: Box::new(source),
        })?;
        let mut seen = BTreeSet::new();
        for task in &script.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(ScriptError::DuplicateTask(task.id.clone()));
            }
        }
        Ok(script)
    }
}

/// Execute a script within a host's context.
///
/// Each task pushes its defaults frame and pops it on every exit path;
/// operation outcomes are reported by the transaction engine, so only
/// host-fatal errors surface here.
///
/// # Errors
/// Returns the error that aborted the host.
pub async fn execute(ctx: &mut Context, script: &Script) -> Result<(), OpError> {
    for task in &script.tasks {
        info!(
            host = %ctx.host.id,
            task = %task.id,
            "{}",
            task.description.as_deref().unwrap_or("running task"),
        );
        ctx.current_task = task.id.clone();
        ctx.abort_on_failure = task.abort_on_failure;

        let guard = task.defaults.clone().map(|frame| ctx.push_defaults(frame));
        let mut result = Ok(());
        for op in &task.ops {
            debug!(host = %ctx.host.id, op = op.kind(), "applying operation");
            if let Err(err) = op.apply(ctx).await {
                result = Err(err);
                break;
            }
        }
        if result.is_ok() && ctx.effective_verbosity() >= 2 {
            result = probe_tracked_paths(ctx, task).await;
        }
        if let Some(guard) = guard {
            ctx.pop_defaults(guard);
        }
        result?;
    }
    ctx.current_task = String::new();
    Ok(())
}

/// Report the post-task state of the task's tracked paths.
async fn probe_tracked_paths(ctx: &mut Context, task: &Task) -> Result<(), OpError> {
    for path in &task.track {
        match ctx.connector.stat(path, true, false).await {
            Ok(Some(stat)) => info!(
                host = %ctx.host.id,
                task = %task.id,
                path,
                file_type = %stat.file_type,
                mode = %format!("{:o}", stat.mode),
                owner = %stat.owner,
                "tracked path"
            ),
            Ok(None) => info!(host = %ctx.host.id, task = %task.id, path, "tracked path absent"),
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => debug!(path, %err, "tracked path probe failed"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"
        [[task]]
        id = "zsh"
        description = "Installs zsh and a global zsh configuration"
        track = ["/etc/zsh"]
        defaults = { user = "root", umask = "022", dir_mode = "755", file_mode = "644", owner = "root", group = "root" }

        [[task.op]]
        package = { atom = "app-shells/zsh" }

        [[task.op]]
        git_checkout = { url = "https://github.com/romkatv/powerlevel10k", dst = "/usr/share/zsh/repos/romkatv/powerlevel10k", depth = 1 }

        [[task.op]]
        directory = { path = "/etc/zsh" }

        [[task.op]]
        template = { src = "templates/zsh/zshrc.j2", dst = "/etc/zsh/zshrc" }
    "#;

    fn load(text: &str) -> Result<Script, ScriptError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.toml");
        std::fs::write(&path, text).unwrap();
        Script::load(path.to_str().unwrap())
    }

    #[test]
    fn parses_tasks_defaults_and_ops() {
        let script = load(SCRIPT).unwrap();
        assert_eq!(script.tasks.len(), 1);
        let task = &script.tasks[0];
        assert_eq!(task.id, "zsh");
        assert_eq!(task.track, ["/etc/zsh"]);
        assert_eq!(task.ops.len(), 4);
        let defaults = task.defaults.as_ref().unwrap();
        assert_eq!(defaults.user.as_deref(), Some("root"));
        assert_eq!(defaults.dir_mode.as_deref(), Some("755"));
        assert_eq!(
            task.ops.iter().map(OpSpec::kind).collect::<Vec<_>>(),
            ["package", "git_checkout", "directory", "template"]
        );
    }

    #[test]
    fn duplicate_task_ids_are_rejected() {
        let err = load("[[task]]\nid = \"a\"\n[[task]]\nid = \"a\"\n").unwrap_err();
        assert!(matches!(err, ScriptError::DuplicateTask(id) if id == "a"));
    }

    #[test]
    fn unknown_task_fields_are_rejected() {
        assert!(load("[[task]]\nid = \"a\"\nbanana = 1\n").is_err());
    }
}
