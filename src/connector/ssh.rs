//! SSH transport: bootstraps the dispatcher on a remote host.
//!
//! The dispatcher executable is base64-encoded and streamed over the SSH
//! channel itself: the remote side reads exactly the encoded length from
//! stdin, decodes it to a temporary file, and `exec`s it, after which the
//! same pipe pair carries the packet stream. SSH client configuration is
//! left to the user's own ssh setup; only the host's `ssh_opts` are added.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;

use super::{
    CompletedCommand, Connector, ConnectorError, RemoteDispatcher, RemoteStat, RunOptions,
    rpc_download, rpc_resolve_group, rpc_resolve_user, rpc_run, rpc_stat, rpc_upload,
};
use crate::config::Runtime;
use crate::inventory::Host;

/// Registry constructor for `ssh://` urls.
pub(super) fn connect(host: &Host, runtime: &Runtime) -> Box<dyn Connector> {
    Box::new(SshConnector::new(host, runtime))
}

/// A connector that reaches its host through the `ssh` client.
pub struct SshConnector {
    host_id: String,
    url: Url,
    ssh_opts: Vec<String>,
    runtime: Runtime,
    session: Option<RemoteDispatcher>,
}

impl SshConnector {
    #[must_use]
    pub fn new(host: &Host, runtime: &Runtime) -> Self {
        Self {
            host_id: host.id.clone(),
            url: host.url.clone(),
            ssh_opts: host.ssh_opts.clone(),
            runtime: runtime.clone(),
            session: None,
        }
    }

    fn session(&mut self) -> Result<&mut RemoteDispatcher, ConnectorError> {
        self.session.as_mut().ok_or(ConnectorError::NotOpen)
    }

    /// Shell fragment run on the remote: receive the dispatcher, then exec it.
    fn bootstrap_script(&self, payload_len: usize) -> String {
        let mut script = format!(
            "f=$(mktemp); head -c {payload_len} | base64 -d >\"$f\"; chmod 700 \"$f\"; exec \"$f\" dispatch"
        );
        if self.runtime.debug {
            script.push_str(" --debug");
        }
        script
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(&mut self) -> Result<(), ConnectorError> {
        let dispatcher = self.runtime.dispatcher_path()?;
        let binary = tokio::fs::read(&dispatcher).await?;
        let payload = STANDARD.encode(&binary);
        let script = self.bootstrap_script(payload.len());

        let mut command = Command::new("ssh");
        command.args(&self.ssh_opts);
        command.arg(self.url.as_str());
        command.arg("sh");
        command.arg("-c");
        command.arg(shell_words::quote(&script).into_owned());
        debug!(host = %self.host_id, url = %self.url, "starting ssh bootstrap");

        let mut session = RemoteDispatcher::spawn(&mut command)?;
        if let Err(err) = session.send_bootstrap(payload.as_bytes()).await {
            session.abort().await;
            return Err(err);
        }
        if let Err(err) = session.handshake(self.runtime.handshake_timeout()).await {
            session.abort().await;
            return Err(err);
        }
        info!(host = %self.host_id, "connection established via ssh");
        self.session = Some(session);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        if let Some(mut session) = self.session.take() {
            session.stop_and_wait().await;
        }
        Ok(())
    }

    async fn run(
        &mut self,
        command: &[String],
        options: RunOptions,
    ) -> Result<CompletedCommand, ConnectorError> {
        rpc_run(self.session()?, command, options).await
    }

    async fn resolve_user(&mut self, user: &str) -> Result<String, ConnectorError> {
        rpc_resolve_user(self.session()?, user).await
    }

    async fn resolve_group(&mut self, group: &str) -> Result<String, ConnectorError> {
        rpc_resolve_group(self.session()?, group).await
    }

    async fn stat(
        &mut self,
        path: &str,
        follow_links: bool,
        sha512sum: bool,
    ) -> Result<Option<RemoteStat>, ConnectorError> {
        rpc_stat(self.session()?, path, follow_links, sha512sum).await
    }

    async fn upload(
        &mut self,
        file: &str,
        content: Vec<u8>,
        mode: Option<String>,
        owner: Option<String>,
        group: Option<String>,
    ) -> Result<(), ConnectorError> {
        rpc_upload(self.session()?, file, content, mode, owner, group).await
    }

    async fn download(&mut self, file: &str) -> Result<Vec<u8>, ConnectorError> {
        rpc_download(self.session()?, file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::inventory::Inventory;

    fn runtime(debug: bool) -> Runtime {
        Runtime::new(RunnerConfig::default(), false, 0, debug)
    }

    fn host() -> Host {
        let inventory = Inventory::load(&["root@example.org:2222".to_owned()]).unwrap();
        inventory.hosts.values().next().unwrap().clone()
    }

    #[test]
    fn bootstrap_script_receives_exact_payload_length() {
        let connector = SshConnector::new(&host(), &runtime(false));
        let script = connector.bootstrap_script(1234);
        assert!(script.contains("head -c 1234"));
        assert!(script.ends_with("exec \"$f\" dispatch"));
    }

    #[test]
    fn bootstrap_script_forwards_debug() {
        let connector = SshConnector::new(&host(), &runtime(true));
        assert!(connector.bootstrap_script(1).ends_with("dispatch --debug"));
    }
}
