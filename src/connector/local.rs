//! Local transport: runs the dispatcher on the controller machine.
//!
//! `local://` hosts skip the bootstrap entirely and spawn the dispatcher
//! executable directly. Useful for managing the controller itself and as
//! the transport the test suite drives end to end.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{
    CompletedCommand, Connector, ConnectorError, RemoteDispatcher, RemoteStat, RunOptions,
    rpc_download, rpc_resolve_group, rpc_resolve_user, rpc_run, rpc_stat, rpc_upload,
};
use crate::config::Runtime;
use crate::inventory::Host;

/// Registry constructor for `local://` urls.
pub(super) fn connect(host: &Host, runtime: &Runtime) -> Box<dyn Connector> {
    Box::new(LocalConnector::new(&host.id, runtime))
}

/// A connector that dispatches against the local system.
pub struct LocalConnector {
    host_id: String,
    runtime: Runtime,
    session: Option<RemoteDispatcher>,
}

impl LocalConnector {
    #[must_use]
    pub fn new(host_id: &str, runtime: &Runtime) -> Self {
        Self {
            host_id: host_id.to_owned(),
            runtime: runtime.clone(),
            session: None,
        }
    }

    fn session(&mut self) -> Result<&mut RemoteDispatcher, ConnectorError> {
        self.session.as_mut().ok_or(ConnectorError::NotOpen)
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn open(&mut self) -> Result<(), ConnectorError> {
        let dispatcher = self.runtime.dispatcher_path()?;
        let mut command = Command::new(&dispatcher);
        command.arg("dispatch");
        if self.runtime.debug {
            command.arg("--debug");
        }
        debug!(host = %self.host_id, dispatcher = %dispatcher.display(), "spawning local dispatcher");

        let mut session = RemoteDispatcher::spawn(&mut command)?;
        if let Err(err) = session.handshake(self.runtime.handshake_timeout()).await {
            session.abort().await;
            return Err(err);
        }
        info!(host = %self.host_id, "connection established locally");
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
