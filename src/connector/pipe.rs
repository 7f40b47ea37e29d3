//! Pipe-level driver for a spawned dispatcher.
//!
//! [`RemoteDispatcher`] owns the child process and both halves of its pipe
//! pair for the lifetime of the owning connector. Requests and responses are
//! strictly serialized: `request` writes one packet and blocks until the
//! matching response arrives, so at most one request is ever in flight.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::ConnectorError;
use crate::packet::{Packet, ProtocolError};

/// A running dispatcher instance and its packet stream.
pub struct RemoteDispatcher {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl RemoteDispatcher {
    /// Spawn `command` with piped stdin/stdout and take ownership of both.
    ///
    /// stderr is inherited: the dispatcher logs there and the operator
    /// should see it.
    ///
    /// # Errors
    /// Returns a transport error when the process cannot be started.
    pub fn spawn(command: &mut Command) -> Result<Self, ConnectorError> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().ok_or_else(missing_pipe)?;
        let stdout = child.stdout.take().ok_or_else(missing_pipe)?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Write raw bootstrap bytes ahead of the packet stream.
    ///
    /// # Errors
    /// Returns a transport error when the write fails.
    pub async fn send_bootstrap(&mut self, payload: &[u8]) -> Result<(), ConnectorError> {
        self.stdin.write_all(payload).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Perform the initial `CheckAlive`/`Ack` handshake within `deadline`.
    ///
    /// # Errors
    /// Returns [`ConnectorError::HandshakeTimeout`] when the dispatcher does
    /// not answer in time, or the underlying transport/protocol error.
    pub async fn handshake(&mut self, deadline: Duration) -> Result<(), ConnectorError> {
        match timeout(deadline, self.request(Packet::CheckAlive)).await {
            Err(_) => Err(ConnectorError::HandshakeTimeout),
            Ok(Ok(Packet::Ack)) => Ok(()),
            Ok(Ok(other)) => Err(ProtocolError::UnexpectedPacket {
                expected: "Ack",
                got: other.name(),
            }
            .into()),
            Ok(Err(err)) => Err(err),
        }
    }

    /// Send one request and await its response.
    ///
    /// # Errors
    /// Returns a transport error on I/O failure and a protocol error when
    /// the peer sends a request packet back.
    pub async fn request(&mut self, request: Packet) -> Result<Packet, ConnectorError> {
        debug_assert!(request.is_request(), "{} is not a request", request.name());
        debug!(packet = request.name(), "sending request");
        request.write_to(&mut self.stdin).await?;
        let response = Packet::read_from(&mut self.stdout).await?;
        debug!(packet = response.name(), "received response");
        if response.is_request() {
            return Err(ProtocolError::UnexpectedPacket {
                expected: "a response",
                got: response.name(),
            }
            .into());
        }
        Ok(response)
    }

    /// Kill the child without protocol niceties and reap it.
    ///
    /// Used when the bootstrap or handshake fails and the dispatcher may
    /// never have come up.
    pub async fn abort(&mut self) {
        if let Err(err) = self.child.start_kill() {
            warn!(%err, "could not kill dispatcher");
        }
        let _ = self.child.wait().await;
    }

    /// Send `Exit`, drain the stream to EOF, and reap the child.
    ///
    /// Close errors are tolerated: the dispatcher may already be gone.
    pub async fn stop_and_wait(&mut self) {
        if let Err(err) = Packet::Exit.write_to(&mut self.stdin).await {
            warn!(%err, "could not send Exit; reaping anyway");
        }
        let mut rest = Vec::new();
        if let Err(err) = self.stdout.read_to_end(&mut rest).await {
            warn!(%err, "error draining dispatcher stream");
        } else if !rest.is_empty() {
            warn!(bytes = rest.len(), "unexpected trailing data after Exit");
        }
        match self.child.wait().await {
            Ok(status) if !status.success() => {
                warn!(%status, "dispatcher exited abnormally");
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "could not reap dispatcher"),
        }
    }
}

fn missing_pipe() -> ConnectorError {
    ConnectorError::Transport(std::io::Error::other("dispatcher pipes were not opened"))
}
