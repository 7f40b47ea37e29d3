//! Controller-side transport to one target host.
//!
//! A [`Connector`] bootstraps a dispatcher on the target and exposes one
//! typed method per request packet; every call is a single request/response
//! round-trip over the dispatcher's pipe pair. Connectors are not shared:
//! each host worker owns exactly one, and `&mut self` on every method keeps
//! the request channel strictly serialized.
//!
//! Concrete transports register by URL scheme in [`CONNECTORS`]; `ssh` is
//! the production transport, `local` runs the dispatcher on the controller
//! machine itself.

pub mod local;
pub mod pipe;
pub mod ssh;

use async_trait::async_trait;
use thiserror::Error;

pub use local::LocalConnector;
pub use pipe::RemoteDispatcher;
pub use ssh::SshConnector;

use crate::config::Runtime;
use crate::inventory::Host;
use crate::packet::{Packet, ProtocolError};

/// Errors surfaced by connector methods.
///
/// `InvalidField`, `PreexecFailed`, and `CommandFailed` are local to one
/// operation (the transaction fails, the host continues); everything else
/// is fatal to the host worker.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The dispatcher rejected a request field.
    #[error("invalid value for field '{field}': {message}")]
    InvalidField { field: String, message: String },
    /// The child process could not be prepared on the target.
    #[error("remote process setup failed before exec")]
    PreexecFailed,
    /// A checked command exited with a non-zero status.
    #[error("remote command exited with status {returncode}")]
    CommandFailed {
        returncode: i32,
        stdout: Option<Vec<u8>>,
        stderr: Option<Vec<u8>>,
    },
    /// The transport itself failed (spawn, pipe I/O, EOF mid-request).
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// The peer broke the packet protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The dispatcher did not complete the initial handshake in time.
    #[error("handshake with remote dispatcher timed out")]
    HandshakeTimeout,
    /// No registered connector handles the host's URL scheme.
    #[error("unsupported transport scheme '{0}'")]
    UnsupportedScheme(String),
    /// A method was called before `open` (or after `close`).
    #[error("connector is not open")]
    NotOpen,
}

impl ConnectorError {
    /// Whether this error must abort the host instead of failing the
    /// current transaction.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::InvalidField { .. } | Self::PreexecFailed | Self::CommandFailed { .. }
        )
    }

    /// Best-effort stderr text for operator-facing messages.
    #[must_use]
    pub fn stderr_text(&self) -> Option<String> {
        match self {
            Self::CommandFailed {
                stderr: Some(bytes),
                ..
            } => Some(String::from_utf8_lossy(bytes).trim_end().to_owned()),
            _ => None,
        }
    }
}

/// The result of a finished remote command.
#[derive(Debug, Clone)]
pub struct CompletedCommand {
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
    pub returncode: i32,
}

impl CompletedCommand {
    /// stdout as trimmed UTF-8, for probes that parse command output.
    #[must_use]
    pub fn stdout_text(&self) -> String {
        self.stdout
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).trim_end().to_owned())
            .unwrap_or_default()
    }
}

/// Information about a remote path.
#[derive(Debug, Clone)]
pub struct RemoteStat {
    /// One of `dir, chr, blk, file, fifo, link, sock, other`.
    pub file_type: String,
    pub mode: u32,
    pub owner: String,
    pub group: String,
    pub size: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub sha512sum: Option<Vec<u8>>,
}

/// Options for [`Connector::run`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub stdin: Option<Vec<u8>>,
    pub capture_output: bool,
    /// Treat a non-zero exit status as [`ConnectorError::CommandFailed`].
    pub check: bool,
    pub user: Option<String>,
    pub group: Option<String>,
    pub umask: Option<String>,
    pub cwd: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stdin: None,
            capture_output: true,
            check: true,
            user: None,
            group: None,
            umask: None,
            cwd: None,
        }
    }
}

/// Typed RPC against one target host.
#[async_trait]
pub trait Connector: Send {
    /// Open the transport, bootstrap the dispatcher, and handshake.
    async fn open(&mut self) -> Result<(), ConnectorError>;

    /// Send `Exit`, await EOF, and reap the dispatcher.
    async fn close(&mut self) -> Result<(), ConnectorError>;

    /// Run a command on the target.
    async fn run(
        &mut self,
        command: &[String],
        options: RunOptions,
    ) -> Result<CompletedCommand, ConnectorError>;

    /// Canonicalize a user name or uid on the target.
    async fn resolve_user(&mut self, user: &str) -> Result<String, ConnectorError>;

    /// Canonicalize a group name or gid on the target.
    async fn resolve_group(&mut self, group: &str) -> Result<String, ConnectorError>;

    /// Stat a path; `Ok(None)` when it does not exist.
    async fn stat(
        &mut self,
        path: &str,
        follow_links: bool,
        sha512sum: bool,
    ) -> Result<Option<RemoteStat>, ConnectorError>;

    /// Save content as a file on the target.
    async fn upload(
        &mut self,
        file: &str,
        content: Vec<u8>,
        mode: Option<String>,
        owner: Option<String>,
        group: Option<String>,
    ) -> Result<(), ConnectorError>;

    /// Read a file from the target.
    async fn download(&mut self, file: &str) -> Result<Vec<u8>, ConnectorError>;
}

type Constructor = fn(&Host, &Runtime) -> Box<dyn Connector>;

/// The connector registry, keyed by URL scheme.
pub const CONNECTORS: &[(&str, Constructor)] = &[("ssh", ssh::connect), ("local", local::connect)];

/// Build the connector for a host according to its transport URL.
///
/// # Errors
/// Returns [`ConnectorError::UnsupportedScheme`] for unknown schemes.
pub fn connect(host: &Host, runtime: &Runtime) -> Result<Box<dyn Connector>, ConnectorError> {
    let scheme = host.url.scheme();
    CONNECTORS
        .iter()
        .find(|(name, _)| *name == scheme)
        .map(|(_, constructor)| constructor(host, runtime))
        .ok_or_else(|| ConnectorError::UnsupportedScheme(scheme.to_owned()))
}

fn unexpected(expected: &'static str, got: &Packet) -> ConnectorError {
    ProtocolError::UnexpectedPacket {
        expected,
        got: got.name(),
    }
    .into()
}

// Shared request/response mappings used by every transport. Each helper is
// one round-trip; InvalidField responses become operation-local errors.

pub(crate) async fn rpc_run(
    session: &mut RemoteDispatcher,
    command: &[String],
    options: RunOptions,
) -> Result<CompletedCommand, ConnectorError> {
    let response = session
        .request(Packet::ProcessRun {
            command: command.to_vec(),
            stdin: options.stdin,
            capture_output: options.capture_output,
            user: options.user,
            group: options.group,
            umask: options.umask,
            cwd: options.cwd,
        })
        .await?;
    match response {
        Packet::ProcessCompleted {
            stdout,
            stderr,
            returncode,
        } => {
            if options.check && returncode != 0 {
                return Err(ConnectorError::CommandFailed {
                    returncode,
                    stdout,
                    stderr,
                });
            }
            Ok(CompletedCommand {
                stdout,
                stderr,
                returncode,
            })
        }
        Packet::InvalidField { field, message } => {
            Err(ConnectorError::InvalidField { field, message })
        }
        Packet::ProcessPreexecError => Err(ConnectorError::PreexecFailed),
        other => Err(unexpected("ProcessCompleted", &other)),
    }
}

pub(crate) async fn rpc_resolve_user(
    session: &mut RemoteDispatcher,
    user: &str,
) -> Result<String, ConnectorError> {
    match session
        .request(Packet::ResolveUser {
            user: user.to_owned(),
        })
        .await?
    {
        Packet::ResolveResult { name } => Ok(name),
        Packet::InvalidField { field, message } => {
            Err(ConnectorError::InvalidField { field, message })
        }
        other => Err(unexpected("ResolveResult", &other)),
    }
}

pub(crate) async fn rpc_resolve_group(
    session: &mut RemoteDispatcher,
    group: &str,
) -> Result<String, ConnectorError> {
    match session
        .request(Packet::ResolveGroup {
            group: group.to_owned(),
        })
        .await?
    {
        Packet::ResolveResult { name } => Ok(name),
        Packet::InvalidField { field, message } => {
            Err(ConnectorError::InvalidField { field, message })
        }
        other => Err(unexpected("ResolveResult", &other)),
    }
}

pub(crate) async fn rpc_stat(
    session: &mut RemoteDispatcher,
    path: &str,
    follow_links: bool,
    sha512sum: bool,
) -> Result<Option<RemoteStat>, ConnectorError> {
    let response = session
        .request(Packet::Stat {
            path: path.to_owned(),
            follow_links,
            sha512sum,
        })
        .await?;
    match response {
        Packet::StatResult {
            file_type,
            mode,
            owner,
            group,
            size,
            mtime,
            ctime,
            sha512sum,
        } => Ok(Some(RemoteStat {
            file_type,
            mode: u32::try_from(mode & 0o7777).unwrap_or(0),
            owner,
            group,
            size,
            mtime,
            ctime,
            sha512sum,
        })),
        Packet::InvalidField { field, .. } if field == "path" => Ok(None),
        Packet::InvalidField { field, message } => {
            Err(ConnectorError::InvalidField { field, message })
        }
        other => Err(unexpected("StatResult", &other)),
    }
}

pub(crate) async fn rpc_upload(
    session: &mut RemoteDispatcher,
    file: &str,
    content: Vec<u8>,
    mode: Option<String>,
    owner: Option<String>,
    group: Option<String>,
) -> Result<(), ConnectorError> {
    let response = session
        .request(Packet::Upload {
            file: file.to_owned(),
            content,
            mode,
            owner,
            group,
        })
        .await?;
    match response {
        Packet::Ok => Ok(()),
        Packet::InvalidField { field, message } => {
            Err(ConnectorError::InvalidField { field, message })
        }
        other => Err(unexpected("Ok", &other)),
    }
}

pub(crate) async fn rpc_download(
    session: &mut RemoteDispatcher,
    file: &str,
) -> Result<Vec<u8>, ConnectorError> {
    match session
        .request(Packet::Download {
            file: file.to_owned(),
        })
        .await?
    {
        Packet::DownloadResult { content } => Ok(content),
        Packet::InvalidField { field, message } => {
            Err(ConnectorError::InvalidField { field, message })
        }
        other => Err(unexpected("DownloadResult", &other)),
    }
}
