//! Packet shapes, the static registry, and framing.
//!
//! Every message on the dispatcher stream is a `u32` packet id followed by
//! that packet's fields in declared order; there is no outer length prefix
//! because the id plus the field types fully determine the byte count. The
//! sender flushes after each packet.
//!
//! The [`PACKETS`] table is the registry: the table index is the wire id, and
//! both ends of the connection are built from the same table, so agreement
//! holds by construction. Requests are handled by the dispatcher; responses
//! are never sent by the controller.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::codec::{self, WireError};

/// Which side of the connection may send a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by the controller, handled by the dispatcher.
    Request,
    /// Sent by the dispatcher in answer to a request.
    Response,
}

/// One row of the packet registry.
#[derive(Debug, Clone, Copy)]
pub struct PacketDescriptor {
    pub name: &'static str,
    pub direction: Direction,
}

const fn desc(name: &'static str, direction: Direction) -> PacketDescriptor {
    PacketDescriptor { name, direction }
}

/// The packet registry. Index = wire id; order is part of the protocol.
pub const PACKETS: [PacketDescriptor; 16] = [
    desc("Ok", Direction::Response),
    desc("Ack", Direction::Response),
    desc("CheckAlive", Direction::Request),
    desc("Exit", Direction::Request),
    desc("InvalidField", Direction::Response),
    desc("ProcessCompleted", Direction::Response),
    desc("ProcessPreexecError", Direction::Response),
    desc("ProcessRun", Direction::Request),
    desc("StatResult", Direction::Response),
    desc("Stat", Direction::Request),
    desc("ResolveResult", Direction::Response),
    desc("ResolveUser", Direction::Request),
    desc("ResolveGroup", Direction::Request),
    desc("Upload", Direction::Request),
    desc("DownloadResult", Direction::Response),
    desc("Download", Direction::Request),
];

/// Errors in packet framing or sequencing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Field-level decoding failed (including unexpected EOF).
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The stream produced an id outside the registry.
    #[error("unknown packet id {0}")]
    UnknownPacket(u32),
    /// A response-only packet arrived where a request was expected.
    #[error("received response packet {0} as a request")]
    ResponseAsRequest(&'static str),
    /// The peer answered with a packet the caller did not expect.
    #[error("expected {expected} but received {got}")]
    UnexpectedPacket {
        expected: &'static str,
        got: &'static str,
    },
}

/// A protocol message, request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Generic success indicator.
    Ok,
    /// Acknowledges a previous [`Packet::CheckAlive`].
    Ack,
    /// Liveness probe; the receiver must answer with [`Packet::Ack`].
    CheckAlive,
    /// Tells the dispatcher to close the connection and terminate.
    Exit,
    /// A field in the previous request carried an invalid value.
    InvalidField { field: String, message: String },
    /// Result of a finished process.
    ProcessCompleted {
        stdout: Option<Vec<u8>>,
        stderr: Option<Vec<u8>>,
        returncode: i32,
    },
    /// The pre-exec hook failed while preparing the child process.
    ProcessPreexecError,
    /// Run a process on the target.
    ProcessRun {
        command: Vec<String>,
        stdin: Option<Vec<u8>>,
        capture_output: bool,
        user: Option<String>,
        group: Option<String>,
        umask: Option<String>,
        cwd: Option<String>,
    },
    /// Result of a [`Packet::Stat`] request.
    StatResult {
        file_type: String,
        mode: u64,
        owner: String,
        group: String,
        size: u64,
        mtime: u64,
        ctime: u64,
        sha512sum: Option<Vec<u8>>,
    },
    /// Retrieve information about a path.
    Stat {
        path: String,
        follow_links: bool,
        sha512sum: bool,
    },
    /// Canonical name resolved by [`Packet::ResolveUser`] or [`Packet::ResolveGroup`].
    ResolveResult { name: String },
    /// Canonicalize a user name or uid and ensure it exists.
    ResolveUser { user: String },
    /// Canonicalize a group name or gid and ensure it exists.
    ResolveGroup { group: String },
    /// Save content as a file on the target.
    Upload {
        file: String,
        content: Vec<u8>,
        mode: Option<String>,
        owner: Option<String>,
        group: Option<String>,
    },
    /// Content returned by [`Packet::Download`].
    DownloadResult { content: Vec<u8> },
    /// Read a file from the target.
    Download { file: String },
}

impl Packet {
    /// Wire id of this packet; indexes [`PACKETS`].
    #[must_use]
    pub const fn id(&self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::Ack => 1,
            Self::CheckAlive => 2,
            Self::Exit => 3,
            Self::InvalidField { .. } => 4,
            Self::ProcessCompleted { .. } => 5,
            Self::ProcessPreexecError => 6,
            Self::ProcessRun { .. } => 7,
            Self::StatResult { .. } => 8,
            Self::Stat { .. } => 9,
            Self::ResolveResult { .. } => 10,
            Self::ResolveUser { .. } => 11,
            Self::ResolveGroup { .. } => 12,
            Self::Upload { .. } => 13,
            Self::DownloadResult { .. } => 14,
            Self::Download { .. } => 15,
        }
    }

    /// Registry name of this packet.
    #[must_use]
    pub fn name(&self) -> &'static str { PACKETS[self.id() as usize].name }

    /// Whether this packet may be sent by the controller.
    #[must_use]
    pub fn is_request(&self) -> bool {
        PACKETS[self.id() as usize].direction == Direction::Request
    }

    /// Serialize the packet to its full wire image (id + fields).
    ///
    /// Encoding the same packet twice yields identical bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::put_u32(&mut buf, self.id());
        match self {
            Self::Ok | Self::Ack | Self::CheckAlive | Self::Exit | Self::ProcessPreexecError => {}
            Self::InvalidField { field, message } => {
                codec::put_str(&mut buf, field);
                codec::put_str(&mut buf, message);
            }
            Self::ProcessCompleted {
                stdout,
                stderr,
                returncode,
            } => {
                codec::put_opt_bytes(&mut buf, stdout.as_deref());
                codec::put_opt_bytes(&mut buf, stderr.as_deref());
                codec::put_i32(&mut buf, *returncode);
            }
            Self::ProcessRun {
                command,
                stdin,
                capture_output,
                user,
                group,
                umask,
                cwd,
            } => {
                codec::put_list_str(&mut buf, command);
                codec::put_opt_bytes(&mut buf, stdin.as_deref());
                codec::put_bool(&mut buf, *capture_output);
                codec::put_opt_str(&mut buf, user.as_deref());
                codec::put_opt_str(&mut buf, group.as_deref());
                codec::put_opt_str(&mut buf, umask.as_deref());
                codec::put_opt_str(&mut buf, cwd.as_deref());
            }
            Self::StatResult {
                file_type,
                mode,
                owner,
                group,
                size,
                mtime,
                ctime,
                sha512sum,
            } => {
                codec::put_str(&mut buf, file_type);
                codec::put_u64(&mut buf, *mode);
                codec::put_str(&mut buf, owner);
                codec::put_str(&mut buf, group);
                codec::put_u64(&mut buf, *size);
                codec::put_u64(&mut buf, *mtime);
                codec::put_u64(&mut buf, *ctime);
                codec::put_opt_bytes(&mut buf, sha512sum.as_deref());
            }
            Self::Stat {
                path,
                follow_links,
                sha512sum,
            } => {
                codec::put_str(&mut buf, path);
                codec::put_bool(&mut buf, *follow_links);
                codec::put_bool(&mut buf, *sha512sum);
            }
            Self::ResolveResult { name } => codec::put_str(&mut buf, name),
            Self::ResolveUser { user } => codec::put_str(&mut buf, user),
            Self::ResolveGroup { group } => codec::put_str(&mut buf, group),
            Self::Upload {
                file,
                content,
                mode,
                owner,
                group,
            } => {
                codec::put_str(&mut buf, file);
                codec::put_bytes(&mut buf, content);
                codec::put_opt_str(&mut buf, mode.as_deref());
                codec::put_opt_str(&mut buf, owner.as_deref());
                codec::put_opt_str(&mut buf, group.as_deref());
            }
            Self::DownloadResult { content } => codec::put_bytes(&mut buf, content),
            Self::Download { file } => codec::put_str(&mut buf, file),
        }
        buf
    }

    /// Write the packet and flush the stream.
    ///
    /// # Errors
    /// Returns an error when the underlying write or flush fails.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), ProtocolError> {
        w.write_all(&self.encode()).await.map_err(WireError::Io)?;
        w.flush().await.map_err(WireError::Io)?;
        Ok(())
    }

    /// Read one packet from the stream.
    ///
    /// # Errors
    /// Returns an error on I/O failure, malformed fields, or an id outside
    /// the registry.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ProtocolError> {
        let id = codec::read_u32(r).await?;
        let packet = match id {
            0 => Self::Ok,
            1 => Self::Ack,
            2 => Self::CheckAlive,
            3 => Self::Exit,
            4 => Self::InvalidField {
                field: codec::read_string(r).await?,
                message: codec::read_string(r).await?,
            },
            5 => Self::ProcessCompleted {
                stdout: codec::read_opt_bytes(r).await?,
                stderr: codec::read_opt_bytes(r).await?,
                returncode: codec::read_i32(r).await?,
            },
            6 => Self::ProcessPreexecError,
            7 => Self::ProcessRun {
                command: codec::read_list_string(r).await?,
                stdin: codec::read_opt_bytes(r).await?,
                capture_output: codec::read_bool(r).await?,
                user: codec::read_opt_string(r).await?,
                group: codec::read_opt_string(r).await?,
                umask: codec::read_opt_string(r).await?,
                cwd: codec::read_opt_string(r).await?,
            },
            8 => Self::StatResult {
                file_type: codec::read_string(r).await?,
                mode: codec::read_u64(r).await?,
                owner: codec::read_string(r).await?,
                group: codec::read_string(r).await?,
                size: codec::read_u64(r).await?,
                mtime: codec::read_u64(r).await?,
                ctime: codec::read_u64(r).await?,
                sha512sum: codec::read_opt_bytes(r).await?,
            },
            9 => Self::Stat {
                path: codec::read_string(r).await?,
                follow_links: codec::read_bool(r).await?,
                sha512sum: codec::read_bool(r).await?,
            },
            10 => Self::ResolveResult {
                name: codec::read_string(r).await?,
            },
            11 => Self::ResolveUser {
                user: codec::read_string(r).await?,
            },
            12 => Self::ResolveGroup {
                group: codec::read_string(r).await?,
            },
            13 => Self::Upload {
                file: codec::read_string(r).await?,
                content: codec::read_bytes(r).await?,
                mode: codec::read_opt_string(r).await?,
                owner: codec::read_opt_string(r).await?,
                group: codec::read_opt_string(r).await?,
            },
            14 => Self::DownloadResult {
                content: codec::read_bytes(r).await?,
            },
            15 => Self::Download {
                file: codec::read_string(r).await?,
            },
            other => return Err(ProtocolError::UnknownPacket(other)),
        };
        Ok(packet)
    }
}
