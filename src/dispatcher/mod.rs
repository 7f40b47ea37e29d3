//! The remote dispatcher.
//!
//! A self-contained request loop launched on the target host (or locally for
//! `local://` transports). It reads requests from stdin, executes them
//! against the local system, and writes responses to stdout; diagnostics go
//! to stderr only, because stdout is the packet stream. The dispatcher owns
//! no persistent state and handles exactly one request at a time.

mod handlers;

use nix::sys::stat::{Mode, umask};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tracing::{debug, error};

use crate::packet::{Packet, ProtocolError};

/// Exit code used when the packet stream is corrupt or out of protocol.
pub const EXIT_PROTOCOL_ERROR: i32 = 3;

/// Handle requests until [`Packet::Exit`] arrives.
///
/// Every request other than `Exit` is answered with exactly one response
/// packet. A response-only packet or an unknown id on the request stream is
/// a protocol error and tears the loop down.
///
/// # Errors
/// Returns an error on I/O failure or protocol violation; the caller maps
/// this to exit code [`EXIT_PROTOCOL_ERROR`].
pub async fn serve<R, W>(reader: &mut R, writer: &mut W) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let request = Packet::read_from(reader).await?;
        debug!(packet = request.name(), "received request");
        let response = match request {
            Packet::CheckAlive => Packet::Ack,
            Packet::Exit => return Ok(()),
            Packet::ProcessRun {
                command,
                stdin,
                capture_output,
                user,
                group,
                umask,
                cwd,
            } => {
                handlers::process_run(handlers::RunRequest {
                    command,
                    stdin,
                    capture_output,
                    user,
                    group,
                    umask,
                    cwd,
                })
                .await
            }
            Packet::Stat {
                path,
                follow_links,
                sha512sum,
            } => handlers::stat(&path, follow_links, sha512sum).await,
            Packet::ResolveUser { user } => handlers::resolve_user(&user),
            Packet::ResolveGroup { group } => handlers::resolve_group(&group),
            Packet::Upload {
                file,
                content,
                mode,
                owner,
                group,
            } => handlers::upload(&file, &content, mode.as_deref(), owner.as_deref(), group.as_deref()).await,
            Packet::Download { file } => handlers::download(&file).await,
            other => return Err(ProtocolError::ResponseAsRequest(other.name())),
        };
        debug!(packet = response.name(), "sending response");
        response.write_to(writer).await?;
    }
}

/// Dispatcher entry point: serve stdin/stdout until exit or a fatal error.
///
/// Returns the process exit code. The process umask is pinned to `0o077` on
/// entry; individual handlers relax it only within their own scope.
pub async fn run() -> i32 {
    umask(Mode::from_bits_truncate(0o077));

    let mut reader = BufReader::new(tokio::io::stdin());
    let mut writer = BufWriter::new(tokio::io::stdout());
    match serve(&mut reader, &mut writer).await {
        Ok(()) => 0,
        Err(err) => {
            error!("{err}. Aborting.");
            EXIT_PROTOCOL_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drive(input: &[Packet]) -> Result<Vec<Packet>, ProtocolError> {
        let mut stream = Vec::new();
        for packet in input {
            stream.extend_from_slice(&packet.encode());
        }
        let mut reader = &stream[..];
        let mut out = Vec::new();
        serve(&mut reader, &mut out).await?;
        let mut responses = Vec::new();
        let mut r = &out[..];
        while !r.is_empty() {
            responses.push(Packet::read_from(&mut r).await?);
        }
        Ok(responses)
    }

    #[tokio::test]
    async fn check_alive_is_acknowledged() {
        let responses = drive(&[Packet::CheckAlive, Packet::Exit]).await.unwrap();
        assert_eq!(responses, vec![Packet::Ack]);
    }

    #[tokio::test]
    async fn exit_produces_no_response() {
        let responses = drive(&[Packet::Exit]).await.unwrap();
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn every_request_gets_exactly_one_response() {
        let responses = drive(&[
            Packet::CheckAlive,
            Packet::Stat {
                path: "/definitely/not/here".to_owned(),
                follow_links: false,
                sha512sum: false,
            },
            Packet::ResolveUser {
                user: "0".to_owned(),
            },
            Packet::Exit,
        ])
        .await
        .unwrap();
        assert_eq!(responses.len(), 3);
    }

    #[tokio::test]
    async fn response_packet_on_request_stream_is_fatal() {
        let err = drive(&[Packet::Ack]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ResponseAsRequest("Ack")));
    }

    #[tokio::test]
    async fn eof_without_exit_is_fatal() {
        let err = drive(&[]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Wire(_)));
    }
}
