//! Request handlers executed on the target system.
//!
//! Handlers never let OS errors escape onto the wire as raw failures: every
//! fallible input is validated up front and reported as `InvalidField` with
//! the offending field's name, and each handler produces exactly one
//! response packet.

use std::ffi::CString;
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;

use nix::sys::stat::{Mode, umask};
use nix::unistd::{Gid, Group, Uid, User, chown};
use sha2::{Digest, Sha512};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::packet::Packet;

fn invalid(field: &str, message: impl Into<String>) -> Packet {
    Packet::InvalidField {
        field: field.to_owned(),
        message: message.into(),
    }
}

/// Parse an octal mode/umask string such as `"0644"` or `"22"`.
fn parse_oct(value: &str) -> Result<u32, String> {
    u32::from_str_radix(value, 8)
        .map_err(|_| format!("Invalid value '{value}': Must be in octal format."))
}

/// Resolve a user name or decimal uid to its passwd entry.
fn lookup_user(user: &str) -> Result<User, String> {
    if let Ok(Some(entry)) = User::from_name(user) {
        return Ok(entry);
    }
    let uid = user
        .parse::<u32>()
        .map_err(|_| format!("The user with the name '{user}' does not exist."))?;
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(entry)) => Ok(entry),
        _ => Err(format!("The user with the uid '{uid}' does not exist.")),
    }
}

/// Resolve a group name or decimal gid to its group entry.
fn lookup_group(group: &str) -> Result<Group, String> {
    if let Ok(Some(entry)) = Group::from_name(group) {
        return Ok(entry);
    }
    let gid = group
        .parse::<u32>()
        .map_err(|_| format!("The group with the name '{group}' does not exist."))?;
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(entry)) => Ok(entry),
        _ => Err(format!("The group with the gid '{gid}' does not exist.")),
    }
}

/// Fields of a `ProcessRun` request.
pub(super) struct RunRequest {
    pub command: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub capture_output: bool,
    pub user: Option<String>,
    pub group: Option<String>,
    pub umask: Option<String>,
    pub cwd: Option<String>,
}

/// Run a command, optionally switching credentials and working directory.
///
/// Validation order is umask, user, group, cwd; the first failure answers
/// `InvalidField` and nothing is forked. The pre-exec hook applies umask,
/// `setresgid`, `setresuid`, and `chdir` in that order. Spawn failures for a
/// missing executable answer `InvalidField("command")`; failures raised from
/// the pre-exec hook answer `ProcessPreexecError`.
pub(super) async fn process_run(req: RunRequest) -> Packet {
    let mut umask_mode: libc::mode_t = 0o077;
    if let Some(value) = &req.umask {
        match parse_oct(value) {
            Ok(mode) => umask_mode = mode as libc::mode_t,
            Err(message) => return invalid("umask", message),
        }
    }

    let mut uid = None;
    let mut gid = None;
    if let Some(user) = &req.user {
        match lookup_user(user) {
            Ok(entry) => {
                uid = Some(entry.uid.as_raw());
                gid = Some(entry.gid.as_raw());
            }
            Err(message) => return invalid("user", message),
        }
    }
    if let Some(group) = &req.group {
        match lookup_group(group) {
            Ok(entry) => gid = Some(entry.gid.as_raw()),
            Err(message) => return invalid("group", message),
        }
    }

    let cwd = match &req.cwd {
        Some(cwd) => {
            if !Path::new(cwd).is_dir() {
                return invalid("cwd", "Requested working directory does not exist");
            }
            match CString::new(cwd.as_bytes()) {
                Ok(c) => Some(c),
                Err(_) => return invalid("cwd", "Requested working directory is not a valid path"),
            }
        }
        None => None,
    };

    let Some((program, args)) = req.command.split_first() else {
        return invalid("command", "Command must not be empty");
    };

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(if req.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    if req.capture_output {
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
    } else {
        // stdout belongs to the packet stream and must never be inherited.
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::inherit());
    }

    unsafe {
        cmd.pre_exec(move || {
            libc::umask(umask_mode);
            if let Some(gid) = gid {
                if libc::setresgid(gid, gid, gid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if let Some(uid) = uid {
                if libc::setresuid(uid, uid, uid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if let Some(dir) = &cwd {
                if libc::chdir(dir.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return invalid("command", format!("{program}: {err}"));
        }
        Err(err) => {
            debug!(%err, "pre-exec failed");
            return Packet::ProcessPreexecError;
        }
    };

    if let Some(input) = &req.stdin {
        if let Some(mut pipe) = child.stdin.take() {
            // A child that exits without draining stdin is not an error.
            if let Err(err) = pipe.write_all(input).await {
                debug!(%err, "short write to child stdin");
            }
        }
    }

    let returncode = |status: std::process::ExitStatus| {
        status
            .code()
            .unwrap_or_else(|| -status.signal().unwrap_or(0))
    };

    if req.capture_output {
        match child.wait_with_output().await {
            Ok(output) => Packet::ProcessCompleted {
                stdout: Some(output.stdout),
                stderr: Some(output.stderr),
                returncode: returncode(output.status),
            },
            Err(err) => invalid("command", err.to_string()),
        }
    } else {
        match child.wait().await {
            Ok(status) => Packet::ProcessCompleted {
                stdout: None,
                stderr: None,
                returncode: returncode(status),
            },
            Err(err) => invalid("command", err.to_string()),
        }
    }
}

/// Stat a path, optionally following links and hashing regular files.
pub(super) async fn stat(path: &str, follow_links: bool, sha512sum: bool) -> Packet {
    let metadata = if follow_links {
        tokio::fs::metadata(path).await
    } else {
        tokio::fs::symlink_metadata(path).await
    };
    let Ok(metadata) = metadata else {
        return invalid("path", "Path doesn't exist");
    };

    let ft = metadata.file_type();
    let file_type = if ft.is_dir() {
        "dir"
    } else if ft.is_char_device() {
        "chr"
    } else if ft.is_block_device() {
        "blk"
    } else if ft.is_file() {
        "file"
    } else if ft.is_fifo() {
        "fifo"
    } else if ft.is_symlink() {
        "link"
    } else if ft.is_socket() {
        "sock"
    } else {
        "other"
    };

    let owner = match User::from_uid(Uid::from_raw(metadata.uid())) {
        Ok(Some(entry)) => entry.name,
        _ => metadata.uid().to_string(),
    };
    let group = match Group::from_gid(Gid::from_raw(metadata.gid())) {
        Ok(Some(entry)) => entry.name,
        _ => metadata.gid().to_string(),
    };

    let sha512sum = if sha512sum && file_type == "file" {
        match tokio::fs::read(path).await {
            Ok(content) => Some(Sha512::digest(&content).to_vec()),
            Err(err) => return invalid("path", err.to_string()),
        }
    } else {
        None
    };

    let nanos = |secs: i64, nsec: i64| {
        u64::try_from(i128::from(secs) * 1_000_000_000 + i128::from(nsec)).unwrap_or(0)
    };

    Packet::StatResult {
        file_type: file_type.to_owned(),
        mode: u64::from(metadata.mode() & 0o7777),
        owner,
        group,
        size: metadata.size(),
        mtime: nanos(metadata.mtime(), metadata.mtime_nsec()),
        ctime: nanos(metadata.ctime(), metadata.ctime_nsec()),
        sha512sum,
    }
}

/// Canonicalize a user name or uid.
pub(super) fn resolve_user(user: &str) -> Packet {
    match lookup_user(user) {
        Ok(entry) => Packet::ResolveResult { name: entry.name },
        Err(_) => invalid("user", "The user does not exist"),
    }
}

/// Canonicalize a group name or gid.
pub(super) fn resolve_group(group: &str) -> Packet {
    match lookup_group(group) {
        Ok(entry) => Packet::ResolveResult { name: entry.name },
        Err(_) => invalid("group", "The group does not exist"),
    }
}

/// Save content as a file, then apply mode and ownership.
///
/// The mode (default `0600`) is always applied; ownership only when at least
/// one of owner/group was requested. The umask is relaxed to `0o022` around
/// the write and restored to the dispatcher's `0o077` afterwards.
pub(super) async fn upload(
    file: &str,
    content: &[u8],
    mode: Option<&str>,
    owner: Option<&str>,
    group: Option<&str>,
) -> Packet {
    let mut mode_bits = 0o600;
    if let Some(value) = mode {
        match parse_oct(value) {
            Ok(bits) => mode_bits = bits,
            Err(message) => return invalid("mode", message),
        }
    }

    let mut uid = None;
    let mut gid = None;
    if let Some(owner) = owner {
        match lookup_user(owner) {
            Ok(entry) => {
                uid = Some(entry.uid);
                gid = Some(entry.gid);
            }
            Err(message) => return invalid("owner", message),
        }
    }
    if let Some(group) = group {
        match lookup_group(group) {
            Ok(entry) => gid = Some(entry.gid),
            Err(message) => return invalid("group", message),
        }
    }

    umask(Mode::from_bits_truncate(0o022));
    let result = write_file(file, content, mode_bits, uid, gid).await;
    umask(Mode::from_bits_truncate(0o077));

    match result {
        Ok(()) => Packet::Ok,
        Err(err) => invalid("file", err.to_string()),
    }
}

async fn write_file(
    file: &str,
    content: &[u8],
    mode_bits: u32,
    uid: Option<Uid>,
    gid: Option<Gid>,
) -> std::io::Result<()> {
    tokio::fs::write(file, content).await?;
    tokio::fs::set_permissions(file, std::fs::Permissions::from_mode(mode_bits)).await?;
    if uid.is_some() || gid.is_some() {
        chown(
            Path::new(file),
            Some(uid.unwrap_or(Uid::from_raw(0))),
            Some(gid.unwrap_or(Gid::from_raw(0))),
        )?;
    }
    Ok(())
}

/// Read a file's content.
pub(super) async fn download(file: &str) -> Packet {
    match tokio::fs::read(file).await {
        Ok(content) => Packet::DownloadResult { content },
        Err(err) => invalid("file", err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("0644", 0o644)]
    #[case("644", 0o644)]
    #[case("22", 0o022)]
    #[case("7777", 0o7777)]
    fn octal_strings_parse(#[case] input: &str, #[case] expected: u32) {
        assert_eq!(parse_oct(input).unwrap(), expected);
    }

    #[rstest]
    #[case("rwxr-xr-x")]
    #[case("0o644")]
    #[case("9")]
    fn malformed_octal_strings_are_rejected(#[case] input: &str) {
        assert!(parse_oct(input).is_err());
    }

    #[tokio::test]
    async fn run_with_unknown_user_never_executes() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("touched");
        let response = process_run(RunRequest {
            command: vec![
                "/bin/sh".to_owned(),
                "-c".to_owned(),
                format!("touch {}", marker.display()),
            ],
            stdin: None,
            capture_output: true,
            user: Some("no_such_user_9999".to_owned()),
            group: None,
            umask: None,
            cwd: None,
        })
        .await;
        assert!(
            matches!(&response, Packet::InvalidField { field, message }
                if field == "user" && message.contains("does not exist")),
            "{response:?}"
        );
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn run_with_missing_cwd_is_invalid() {
        let response = process_run(RunRequest {
            command: vec!["true".to_owned()],
            stdin: None,
            capture_output: true,
            user: None,
            group: None,
            umask: None,
            cwd: Some("/definitely/not/a/dir".to_owned()),
        })
        .await;
        assert!(matches!(&response, Packet::InvalidField { field, .. } if field == "cwd"));
    }

    #[tokio::test]
    async fn run_captures_output_and_status() {
        let response = process_run(RunRequest {
            command: vec!["/bin/sh".to_owned(), "-c".to_owned(), "echo out; echo err >&2; exit 7".to_owned()],
            stdin: None,
            capture_output: true,
            user: None,
            group: None,
            umask: None,
            cwd: None,
        })
        .await;
        let Packet::ProcessCompleted {
            stdout,
            stderr,
            returncode,
        } = response
        else {
            panic!("unexpected response: {response:?}");
        };
        assert_eq!(stdout.as_deref(), Some(&b"out\n"[..]));
        assert_eq!(stderr.as_deref(), Some(&b"err\n"[..]));
        assert_eq!(returncode, 7);
    }

    #[tokio::test]
    async fn run_forwards_stdin() {
        let response = process_run(RunRequest {
            command: vec!["cat".to_owned()],
            stdin: Some(b"ping".to_vec()),
            capture_output: true,
            user: None,
            group: None,
            umask: None,
            cwd: None,
        })
        .await;
        let Packet::ProcessCompleted { stdout, .. } = response else {
            panic!("unexpected response: {response:?}");
        };
        assert_eq!(stdout.as_deref(), Some(&b"ping"[..]));
    }

    #[tokio::test]
    async fn run_with_missing_executable_is_invalid_command() {
        let response = process_run(RunRequest {
            command: vec!["/no/such/binary_9999".to_owned()],
            stdin: None,
            capture_output: true,
            user: None,
            group: None,
            umask: None,
            cwd: None,
        })
        .await;
        assert!(matches!(&response, Packet::InvalidField { field, .. } if field == "command"));
    }

    #[tokio::test]
    async fn stat_reports_missing_path() {
        let response = stat("/nope", false, false).await;
        assert!(
            matches!(&response, Packet::InvalidField { field, message }
                if field == "path" && message == "Path doesn't exist")
        );
    }

    #[tokio::test]
    async fn stat_hashes_regular_files_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t");
        tokio::fs::write(&path, b"hello").await.unwrap();
        let response = stat(path.to_str().unwrap(), false, true).await;
        let Packet::StatResult {
            file_type,
            size,
            sha512sum,
            ..
        } = response
        else {
            panic!("unexpected response: {response:?}");
        };
        assert_eq!(file_type, "file");
        assert_eq!(size, 5);
        assert_eq!(sha512sum.unwrap(), Sha512::digest(b"hello").to_vec());
    }

    #[tokio::test]
    async fn stat_directories_have_no_hash() {
        let dir = tempfile::tempdir().unwrap();
        let response = stat(dir.path().to_str().unwrap(), false, true).await;
        let Packet::StatResult {
            file_type,
            sha512sum,
            ..
        } = response
        else {
            panic!("unexpected response: {response:?}");
        };
        assert_eq!(file_type, "dir");
        assert!(sha512sum.is_none());
    }

    #[tokio::test]
    async fn upload_applies_requested_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uploaded");
        let file = path.to_str().unwrap();
        let response = upload(file, b"hello", Some("0644"), None, None).await;
        assert_eq!(response, Packet::Ok);
        let metadata = tokio::fs::metadata(&path).await.unwrap();
        assert_eq!(metadata.mode() & 0o7777, 0o644);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn upload_defaults_to_0600() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private");
        let response = upload(path.to_str().unwrap(), b"x", None, None, None).await;
        assert_eq!(response, Packet::Ok);
        let metadata = tokio::fs::metadata(&path).await.unwrap();
        assert_eq!(metadata.mode() & 0o7777, 0o600);
    }

    #[tokio::test]
    async fn upload_rejects_bad_mode() {
        let response = upload("/tmp/never-written", b"x", Some("rw-"), None, None).await;
        assert!(matches!(&response, Packet::InvalidField { field, .. } if field == "mode"));
    }

    #[tokio::test]
    async fn download_round_trips_upload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let file = path.to_str().unwrap();
        assert_eq!(upload(file, b"\x00\x01payload", None, None, None).await, Packet::Ok);
        let response = download(file).await;
        assert_eq!(
            response,
            Packet::DownloadResult {
                content: b"\x00\x01payload".to_vec()
            }
        );
    }

    #[test]
    fn groups_resolve_by_gid_string() {
        let root = lookup_group("0").unwrap();
        assert_eq!(root.gid.as_raw(), 0);
    }
}
