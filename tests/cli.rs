//! Full-binary tests: `bosun run` over a `local://` inventory.

mod common;

use std::path::Path;
use std::process::{Command, Output};

fn write(path: &Path, text: &str) {
    std::fs::write(path, text).unwrap();
}

fn run_bosun(cwd: &Path, args: &[&str]) -> Output {
    Command::new(common::bosun_exe())
        .arg("run")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("run bosun")
}

struct Site {
    dir: tempfile::TempDir,
    target: std::path::PathBuf,
}

/// A one-host local inventory plus a two-operation script under a tempdir.
fn site() -> Site {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("managed");
    write(
        &dir.path().join("inventory.toml"),
        "[hosts.box]\nurl = \"local://localhost\"\n",
    );
    write(
        &dir.path().join("script.toml"),
        &format!(
            r#"
            [[task]]
            id = "dirs"

            [[task.op]]
            directory = {{ path = "{0}", mode = "755" }}

            [[task.op]]
            file = {{ dst = "{0}/state", content = "ok\n", mode = "644" }}
            "#,
            target.display()
        ),
    );
    Site { dir, target }
}

#[test]
fn version_prints_and_exits_zero() {
    let output = Command::new(common::bosun_exe())
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("bosun"));
}

#[test]
fn missing_script_argument_is_a_usage_error() {
    let output = Command::new(common::bosun_exe())
        .args(["run", "only-one-arg"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn unknown_host_selection_is_a_usage_error() {
    let site = site();
    let output = run_bosun(
        site.dir.path(),
        &["-H", "ghost", "inventory.toml", "script.toml"],
    );
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("ghost"));
}

#[test]
fn run_converges_and_is_idempotent() {
    let site = site();

    let first = run_bosun(site.dir.path(), &["inventory.toml", "script.toml"]);
    assert_eq!(first.status.code(), Some(0), "{first:?}");
    assert!(site.target.is_dir());
    assert_eq!(
        std::fs::read_to_string(site.target.join("state")).unwrap(),
        "ok\n"
    );
    let stdout = String::from_utf8_lossy(&first.stdout);
    assert!(stdout.contains("host box: 2 changed"), "{stdout}");

    let second = run_bosun(site.dir.path(), &["inventory.toml", "script.toml"]);
    assert_eq!(second.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&second.stdout);
    assert!(stdout.contains("host box: 0 changed, 2 unchanged"), "{stdout}");
}

#[test]
fn dry_run_reports_changes_without_applying_them() {
    let site = site();
    let output = run_bosun(site.dir.path(), &["--dry", "inventory.toml", "script.toml"]);
    assert_eq!(output.status.code(), Some(0), "{output:?}");
    assert!(!site.target.exists(), "dry-run must not create anything");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("host box: 2 changed"), "{stdout}");
    assert!(stdout.contains("dry-run"), "{stdout}");
}
