//! Operation-level behaviour over a real local dispatcher: idempotence,
//! dry-run purity, and failure isolation.

mod common;

use bosun::connector::Connector;
use bosun::ops::OpSpec;
use bosun::script::{self, Script};
use bosun::transaction::Outcome;

fn op(toml: &str) -> OpSpec {
    toml::from_str(toml).expect("op spec")
}

#[tokio::test]
async fn directory_create_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("managed");
    let spec = op(&format!(
        "directory = {{ path = \"{}\", mode = \"750\" }}",
        target.display()
    ));

    let mut ctx = common::local_context(false).await;
    assert_eq!(spec.apply(&mut ctx).await.unwrap(), Outcome::Changed);
    assert!(target.is_dir());
    let mode = std::os::unix::fs::MetadataExt::mode(&std::fs::metadata(&target).unwrap());
    assert_eq!(mode & 0o7777, 0o750);

    assert_eq!(spec.apply(&mut ctx).await.unwrap(), Outcome::Unchanged);
    ctx.connector.close().await.unwrap();
}

#[tokio::test]
async fn directory_dry_run_probes_but_does_not_create() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("never-created");
    let spec = op(&format!("directory = {{ path = \"{}\" }}", target.display()));

    let mut ctx = common::local_context(true).await;
    assert_eq!(spec.apply(&mut ctx).await.unwrap(), Outcome::Changed);
    assert!(!target.exists(), "dry-run must not mutate");

    let reports = ctx.reporter.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].simulated);
    ctx.connector.close().await.unwrap();
}

#[tokio::test]
async fn file_content_converges_and_heals_drift() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("motd");
    let spec = op(&format!(
        "file = {{ dst = \"{}\", content = \"hello\\n\", mode = \"644\" }}",
        target.display()
    ));

    let mut ctx = common::local_context(false).await;
    assert_eq!(spec.apply(&mut ctx).await.unwrap(), Outcome::Changed);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello\n");
    assert_eq!(spec.apply(&mut ctx).await.unwrap(), Outcome::Unchanged);

    // External drift is healed on the next run.
    std::fs::write(&target, "tampered").unwrap();
    assert_eq!(spec.apply(&mut ctx).await.unwrap(), Outcome::Changed);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello\n");
    ctx.connector.close().await.unwrap();
}

#[tokio::test]
async fn template_renders_host_variables() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("motd.j2");
    std::fs::write(&src, "managed host {{ host_id }}\n").unwrap();
    let target = dir.path().join("motd");
    let spec = op(&format!(
        "template = {{ src = \"{}\", dst = \"{}\" }}",
        src.display(),
        target.display()
    ));

    let mut ctx = common::local_context(false).await;
    assert_eq!(spec.apply(&mut ctx).await.unwrap(), Outcome::Changed);
    assert_eq!(
        std::fs::read_to_string(&target).unwrap(),
        "managed host local://localhost\n"
    );
    assert_eq!(spec.apply(&mut ctx).await.unwrap(), Outcome::Unchanged);
    ctx.connector.close().await.unwrap();
}

#[tokio::test]
async fn template_with_undefined_variable_fails_locally() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("bad.j2");
    std::fs::write(&src, "{{ no_such_var }}").unwrap();
    let target = dir.path().join("out");
    let spec = op(&format!(
        "template = {{ src = \"{}\", dst = \"{}\" }}",
        src.display(),
        target.display()
    ));

    let mut ctx = common::local_context(false).await;
    // The transaction fails; the host worker survives.
    assert_eq!(spec.apply(&mut ctx).await.unwrap(), Outcome::Failed);
    assert!(!target.exists());
    ctx.connector.close().await.unwrap();
}

#[tokio::test]
async fn script_execution_is_idempotent_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let conf_dir = dir.path().join("etc");
    let conf_file = conf_dir.join("app.conf");
    let text = format!(
        r#"
        [[task]]
        id = "app"
        description = "Configure the app"
        defaults = {{ file_mode = "640", dir_mode = "750" }}

        [[task.op]]
        directory = {{ path = "{}" }}

        [[task.op]]
        file = {{ dst = "{}", content = "managed\n" }}
        "#,
        conf_dir.display(),
        conf_file.display()
    );
    let script_path = dir.path().join("script.toml");
    std::fs::write(&script_path, &text).unwrap();
    let script = Script::load(script_path.to_str().unwrap()).unwrap();

    let mut ctx = common::local_context(false).await;
    script::execute(&mut ctx, &script).await.unwrap();
    assert!(conf_dir.is_dir());
    assert_eq!(std::fs::read_to_string(&conf_file).unwrap(), "managed\n");
    let first: Vec<_> = ctx.reporter.reports();
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|r| r.outcome == Outcome::Changed));

    script::execute(&mut ctx, &script).await.unwrap();
    let second = ctx.reporter.reports();
    assert_eq!(second.len(), 4);
    assert!(
        second[2..].iter().all(|r| r.outcome == Outcome::Unchanged),
        "second run must change nothing"
    );
    ctx.connector.close().await.unwrap();
}
