#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use repoforge::Error;
use repoforge::pm::{CmdPm, PackageManager};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    let mut perms = fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod script");
    path
}

#[test]
fn confirmation_prompt_is_answered_with_the_default() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let log = tmp.path().join("answers.log");
    let script = write_script(
        tmp.path(),
        "pm",
        &format!(
            r#"printf ':: Proceed with installation? [Y/n] '
read ans
printf 'got:%s\n' "$ans" >> {log}
exit 0
"#,
            log = log.display()
        ),
    );

    let pm = CmdPm::new(script.to_string_lossy().into_owned(), false);
    pm.install_remote(&["curl".into()]).expect("install ok");

    // An empty line means the default was taken.
    assert_eq!(fs::read_to_string(&log).expect("read log"), "got:\n");
}

#[test]
fn conflict_failure_reports_the_conflicting_package() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        tmp.path(),
        "pm",
        r#"printf ':: foo and bar are in conflict. Remove bar? [y/N] '
read ans
echo "error: unresolvable conflicts" >&2
exit 1
"#,
    );

    let pm = CmdPm::new(script.to_string_lossy().into_owned(), false);
    let err = pm
        .install_files(&[PathBuf::from("foo-1-1-x86_64.pkg.tar.zst")])
        .expect_err("install must fail");

    match err {
        Error::Install { msg, conflicts } => {
            assert_eq!(conflicts, ["bar"]);
            assert!(msg.contains("unresolvable conflicts"), "msg: {msg}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn orphan_query_parses_names_and_tolerates_empty_result() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        tmp.path(),
        "pm",
        r#"if [ "$1" = "-Qdtq" ]; then
  printf 'orphan-one\norphan-two\n'
  exit 0
fi
exit 1
"#,
    );
    let pm = CmdPm::new(script.to_string_lossy().into_owned(), false);
    assert_eq!(pm.orphans().expect("orphans"), ["orphan-one", "orphan-two"]);

    // pacman exits non-zero when nothing is orphaned; that is not an error.
    let empty = write_script(tmp.path(), "pm-empty", "exit 1\n");
    let pm = CmdPm::new(empty.to_string_lossy().into_owned(), false);
    assert!(pm.orphans().expect("no orphans").is_empty());
}

#[test]
fn dry_run_executes_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let marker = tmp.path().join("ran");
    let script = write_script(
        tmp.path(),
        "pm",
        &format!("touch {}\nexit 0\n", marker.display()),
    );

    let pm = CmdPm::new(script.to_string_lossy().into_owned(), true);
    pm.sync().expect("dry-run sync");
    pm.remove(&["foo".into()], false).expect("dry-run remove");
    assert!(!marker.exists(), "dry-run must not spawn the tool");
}
