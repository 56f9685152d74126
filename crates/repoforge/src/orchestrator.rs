use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::pm::PackageManager;
use crate::recipe::RecipeRecord;
use crate::resolver::{InstallSet, Resolver};

/// Force rebuild, clean up after.
const BUILD_ARGS: &[&str] = &["-f", "-c"];

/// How one recipe left the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// All declared artifacts already present and non-empty.
    Skipped,
    /// Recipe does not support the host architecture.
    ArchSkip,
    Built,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub built: usize,
    pub skipped: usize,
    pub arch_skipped: usize,
}

/// Drives each recipe through
/// `Pending -> Skip | (ResolvingDeps -> Installing -> Building -> Verifying -> Done)`.
/// Any failing step aborts the whole run; recipes are processed strictly
/// one at a time, in the order supplied.
pub struct Orchestrator<'a> {
    settings: &'a Settings,
    target_dir: PathBuf,
    resolver: Resolver,
    pm: Box<dyn PackageManager>,
    verify_mode: bool,
    dry_run: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        settings: &'a Settings,
        target_dir: PathBuf,
        resolver: Resolver,
        pm: Box<dyn PackageManager>,
        verify_mode: bool,
        dry_run: bool,
    ) -> Self {
        Self {
            settings,
            target_dir,
            resolver,
            pm,
            verify_mode,
            dry_run,
        }
    }

    pub fn run_batch(&mut self, records: &[RecipeRecord]) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        for rec in records {
            match self.process(rec)? {
                Outcome::Built => summary.built += 1,
                Outcome::Skipped => summary.skipped += 1,
                Outcome::ArchSkip => summary.arch_skipped += 1,
            }
        }
        if self.verify_mode {
            self.remove_orphans()?;
        }
        Ok(summary)
    }

    pub fn process(&mut self, rec: &RecipeRecord) -> Result<Outcome> {
        let recipe = rec.path.display().to_string();

        if !rec.supported_on(&self.settings.pkg.arch) {
            warn!(
                recipe,
                host_arch = %self.settings.pkg.arch,
                "unsupported architecture, skipping"
            );
            return Ok(Outcome::ArchSkip);
        }

        if self.all_artifacts_present(rec) {
            info!(recipe, "all artifacts present, skipping");
            return Ok(Outcome::Skipped);
        }

        // A failed rebuild must never be mistaken for success later on.
        self.evict_stale_artifacts(rec)?;

        if self.verify_mode {
            self.remove_orphans()?;
        }

        let set = self.resolver.install_set(rec)?;
        self.install_deps(&set)?;
        self.build(rec)?;
        self.verify(rec)?;

        info!(recipe, "built and verified");
        Ok(Outcome::Built)
    }

    fn artifact_path(&self, rec: &RecipeRecord, pkg: &str) -> PathBuf {
        self.target_dir.join(rec.artifact_name(
            pkg,
            &self.settings.pkg.arch,
            &self.settings.pkg.extension,
        ))
    }

    fn debug_artifact_path(&self, rec: &RecipeRecord, pkg: &str) -> PathBuf {
        self.target_dir.join(rec.debug_artifact_name(
            pkg,
            &self.settings.pkg.arch,
            &self.settings.pkg.extension,
        ))
    }

    fn all_artifacts_present(&self, rec: &RecipeRecord) -> bool {
        rec.names.iter().all(|pkg| {
            fs::metadata(self.artifact_path(rec, pkg))
                .map(|m| m.len() > 0)
                .unwrap_or(false)
        })
    }

    fn evict_stale_artifacts(&self, rec: &RecipeRecord) -> Result<()> {
        for pkg in &rec.names {
            for path in [
                self.artifact_path(rec, pkg),
                self.debug_artifact_path(rec, pkg),
            ] {
                remove_if_exists(&sig_path(&path))?;
                remove_if_exists(&path)?;
            }
        }
        Ok(())
    }

    fn install_deps(&self, set: &InstallSet) -> Result<()> {
        if !set.local.is_empty() {
            let files: Vec<PathBuf> = set.local.iter().map(|d| d.artifact.clone()).collect();
            self.install_with_retry(|| self.pm.install_files(&files))?;
        }
        if !set.external.is_empty() {
            self.install_with_retry(|| self.pm.install_remote(&set.external))?;
        }
        Ok(())
    }

    /// On a conflicting install, remove the conflicting packages (with their
    /// reverse-dependents) and retry exactly once; the second failure is
    /// fatal.
    fn install_with_retry<F: Fn() -> Result<()>>(&self, attempt: F) -> Result<()> {
        match attempt() {
            Err(Error::Install { msg, conflicts }) if !conflicts.is_empty() => {
                warn!(
                    conflicts = conflicts.join(", "),
                    msg, "install conflict, removing and retrying once"
                );
                self.pm.remove(&conflicts, true)?;
                attempt()
            }
            other => other,
        }
    }

    fn build(&self, rec: &RecipeRecord) -> Result<()> {
        let mut cmd = Command::new(&self.settings.tools.build_tool);
        cmd.args(BUILD_ARGS)
            .current_dir(&rec.path)
            .env("PKGDEST", &self.target_dir);
        if let Some(dir) = &self.settings.pkg.build_dir {
            cmd.env("BUILDDIR", dir);
        }
        if let Some(dir) = &self.settings.pkg.source_dir {
            cmd.env("SRCDEST", dir);
        }

        if self.dry_run {
            info!("DRY-RUN: {:?}", cmd);
            return Ok(());
        }

        run_as_user(&mut cmd, &self.settings.host.build_user)?;
        let mut child = cmd.spawn().map_err(|e| {
            Error::BuildExecution(format!(
                "cannot spawn {}: {e}",
                self.settings.tools.build_tool
            ))
        })?;

        // Interrupt/quit requests are queued, not delivered, while the build
        // child is outstanding; they land once the guard is dropped, so the
        // child is always reaped and its exit status inspected.
        let status = {
            let _guard = SignalGuard::defer_interrupts();
            child
                .wait()
                .map_err(|e| Error::BuildExecution(format!("wait failed: {e}")))?
        };

        if !status.success() {
            return Err(Error::BuildExecution(format!(
                "{} exited with {status} in {}",
                self.settings.tools.build_tool,
                rec.path.display()
            )));
        }
        Ok(())
    }

    fn verify(&self, rec: &RecipeRecord) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        for pkg in &rec.names {
            let path = self.artifact_path(rec, pkg);
            let non_empty = fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
            if !non_empty {
                return Err(Error::BuildVerification(format!(
                    "expected artifact {} is missing or empty",
                    path.display()
                )));
            }

            if let Some(hook) = &self.settings.host.verify_hook {
                self.run_verify_hook(hook, &path)?;
            }

            if self.settings.option_enabled("sign") {
                let sig = sig_path(&path);
                if !sig.is_file() {
                    remove_if_exists(&path)?;
                    return Err(Error::BuildVerification(format!(
                        "missing detached signature {}",
                        sig.display()
                    )));
                }
            }
        }
        Ok(())
    }

    fn run_verify_hook(&self, hook: &str, artifact: &Path) -> Result<()> {
        let mut parts = hook.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(Error::Config("host.verify_hook is empty".into()));
        };
        let mut cmd = Command::new(program);
        cmd.args(parts).arg(artifact);
        run_as_user(&mut cmd, &self.settings.host.build_user)?;

        let status = cmd.status().map_err(|e| {
            Error::BuildVerification(format!("cannot run verify hook {program}: {e}"))
        })?;
        if !status.success() {
            remove_if_exists(artifact)?;
            return Err(Error::BuildVerification(format!(
                "verify hook rejected {} ({status})",
                artifact.display()
            )));
        }
        Ok(())
    }

    /// Verify mode: drop automatically-installed packages nothing depends on
    /// anymore, so a recipe that only built thanks to a coincidentally
    /// installed package fails loudly. Removal can orphan further packages,
    /// hence the loop.
    fn remove_orphans(&self) -> Result<()> {
        let mut last: Option<Vec<String>> = None;
        loop {
            let mut orphans = self.pm.orphans()?;
            orphans.retain(|o| !self.settings.host.keep.contains(o));
            if orphans.is_empty() {
                return Ok(());
            }
            if last.as_deref() == Some(&orphans[..]) {
                return Err(Error::install(format!(
                    "orphan removal made no progress: {}",
                    orphans.join(", ")
                )));
            }
            info!(orphans = orphans.join(", "), "removing orphan dependencies");
            self.pm.remove(&orphans, false)?;
            last = Some(orphans);
        }
    }
}

fn sig_path(artifact: &Path) -> PathBuf {
    let mut s = artifact.as_os_str().to_os_string();
    s.push(".sig");
    PathBuf::from(s)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Run-as-user primitive: permanently drop privileges inside the child
/// before its program starts. Only meaningful when the parent holds root;
/// otherwise the build already runs unprivileged.
#[cfg(unix)]
fn run_as_user(cmd: &mut Command, user: &str) -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        return Ok(());
    }
    let account = users::get_user_by_name(user)
        .ok_or_else(|| Error::Config(format!("build user '{user}' does not exist")))?;
    let uid = account.uid();
    let gid = account.primary_group_id();

    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(move || {
            if libc::setgroups(0, std::ptr::null()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setgid(gid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setuid(uid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn run_as_user(_cmd: &mut Command, _user: &str) -> Result<()> {
    Ok(())
}

/// Blocks SIGINT/SIGQUIT for the calling thread; pending signals are
/// delivered when the guard drops.
#[cfg(unix)]
struct SignalGuard {
    old: libc::sigset_t,
}

#[cfg(unix)]
impl SignalGuard {
    fn defer_interrupts() -> Self {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGINT);
            libc::sigaddset(&mut set, libc::SIGQUIT);
            let mut old: libc::sigset_t = std::mem::zeroed();
            libc::sigprocmask(libc::SIG_BLOCK, &set, &mut old);
            Self { old }
        }
    }
}

#[cfg(unix)]
impl Drop for SignalGuard {
    fn drop(&mut self) {
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut());
        }
    }
}

#[cfg(not(unix))]
struct SignalGuard;

#[cfg(not(unix))]
impl SignalGuard {
    fn defer_interrupts() -> Self {
        SignalGuard
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::rc::Rc;

    use super::*;
    use crate::config::{HostSection, PkgSection, Settings, ToolsSection};
    use crate::recipe::Version;
    use crate::resolver::{DepSource, LocalDep};

    #[derive(Default)]
    struct FakePm {
        calls: Rc<RefCell<Vec<String>>>,
        fail_installs_with_conflict: RefCell<usize>,
        orphan_batches: RefCell<Vec<Vec<String>>>,
    }

    impl FakePm {
        fn log(&self) -> Rc<RefCell<Vec<String>>> {
            Rc::clone(&self.calls)
        }
    }

    impl PackageManager for FakePm {
        fn sync(&self) -> Result<()> {
            self.calls.borrow_mut().push("sync".into());
            Ok(())
        }
        fn full_upgrade(&self) -> Result<()> {
            self.calls.borrow_mut().push("upgrade".into());
            Ok(())
        }
        fn install_files(&self, files: &[PathBuf]) -> Result<()> {
            self.calls.borrow_mut().push(format!(
                "install_files {}",
                files
                    .iter()
                    .map(|f| f.file_name().unwrap().to_str().unwrap())
                    .collect::<Vec<_>>()
                    .join(",")
            ));
            let mut failures = self.fail_installs_with_conflict.borrow_mut();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Install {
                    msg: "conflict".into(),
                    conflicts: vec!["old-pkg".into()],
                });
            }
            Ok(())
        }
        fn install_remote(&self, names: &[String]) -> Result<()> {
            self.calls
                .borrow_mut()
                .push(format!("install_remote {}", names.join(",")));
            Ok(())
        }
        fn remove(&self, names: &[String], cascade: bool) -> Result<()> {
            self.calls
                .borrow_mut()
                .push(format!("remove cascade={cascade} {}", names.join(",")));
            Ok(())
        }
        fn orphans(&self) -> Result<Vec<String>> {
            self.calls.borrow_mut().push("orphans".into());
            let mut batches = self.orphan_batches.borrow_mut();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(batches.remove(0))
            }
        }
    }

    struct NoDeps;
    impl DepSource for NoDeps {
        fn depends_of(&self, _artifact: &Path) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn settings() -> Settings {
        Settings {
            host: HostSection {
                repository: "custom".into(),
                package_dir: "/unused".into(),
                build_user: "builder".into(),
                verify_hook: None,
                keep: vec!["gcc".into()],
            },
            pkg: PkgSection {
                arch: "x86_64".into(),
                extension: ".pkg.tar.zst".into(),
                build_dir: None,
                source_dir: None,
                options: vec![],
            },
            tools: ToolsSection::default(),
        }
    }

    fn record(names: &[&str], arches: &[&str]) -> RecipeRecord {
        RecipeRecord {
            path: PathBuf::from("/recipes/x"),
            names: names.iter().map(|s| s.to_string()).collect(),
            arches: arches.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            per_package_arch: Default::default(),
            version: Version {
                epoch: None,
                version: "1".into(),
                release: "1".into(),
            },
            depends: vec![],
            provides_global: vec![],
            provides_per_package: Default::default(),
        }
    }

    fn orchestrator<'a>(
        settings: &'a Settings,
        target: &Path,
        records: &[RecipeRecord],
        pm: FakePm,
        verify_mode: bool,
    ) -> Orchestrator<'a> {
        let resolver = Resolver::new(records, "x86_64", ".pkg.tar.zst", target, Box::new(NoDeps));
        Orchestrator::new(
            settings,
            target.to_path_buf(),
            resolver,
            Box::new(pm),
            verify_mode,
            false,
        )
    }

    #[test]
    fn present_artifacts_skip_all_work() {
        let tmp = tempfile::tempdir().unwrap();
        let rec = record(&["a", "b"], &["x86_64"]);
        fs::write(tmp.path().join("a-1-1-x86_64.pkg.tar.zst"), b"pkg").unwrap();
        fs::write(tmp.path().join("b-1-1-x86_64.pkg.tar.zst"), b"pkg").unwrap();

        let s = settings();
        let mut orch = orchestrator(&s, tmp.path(), std::slice::from_ref(&rec), FakePm::default(), false);
        assert_eq!(orch.process(&rec).unwrap(), Outcome::Skipped);

        // Artifacts untouched, no package-manager traffic.
        assert!(tmp.path().join("a-1-1-x86_64.pkg.tar.zst").exists());
    }

    #[test]
    fn empty_artifact_does_not_count_as_built() {
        let tmp = tempfile::tempdir().unwrap();
        let rec = record(&["a"], &["x86_64"]);
        fs::write(tmp.path().join("a-1-1-x86_64.pkg.tar.zst"), b"").unwrap();

        let s = settings();
        let orch = orchestrator(&s, tmp.path(), std::slice::from_ref(&rec), FakePm::default(), false);
        assert!(!orch.all_artifacts_present(&rec));
    }

    #[test]
    fn unsupported_architecture_is_skipped_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let rec = record(&["a"], &["riscv64"]);
        let s = settings();
        let mut orch = orchestrator(&s, tmp.path(), std::slice::from_ref(&rec), FakePm::default(), false);
        assert_eq!(orch.process(&rec).unwrap(), Outcome::ArchSkip);
    }

    #[test]
    fn eviction_removes_stale_debug_and_signature_files() {
        let tmp = tempfile::tempdir().unwrap();
        let rec = record(&["a"], &["x86_64"]);
        for name in [
            "a-1-1-x86_64.pkg.tar.zst",
            "a-1-1-x86_64.pkg.tar.zst.sig",
            "a-debug-1-1-x86_64.pkg.tar.zst",
        ] {
            fs::write(tmp.path().join(name), b"stale").unwrap();
        }

        let s = settings();
        let orch = orchestrator(&s, tmp.path(), std::slice::from_ref(&rec), FakePm::default(), false);
        orch.evict_stale_artifacts(&rec).unwrap();
        assert!(fs::read_dir(tmp.path()).unwrap().next().is_none());
    }

    #[test]
    fn conflicting_install_is_retried_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let rec = record(&["a"], &["x86_64"]);
        let pm = FakePm::default();
        *pm.fail_installs_with_conflict.borrow_mut() = 1;

        let log = pm.log();
        let s = settings();
        let orch = orchestrator(&s, tmp.path(), std::slice::from_ref(&rec), pm, false);
        let set = InstallSet {
            local: vec![LocalDep {
                name: "dep".into(),
                artifact: tmp.path().join("dep-1-1-x86_64.pkg.tar.zst"),
            }],
            external: vec![],
        };
        orch.install_deps(&set).unwrap();

        assert_eq!(
            *log.borrow(),
            vec![
                "install_files dep-1-1-x86_64.pkg.tar.zst",
                "remove cascade=true old-pkg",
                "install_files dep-1-1-x86_64.pkg.tar.zst",
            ]
        );
    }

    #[test]
    fn second_conflict_failure_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let rec = record(&["a"], &["x86_64"]);
        let pm = FakePm::default();
        *pm.fail_installs_with_conflict.borrow_mut() = 2;

        let log = pm.log();
        let s = settings();
        let orch = orchestrator(&s, tmp.path(), std::slice::from_ref(&rec), pm, false);
        let set = InstallSet {
            local: vec![LocalDep {
                name: "dep".into(),
                artifact: tmp.path().join("dep-1-1-x86_64.pkg.tar.zst"),
            }],
            external: vec![],
        };
        assert!(matches!(
            orch.install_deps(&set),
            Err(Error::Install { .. })
        ));
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn orphan_cleanup_loops_and_honours_keep_list() {
        let tmp = tempfile::tempdir().unwrap();
        let rec = record(&["a"], &["x86_64"]);
        let pm = FakePm {
            orphan_batches: RefCell::new(vec![
                vec!["gcc".into(), "libfoo".into()],
                vec!["libbar".into()],
            ]),
            ..FakePm::default()
        };

        let log = pm.log();
        let s = settings();
        let orch = orchestrator(&s, tmp.path(), std::slice::from_ref(&rec), pm, true);
        orch.remove_orphans().unwrap();
        assert_eq!(
            *log.borrow(),
            vec![
                "orphans",
                "remove cascade=false libfoo",
                "orphans",
                "remove cascade=false libbar",
                "orphans",
            ]
        );
    }
}
