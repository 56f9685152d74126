use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;

use regex::Regex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_chunk;

/// Output is consumed in fixed-size chunks, not lines: prompts do not end
/// with a newline. A prompt that straddles a chunk boundary is not
/// recognized; that is an accepted limitation of the automation, kept in
/// preference to unbounded buffering.
const CHUNK_SIZE: usize = 4096;

const SYNC_ARGS: &[&str] = &["-Sy"];
const UPGRADE_ARGS: &[&str] = &["-Syu"];
const INSTALL_FILE_ARGS: &[&str] = &["-U", "--asdeps"];
const INSTALL_REMOTE_ARGS: &[&str] = &["-S", "--asdeps"];
const REMOVE_ARGS: &[&str] = &["-Rns"];
const REMOVE_CASCADE_ARGS: &[&str] = &["-Rc"];
const ORPHAN_QUERY_ARGS: &[&str] = &["-Qdtq"];

/// Privileged package-manager operations the orchestrator needs. The
/// command-backed implementation is `CmdPm`; tests substitute their own.
pub trait PackageManager {
    fn sync(&self) -> Result<()>;
    fn full_upgrade(&self) -> Result<()>;
    /// Install already-built artifacts from the target directory, marked as
    /// automatically installed.
    fn install_files(&self, files: &[PathBuf]) -> Result<()>;
    /// Install packages from the external repository, marked as
    /// automatically installed.
    fn install_remote(&self, names: &[String]) -> Result<()>;
    fn remove(&self, names: &[String], cascade: bool) -> Result<()>;
    /// Installed packages with no remaining dependent.
    fn orphans(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptState {
    Scanning,
    ConflictSeen,
    DefaultSeen,
}

/// Classifier over incoming output chunks. Feeding a chunk yields the
/// response to inject on the child's stdin, if any, and records every
/// package the automation agreed to remove for a conflict.
pub struct PromptAutomaton {
    state: PromptState,
    conflicts: Vec<String>,
    remove_re: Regex,
}

impl Default for PromptAutomaton {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptAutomaton {
    pub fn new() -> Self {
        Self {
            state: PromptState::Scanning,
            conflicts: Vec::new(),
            remove_re: Regex::new(r"Remove (\S+?)\?").expect("valid remove pattern"),
        }
    }

    pub fn state(&self) -> PromptState {
        self.state
    }

    pub fn conflicts(&self) -> &[String] {
        &self.conflicts
    }

    pub fn into_conflicts(self) -> Vec<String> {
        self.conflicts
    }

    /// Classify one chunk. Conflict prompts are answered affirmatively,
    /// menu selections and generic confirmations with the default; anything
    /// else gets no injected input.
    pub fn feed(&mut self, chunk: &str) -> Option<&'static str> {
        if chunk.contains("are in conflict") {
            if let Some(cap) = self.remove_re.captures(chunk) {
                self.conflicts.push(cap[1].to_string());
            }
            self.state = PromptState::ConflictSeen;
            return Some("y\n");
        }
        if chunk.contains("Enter a selection")
            || chunk.contains("[Y/n]")
            || chunk.contains("[y/N]")
        {
            self.state = PromptState::DefaultSeen;
            return Some("\n");
        }
        self.state = PromptState::Scanning;
        None
    }
}

/// Wraps the privileged package manager and feeds canned responses to its
/// interactive prompts, so a batch run never blocks on a human.
pub struct CmdPm {
    program: String,
    dry_run: bool,
}

struct RunOutput {
    success: bool,
    transcript: String,
    conflicts: Vec<String>,
}

impl CmdPm {
    pub fn new(program: impl Into<String>, dry_run: bool) -> Self {
        Self {
            program: program.into(),
            dry_run,
        }
    }

    fn run_automated(&self, args: Vec<String>) -> Result<RunOutput> {
        if self.dry_run {
            info!("DRY-RUN: {} {}", self.program, args.join(" "));
            return Ok(RunOutput {
                success: true,
                transcript: String::new(),
                conflicts: Vec::new(),
            });
        }

        let mut child = Command::new(&self.program)
            .args(&args)
            // Prompt matching relies on deterministic message text.
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::install(format!("cannot spawn {}: {e}", self.program)))?;

        let mut stdin = child.stdin.take();
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || pump_chunks(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || pump_chunks(err, tx));
        }
        drop(tx);

        let mut automaton = PromptAutomaton::new();
        let mut transcript = String::new();

        for chunk in rx {
            let text = String::from_utf8_lossy(&chunk);
            let clean = sanitize_chunk(&text);
            // Forward everything to the operator's terminal for visibility.
            print!("{clean}");
            let _ = std::io::stdout().flush();
            transcript.push_str(&clean);

            if let Some(response) = automaton.feed(&text) {
                if let Some(w) = stdin.as_mut() {
                    let _ = w.write_all(response.as_bytes());
                    let _ = w.flush();
                }
                if automaton.state() == PromptState::ConflictSeen {
                    println!("y");
                }
            }
        }
        drop(stdin);

        let status = child
            .wait()
            .map_err(|e| Error::install(format!("wait on {} failed: {e}", self.program)))?;

        Ok(RunOutput {
            success: status.success(),
            transcript,
            conflicts: automaton.into_conflicts(),
        })
    }

    fn run_checked(&self, what: &str, args: Vec<String>) -> Result<()> {
        debug!(program = %self.program, ?args, "running package manager");
        let out = self.run_automated(args)?;
        if out.success {
            return Ok(());
        }
        Err(Error::Install {
            msg: format!("{what} failed: {}", transcript_tail(&out.transcript)),
            conflicts: out.conflicts,
        })
    }
}

impl PackageManager for CmdPm {
    fn sync(&self) -> Result<()> {
        self.run_checked("repository sync", to_args(SYNC_ARGS, &[]))
    }

    fn full_upgrade(&self) -> Result<()> {
        self.run_checked("full upgrade", to_args(UPGRADE_ARGS, &[]))
    }

    fn install_files(&self, files: &[PathBuf]) -> Result<()> {
        let names: Vec<String> = files
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        self.run_checked("local install", to_args(INSTALL_FILE_ARGS, &names))
    }

    fn install_remote(&self, names: &[String]) -> Result<()> {
        self.run_checked("repository install", to_args(INSTALL_REMOTE_ARGS, names))
    }

    fn remove(&self, names: &[String], cascade: bool) -> Result<()> {
        let base = if cascade {
            REMOVE_CASCADE_ARGS
        } else {
            REMOVE_ARGS
        };
        self.run_checked("removal", to_args(base, names))
    }

    fn orphans(&self) -> Result<Vec<String>> {
        if self.dry_run {
            return Ok(Vec::new());
        }
        // The orphan query is non-interactive; a non-zero exit with no
        // output just means there are no orphans.
        let out = Command::new(&self.program)
            .args(ORPHAN_QUERY_ARGS)
            .env("LC_ALL", "C")
            .output()
            .map_err(|e| Error::install(format!("cannot spawn {}: {e}", self.program)))?;
        let names: Vec<String> = String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect();
        if !out.status.success() && !names.is_empty() {
            return Err(Error::install(format!(
                "orphan query exited with {}",
                out.status
            )));
        }
        Ok(names)
    }
}

fn to_args(base: &[&str], rest: &[String]) -> Vec<String> {
    base.iter()
        .map(|s| s.to_string())
        .chain(rest.iter().cloned())
        .collect()
}

fn pump_chunks<R: Read>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

fn transcript_tail(transcript: &str) -> String {
    let lines: Vec<&str> = transcript
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_prompt_is_answered_affirmatively() {
        let mut a = PromptAutomaton::new();
        let resp = a.feed(":: foo and bar are in conflict. Remove bar? [y/N] ");
        assert_eq!(resp, Some("y\n"));
        assert_eq!(a.state(), PromptState::ConflictSeen);
        assert_eq!(a.conflicts(), ["bar"]);
    }

    #[test]
    fn menu_and_confirmation_prompts_get_the_default() {
        let mut a = PromptAutomaton::new();
        assert_eq!(a.feed("Enter a selection (default=all): "), Some("\n"));
        assert_eq!(a.state(), PromptState::DefaultSeen);
        assert_eq!(a.feed(":: Proceed with installation? [Y/n] "), Some("\n"));
        assert_eq!(a.feed("remove foo? [y/N] "), Some("\n"));
        assert!(a.conflicts().is_empty());
    }

    #[test]
    fn plain_output_gets_no_injected_input() {
        let mut a = PromptAutomaton::new();
        assert_eq!(a.feed("resolving dependencies...\n"), None);
        assert_eq!(a.state(), PromptState::Scanning);
    }

    #[test]
    fn conflict_wins_over_embedded_confirmation_text() {
        let mut a = PromptAutomaton::new();
        let resp = a.feed(":: a and b are in conflict (b). Remove b? [y/N] ");
        assert_eq!(resp, Some("y\n"));
        assert_eq!(a.conflicts(), ["b"]);
    }

    #[test]
    fn transcript_tail_keeps_the_last_lines() {
        let t = "a\nb\n\nc\nd\ne\nf\ng\n";
        assert_eq!(transcript_tail(t), "c | d | e | f | g");
    }
}
