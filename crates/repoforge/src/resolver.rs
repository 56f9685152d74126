use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};
use crate::recipe::{RecipeRecord, dep_base_name};

/// Reads the dependency list embedded in an already-built artifact.
pub trait DepSource {
    fn depends_of(&self, artifact: &Path) -> Result<Vec<String>>;
}

/// Extracts `.PKGINFO` from the artifact through the configured archive
/// tool and keeps the `depend = ` entries.
pub struct CmdDepSource {
    archive_tool: String,
}

impl CmdDepSource {
    pub fn new(archive_tool: impl Into<String>) -> Self {
        Self {
            archive_tool: archive_tool.into(),
        }
    }
}

impl DepSource for CmdDepSource {
    fn depends_of(&self, artifact: &Path) -> Result<Vec<String>> {
        let out = Command::new(&self.archive_tool)
            .arg("-xOqf")
            .arg(artifact)
            .arg(".PKGINFO")
            .output()
            .map_err(|e| {
                Error::BuildOrder(format!(
                    "cannot inspect artifact {}: {e}",
                    artifact.display()
                ))
            })?;
        if !out.status.success() {
            return Err(Error::BuildOrder(format!(
                "{} failed reading {} ({})",
                self.archive_tool,
                artifact.display(),
                out.status
            )));
        }
        let text = String::from_utf8_lossy(&out.stdout);
        Ok(text
            .lines()
            .filter_map(|l| l.trim().strip_prefix("depend"))
            .filter_map(|rest| rest.trim_start().strip_prefix('='))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect())
    }
}

/// How one declared dependency name is satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// Satisfied by a package built in this batch (directly or through a
    /// provided virtual name).
    Local(String),
    /// Must come from the external repository.
    External,
}

#[derive(Debug, Clone)]
pub struct LocalDep {
    pub name: String,
    pub artifact: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct InstallSet {
    pub local: Vec<LocalDep>,
    pub external: Vec<String>,
}

/// Batch-wide resolution state: the provides map and expected artifact
/// locations are built once, before any recipe is processed; per-artifact
/// dependency extraction is memoized for the lifetime of the run.
pub struct Resolver {
    provides: HashMap<String, String>,
    artifacts: HashMap<String, PathBuf>,
    source: Box<dyn DepSource>,
    memo: HashMap<PathBuf, Vec<String>>,
}

impl Resolver {
    pub fn new(
        records: &[RecipeRecord],
        host_arch: &str,
        extension: &str,
        target_dir: &Path,
        source: Box<dyn DepSource>,
    ) -> Self {
        let mut provides = HashMap::new();
        let mut artifacts = HashMap::new();

        // Batch order; a later recipe overwrites an earlier provider.
        for rec in records {
            for name in &rec.provides_global {
                provides.insert(name.clone(), rec.names[0].clone());
            }
            for (pkg, list) in &rec.provides_per_package {
                for name in list {
                    provides.insert(name.clone(), pkg.clone());
                }
            }
            for pkg in &rec.names {
                artifacts.insert(
                    pkg.clone(),
                    target_dir.join(rec.artifact_name(pkg, host_arch, extension)),
                );
            }
        }

        Self {
            provides,
            artifacts,
            source,
            memo: HashMap::new(),
        }
    }

    pub fn classify(&self, dep: &str) -> Classified {
        let name = dep_base_name(dep);
        if self.artifacts.contains_key(name) {
            return Classified::Local(name.to_string());
        }
        if let Some(provider) = self.provides.get(name) {
            return Classified::Local(provider.clone());
        }
        Classified::External
    }

    /// Partition a recipe's declared dependencies into the batch-local and
    /// external sets, then close the local set over the dependency lists
    /// embedded in the already-built local artifacts: a previously built
    /// package may pull in another batch package the current recipe never
    /// declares, and installation would fail without it.
    pub fn install_set(&mut self, rec: &RecipeRecord) -> Result<InstallSet> {
        let own: BTreeSet<&str> = rec.names.iter().map(String::as_str).collect();

        let mut local_seen = BTreeSet::new();
        let mut external_seen = BTreeSet::new();
        let mut local = Vec::new();
        let mut external = Vec::new();
        let mut queue = VecDeque::new();

        for dep in &rec.depends {
            match self.classify(dep) {
                Classified::Local(pkg) => {
                    // Sibling outputs of this very recipe are satisfied by
                    // the build itself.
                    if !own.contains(pkg.as_str()) && local_seen.insert(pkg.clone()) {
                        queue.push_back(pkg);
                    }
                }
                Classified::External => {
                    let name = dep_base_name(dep).to_string();
                    if external_seen.insert(name.clone()) {
                        external.push(name);
                    }
                }
            }
        }

        while let Some(pkg) = queue.pop_front() {
            let artifact = self.artifacts[&pkg].clone();
            if !artifact.is_file() {
                return Err(Error::BuildOrder(format!(
                    "recipe {} depends on '{pkg}' but {} has not been built yet; \
                     the batch order does not match the dependency order",
                    rec.path.display(),
                    artifact.display()
                )));
            }

            for dep in self.artifact_depends(&artifact)? {
                if let Classified::Local(next) = self.classify(&dep) {
                    if !own.contains(next.as_str()) && local_seen.insert(next.clone()) {
                        queue.push_back(next);
                    }
                }
            }

            local.push(LocalDep {
                name: pkg,
                artifact,
            });
        }

        debug!(
            recipe = %rec.path.display(),
            local = local.len(),
            external = external.len(),
            "resolved install set"
        );
        Ok(InstallSet { local, external })
    }

    fn artifact_depends(&mut self, artifact: &Path) -> Result<Vec<String>> {
        if let Some(cached) = self.memo.get(artifact) {
            return Ok(cached.clone());
        }
        let deps = self.source.depends_of(artifact)?;
        self.memo.insert(artifact.to_path_buf(), deps.clone());
        Ok(deps)
    }
}
