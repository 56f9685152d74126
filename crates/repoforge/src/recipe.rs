use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::config::Settings;
use crate::error::{Error, Result};

/// Build script consumed by the external build tool.
pub const RECIPE_FILE: &str = "RECIPE";
/// Flat descriptor exported from the build script by the external tool.
pub const DESCRIPTOR_FILE: &str = ".RECIPEINFO";
/// Argument that makes the build tool print the descriptor on stdout.
const PRINTMETA_ARG: &str = "--printmeta";

/// Architecture value meaning "architecture independent".
pub const ARCH_ANY: &str = "any";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub epoch: Option<String>,
    pub version: String,
    pub release: String,
}

impl Version {
    /// `[epoch:]version-release`, the form embedded in artifact filenames.
    pub fn full(&self) -> String {
        match &self.epoch {
            Some(e) => format!("{e}:{}-{}", self.version, self.release),
            None => format!("{}-{}", self.version, self.release),
        }
    }
}

/// One build unit, extracted once per run and read-only thereafter.
#[derive(Debug, Clone)]
pub struct RecipeRecord {
    pub path: PathBuf,
    /// Ordered output package names; never empty after extraction.
    pub names: Vec<String>,
    /// Supported architectures; never empty after extraction.
    pub arches: BTreeSet<String>,
    pub per_package_arch: BTreeMap<String, String>,
    pub version: Version,
    /// Runtime + build-time (+ check-time, when the check option is on)
    /// dependency names, raw, in declaration order.
    pub depends: Vec<String>,
    pub provides_global: Vec<String>,
    pub provides_per_package: BTreeMap<String, Vec<String>>,
}

impl RecipeRecord {
    pub fn supported_on(&self, host_arch: &str) -> bool {
        self.arches.contains(ARCH_ANY) || self.arches.contains(host_arch)
    }

    /// "any" wins over the host architecture, whether declared globally or
    /// as a per-package override; any other override still builds for the
    /// host, so the filename carries the host architecture.
    pub fn resolved_arch(&self, pkg: &str, host_arch: &str) -> String {
        if self.arches.contains(ARCH_ANY) {
            return ARCH_ANY.to_string();
        }
        match self.per_package_arch.get(pkg) {
            Some(a) if a == ARCH_ANY => ARCH_ANY.to_string(),
            _ => host_arch.to_string(),
        }
    }

    pub fn artifact_name(&self, pkg: &str, host_arch: &str, ext: &str) -> String {
        format!(
            "{pkg}-{}-{}{ext}",
            self.version.full(),
            self.resolved_arch(pkg, host_arch)
        )
    }

    pub fn debug_artifact_name(&self, pkg: &str, host_arch: &str, ext: &str) -> String {
        format!(
            "{pkg}-debug-{}-{}{ext}",
            self.version.full(),
            self.resolved_arch(pkg, host_arch)
        )
    }
}

/// Strip a version constraint (`foo>=1.2`, `bar=3`) down to the bare name.
pub fn dep_base_name(raw: &str) -> &str {
    match raw.find(['<', '>', '=']) {
        Some(i) => &raw[..i],
        None => raw,
    }
}

/// Produce the record for one recipe directory, regenerating a stale
/// descriptor through the external build tool first.
pub fn extract(recipe_dir: &Path, settings: &Settings) -> Result<RecipeRecord> {
    refresh_descriptor(recipe_dir, &settings.tools.build_tool)?;

    let descriptor = recipe_dir.join(DESCRIPTOR_FILE);
    let text = fs::read_to_string(&descriptor).map_err(|e| Error::Metadata {
        path: recipe_dir.to_path_buf(),
        msg: format!("cannot read descriptor: {e}"),
    })?;

    parse_descriptor(recipe_dir, &text, settings.option_enabled("check"))
}

/// Re-export the descriptor when it is missing or older than the recipe
/// script. Descriptor generation itself belongs to the build tool; this
/// only re-invokes it and captures stdout.
fn refresh_descriptor(recipe_dir: &Path, build_tool: &str) -> Result<()> {
    let descriptor = recipe_dir.join(DESCRIPTOR_FILE);
    let script = recipe_dir.join(RECIPE_FILE);

    let stale = match (fs::metadata(&descriptor), fs::metadata(&script)) {
        (Err(_), _) => true,
        (Ok(d), Ok(s)) => {
            let dm = d.modified().ok();
            let sm = s.modified().ok();
            matches!((dm, sm), (Some(dm), Some(sm)) if sm > dm)
        }
        (Ok(_), Err(_)) => false,
    };
    if !stale {
        return Ok(());
    }

    debug!(recipe = %recipe_dir.display(), "regenerating stale descriptor");
    let out = Command::new(build_tool)
        .arg(PRINTMETA_ARG)
        .current_dir(recipe_dir)
        .output()
        .map_err(|e| Error::Metadata {
            path: recipe_dir.to_path_buf(),
            msg: format!("cannot invoke {build_tool} {PRINTMETA_ARG}: {e}"),
        })?;
    if !out.status.success() {
        return Err(Error::Metadata {
            path: recipe_dir.to_path_buf(),
            msg: format!("{build_tool} {PRINTMETA_ARG} exited with {}", out.status),
        });
    }
    fs::write(&descriptor, &out.stdout).map_err(|e| Error::Metadata {
        path: recipe_dir.to_path_buf(),
        msg: format!("cannot write descriptor: {e}"),
    })?;
    Ok(())
}

/// Descriptor grammar: `key = value` lines in blocks separated by a blank
/// line. The first block is global; every later block opens with a
/// `name = <pkg>` line and may override `arch` and add `provides` for that
/// package only.
pub fn parse_descriptor(
    recipe_dir: &Path,
    text: &str,
    check_enabled: bool,
) -> Result<RecipeRecord> {
    let meta_err = |msg: String| Error::Metadata {
        path: recipe_dir.to_path_buf(),
        msg,
    };

    let blocks = split_blocks(text);
    let Some((global, package_blocks)) = blocks.split_first() else {
        return Err(meta_err("descriptor is empty".into()));
    };

    let mut arches = BTreeSet::new();
    let mut depends = Vec::new();
    let mut provides_global = Vec::new();
    let mut version = None;
    let mut release = None;
    let mut epoch = None;

    for (key, value) in global {
        match key.as_str() {
            "base" => {}
            "version" => version = Some(value.clone()),
            "release" => release = Some(value.clone()),
            "epoch" => epoch = Some(value.clone()),
            "arch" => {
                arches.insert(value.clone());
            }
            "depends" | "makedepends" => depends.push(value.clone()),
            "checkdepends" => {
                if check_enabled {
                    depends.push(value.clone());
                }
            }
            "provides" => provides_global.push(value.clone()),
            "name" => {
                return Err(meta_err("global block must not declare 'name'".into()));
            }
            _ => {}
        }
    }

    let version = Version {
        epoch,
        version: version.ok_or_else(|| meta_err("missing 'version'".into()))?,
        release: release.ok_or_else(|| meta_err("missing 'release'".into()))?,
    };

    let mut names = Vec::new();
    let mut per_package_arch = BTreeMap::new();
    let mut provides_per_package: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for block in package_blocks {
        let Some(("name", pkg)) = block.first().map(|(k, v)| (k.as_str(), v.as_str())) else {
            return Err(meta_err("package block must open with 'name'".into()));
        };
        names.push(pkg.to_string());
        for (key, value) in &block[1..] {
            match key.as_str() {
                "arch" => {
                    per_package_arch.insert(pkg.to_string(), value.clone());
                }
                "provides" => provides_per_package
                    .entry(pkg.to_string())
                    .or_default()
                    .push(value.clone()),
                _ => {}
            }
        }
    }

    if names.is_empty() {
        return Err(meta_err("descriptor declares no package name".into()));
    }
    if arches.is_empty() {
        return Err(meta_err("descriptor declares no architecture".into()));
    }

    Ok(RecipeRecord {
        path: recipe_dir.to_path_buf(),
        names,
        arches,
        per_package_arch,
        version,
        depends,
        provides_global,
        provides_per_package,
    })
}

fn split_blocks(text: &str) -> Vec<Vec<(String, String)>> {
    let mut blocks = Vec::new();
    let mut cur: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !cur.is_empty() {
                blocks.push(std::mem::take(&mut cur));
            }
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            if !key.is_empty() && !value.is_empty() {
                cur.push((key.to_string(), value.to_string()));
            }
        }
    }
    if !cur.is_empty() {
        blocks.push(cur);
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = "\
base = foo
version = 1.2.3
release = 2
arch = x86_64
depends = libbar>=1.0
makedepends = cmake
checkdepends = pytest
provides = libfoo

name = foo

name = foo-extra
arch = any
provides = libextra
";

    fn parse(text: &str, check: bool) -> Result<RecipeRecord> {
        parse_descriptor(Path::new("/recipes/foo"), text, check)
    }

    #[test]
    fn parses_global_and_override_blocks() {
        let rec = parse(DESCRIPTOR, false).unwrap();
        assert_eq!(rec.names, vec!["foo", "foo-extra"]);
        assert_eq!(rec.version.full(), "1.2.3-2");
        assert!(rec.arches.contains("x86_64"));
        assert_eq!(rec.depends, vec!["libbar>=1.0", "cmake"]);
        assert_eq!(rec.provides_global, vec!["libfoo"]);
        assert_eq!(rec.per_package_arch.get("foo-extra").unwrap(), "any");
        assert_eq!(
            rec.provides_per_package.get("foo-extra").unwrap(),
            &vec!["libextra".to_string()]
        );
    }

    #[test]
    fn checkdepends_only_with_check_option() {
        let rec = parse(DESCRIPTOR, true).unwrap();
        assert!(rec.depends.iter().any(|d| d == "pytest"));
        let rec = parse(DESCRIPTOR, false).unwrap();
        assert!(!rec.depends.iter().any(|d| d == "pytest"));
    }

    #[test]
    fn artifact_names_respect_arch_overrides_and_epoch() {
        let mut rec = parse(DESCRIPTOR, false).unwrap();
        assert_eq!(
            rec.artifact_name("foo", "x86_64", ".pkg.tar.zst"),
            "foo-1.2.3-2-x86_64.pkg.tar.zst"
        );
        assert_eq!(
            rec.artifact_name("foo-extra", "x86_64", ".pkg.tar.zst"),
            "foo-extra-1.2.3-2-any.pkg.tar.zst"
        );
        assert_eq!(
            rec.debug_artifact_name("foo", "x86_64", ".pkg.tar.zst"),
            "foo-debug-1.2.3-2-x86_64.pkg.tar.zst"
        );

        rec.version.epoch = Some("3".into());
        assert_eq!(
            rec.artifact_name("foo", "x86_64", ".pkg.tar.zst"),
            "foo-3:1.2.3-2-x86_64.pkg.tar.zst"
        );
    }

    #[test]
    fn any_arch_recipe_is_always_supported() {
        let rec = parse(
            "version = 1\nrelease = 1\narch = any\n\nname = a\n",
            false,
        )
        .unwrap();
        assert!(rec.supported_on("x86_64"));
        assert!(rec.supported_on("aarch64"));
        assert_eq!(rec.resolved_arch("a", "x86_64"), "any");
    }

    #[test]
    fn concrete_package_arch_override_resolves_to_host_arch() {
        let rec = parse(
            "version = 1\nrelease = 1\narch = x86_64\narch = aarch64\n\nname = a\narch = aarch64\n",
            false,
        )
        .unwrap();
        // Only an "any" override changes the filename; a concrete override
        // still names the host architecture.
        assert_eq!(rec.resolved_arch("a", "x86_64"), "x86_64");
        assert_eq!(
            rec.artifact_name("a", "x86_64", ".pkg.tar.zst"),
            "a-1-1-x86_64.pkg.tar.zst"
        );
    }

    #[test]
    fn rejects_missing_names_and_arches() {
        assert!(matches!(
            parse("version = 1\nrelease = 1\narch = any\n", false),
            Err(Error::Metadata { .. })
        ));
        assert!(matches!(
            parse("version = 1\nrelease = 1\n\nname = a\n", false),
            Err(Error::Metadata { .. })
        ));
        assert!(matches!(
            parse("version = 1\narch = any\n\nname = a\n", false),
            Err(Error::Metadata { .. })
        ));
    }

    #[test]
    fn dep_names_lose_version_constraints() {
        assert_eq!(dep_base_name("libbar>=1.0"), "libbar");
        assert_eq!(dep_base_name("libbaz=2"), "libbaz");
        assert_eq!(dep_base_name("plain"), "plain");
    }
}
