use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::Config(format!("invalid config section '{path}': {e}")))?;
        Ok(Some(parsed))
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn parse_imports(path: &Path, table: &toml::value::Table) -> Result<Vec<String>> {
    let Some(arr) = table.get("imports").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::Config(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn inline_imports_in_value(
    file_path: &Path,
    value: &mut Value,
    stack: &mut HashSet<PathBuf>,
) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = parse_imports(file_path, tbl)?;
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            let imp_path = resolve_ref_path(file_path, &imp);
            let loaded = load_value_inner(&imp_path, stack)?;
            merge_values(&mut acc, loaded);
        }

        let mut local = Value::Table(tbl.clone());
        if let Some(local_tbl) = local.as_table_mut() {
            local_tbl.remove("imports");
        }
        merge_values(&mut acc, local);

        *tbl = acc.as_table().expect("acc must be a table").clone();
    } else {
        tbl.remove("imports");
    }

    for (_, v) in tbl.iter_mut() {
        inline_imports_in_value(file_path, v, stack)?;
    }

    Ok(())
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::Config(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::Config(format!("TOML parse error in {}: {e}", path.display())))?;

    // Root-level single-parent extends (optional).
    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        let base_path = resolve_ref_path(path, ext);
        out = load_value_inner(&base_path, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }

    inline_imports_in_value(path, &mut value, stack)?;
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostSection {
    pub repository: String,
    pub package_dir: String,
    pub build_user: String,
    #[serde(default)]
    pub verify_hook: Option<String>,
    #[serde(default)]
    pub keep: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PkgSection {
    pub arch: String,
    pub extension: String,
    #[serde(default)]
    pub build_dir: Option<String>,
    #[serde(default)]
    pub source_dir: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub package_manager: String,
    pub build_tool: String,
    pub index_tool: String,
    pub archive_tool: String,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            package_manager: "pacman".into(),
            build_tool: "makepkg".into(),
            index_tool: "repo-add".into(),
            archive_tool: "bsdtar".into(),
        }
    }
}

/// Typed view of the merged configuration document. Missing required
/// sections surface as `Error::Config` before any recipe is touched.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: HostSection,
    pub pkg: PkgSection,
    pub tools: ToolsSection,
}

impl Settings {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let host: HostSection = doc
            .deserialize_path("host")?
            .ok_or_else(|| Error::Config("missing [host] section".into()))?;
        let pkg: PkgSection = doc
            .deserialize_path("pkg")?
            .ok_or_else(|| Error::Config("missing [pkg] section".into()))?;
        let tools: ToolsSection = doc.deserialize_path("tools")?.unwrap_or_default();

        for (key, val) in [
            ("host.repository", &host.repository),
            ("host.package_dir", &host.package_dir),
            ("host.build_user", &host.build_user),
            ("pkg.arch", &pkg.arch),
            ("pkg.extension", &pkg.extension),
        ] {
            if val.trim().is_empty() {
                return Err(Error::Config(format!("setting '{key}' must not be empty")));
            }
        }

        Ok(Self { host, pkg, tools })
    }

    /// Target directory for built artifacts. The configured template may
    /// carry an `{arch}` placeholder; an explicit override wins outright.
    pub fn package_dir(&self, override_path: Option<&Path>) -> PathBuf {
        match override_path {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(self.host.package_dir.replace("{arch}", &self.pkg.arch)),
        }
    }

    pub fn option_enabled(&self, name: &str) -> bool {
        self.pkg.options.iter().any(|o| o == name)
    }
}
