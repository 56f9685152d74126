use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::UNIX_EPOCH;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, Header};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::recipe::{ARCH_ANY, RecipeRecord};

/// Reconcile the persisted repository index against the artifacts the batch
/// actually produced: sweep unexpected package files, drop stale index
/// groups, and hand anything still unrepresented to the index tool.
pub fn reconcile(records: &[RecipeRecord], settings: &Settings, target_dir: &Path) -> Result<()> {
    let valid = valid_artifacts(records, settings, target_dir);
    sweep_target_dir(target_dir, settings, &valid)?;

    // Filenames that still need an index entry after the archive pass.
    let mut pending: BTreeSet<String> = valid
        .iter()
        .filter(|name| target_dir.join(name).is_file())
        .cloned()
        .collect();

    let archive_name = format!("{}.db.tar.gz", settings.host.repository);
    let archive_path = target_dir.join(&archive_name);
    reconcile_archive(&archive_path, settings, target_dir, &valid, &mut pending)?;

    if pending.is_empty() {
        return Ok(());
    }
    info!(count = pending.len(), "indexing new artifacts");
    let status = Command::new(&settings.tools.index_tool)
        .arg(&archive_name)
        .args(&pending)
        .current_dir(target_dir)
        .status()
        .map_err(|e| {
            Error::Index(format!(
                "cannot run {}: {e}",
                settings.tools.index_tool
            ))
        })?;
    if !status.success() {
        return Err(Error::Index(format!(
            "{} exited with {status}",
            settings.tools.index_tool
        )));
    }
    Ok(())
}

/// Every expected output filename, plus each debug filename only when that
/// file actually exists.
fn valid_artifacts(
    records: &[RecipeRecord],
    settings: &Settings,
    target_dir: &Path,
) -> BTreeSet<String> {
    let arch = &settings.pkg.arch;
    let ext = &settings.pkg.extension;
    let mut valid = BTreeSet::new();
    for rec in records {
        if !rec.supported_on(arch) {
            continue;
        }
        for pkg in &rec.names {
            valid.insert(rec.artifact_name(pkg, arch, ext));
            let debug_name = rec.debug_artifact_name(pkg, arch, ext);
            if target_dir.join(&debug_name).is_file() {
                valid.insert(debug_name);
            }
        }
    }
    valid
}

/// Delete every package file (and its detached signature) that no processed
/// recipe accounts for. Index archives live in the same directory and are
/// excluded by name.
fn sweep_target_dir(target_dir: &Path, settings: &Settings, valid: &BTreeSet<String>) -> Result<()> {
    let ext = &settings.pkg.extension;
    let index_prefix = format!("{}.db", settings.host.repository);

    for entry in WalkDir::new(target_dir).max_depth(1).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !name.ends_with(ext.as_str()) || name.starts_with(&index_prefix) {
            continue;
        }
        if valid.contains(name) {
            continue;
        }
        info!(file = name, "removing stray package file");
        fs::remove_file(entry.path())?;
        let sig = entry.path().with_file_name(format!("{name}.sig"));
        if sig.is_file() {
            fs::remove_file(sig)?;
        }
    }
    Ok(())
}

struct Member {
    header: Header,
    data: Vec<u8>,
}

fn reconcile_archive(
    archive_path: &Path,
    settings: &Settings,
    target_dir: &Path,
    valid: &BTreeSet<String>,
    pending: &mut BTreeSet<String>,
) -> Result<()> {
    if !archive_path.is_file() {
        return Ok(());
    }

    let raw = fs::File::open(archive_path)
        .map_err(|e| Error::Index(format!("cannot open {}: {e}", archive_path.display())))?;
    let mut archive = Archive::new(GzDecoder::new(raw));

    // Group members by entry key (the leading path component), keeping the
    // original member order for the rewrite.
    let mut groups: BTreeMap<String, Vec<Member>> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    for entry in archive
        .entries()
        .map_err(|e| Error::Index(format!("cannot read {}: {e}", archive_path.display())))?
    {
        let mut entry = entry.map_err(|e| Error::Index(format!("corrupt index entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| Error::Index(format!("corrupt index entry path: {e}")))?
            .into_owned();
        let Some(key) = entry_key(&path) else {
            continue;
        };
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| Error::Index(format!("cannot read index member: {e}")))?;
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(Member {
            header: entry.header().clone(),
            data,
        });
    }

    let mut stale: BTreeSet<String> = BTreeSet::new();
    for (key, members) in &groups {
        match group_artifact(key, members, settings, target_dir, valid) {
            Some(artifact_name) => {
                pending.remove(&artifact_name);
            }
            None => {
                stale.insert(key.clone());
            }
        }
    }

    if stale.is_empty() {
        return Ok(());
    }
    info!(entries = stale.len(), "removing stale index entries");

    let tmp = tempfile::NamedTempFile::new_in(target_dir)
        .map_err(|e| Error::Index(format!("cannot create temp index: {e}")))?;
    {
        let gz = GzEncoder::new(tmp.as_file(), Compression::default());
        let mut builder = Builder::new(gz);
        for key in &order {
            if stale.contains(key) {
                continue;
            }
            for member in &groups[key] {
                builder
                    .append(&member.header, member.data.as_slice())
                    .map_err(|e| Error::Index(format!("cannot rewrite index: {e}")))?;
            }
        }
        builder
            .into_inner()
            .and_then(|gz| gz.finish())
            .map_err(|e| Error::Index(format!("cannot finish index rewrite: {e}")))?;
    }
    tmp.persist(archive_path)
        .map_err(|e| Error::Index(format!("cannot replace index archive: {e}")))?;

    refresh_alias(archive_path, settings, target_dir)
}

/// Resolve a group to the artifact it represents, or `None` when the group
/// is stale. The entry key derives the architecture-specific filename first
/// and falls back to the "any" variant. A represented artifact whose file is
/// strictly newer than the recorded member mtime marks the group stale: the
/// artifact was rebuilt after it was indexed.
fn group_artifact(
    key: &str,
    members: &[Member],
    settings: &Settings,
    target_dir: &Path,
    valid: &BTreeSet<String>,
) -> Option<String> {
    let desc = members.iter().find(|m| {
        m.header
            .path()
            .ok()
            .map(|p| p.ends_with("desc"))
            .unwrap_or(false)
    })?;

    let artifact_name = derive_artifact_name(key, settings, valid)?;
    let artifact_mtime = mtime_secs(&target_dir.join(&artifact_name))?;
    let indexed_mtime = desc.header.mtime().ok()?;
    if artifact_mtime > indexed_mtime {
        debug!(entry = key, "artifact is newer than its index entry");
        return None;
    }
    Some(artifact_name)
}

fn derive_artifact_name(key: &str, settings: &Settings, valid: &BTreeSet<String>) -> Option<String> {
    let specific = format!("{key}-{}{}", settings.pkg.arch, settings.pkg.extension);
    if valid.contains(&specific) {
        return Some(specific);
    }
    let any = format!("{key}-{ARCH_ANY}{}", settings.pkg.extension);
    if valid.contains(&any) {
        return Some(any);
    }
    None
}

fn entry_key(path: &Path) -> Option<String> {
    let mut components = path.components();
    let first = components.next()?;
    Some(first.as_os_str().to_string_lossy().into_owned())
}

fn mtime_secs(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    modified
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}

/// The short-named alias clients address; a symbolic link where available,
/// a plain copy otherwise.
fn refresh_alias(archive_path: &Path, settings: &Settings, target_dir: &Path) -> Result<()> {
    let alias = target_dir.join(format!("{}.db", settings.host.repository));
    match fs::remove_file(&alias) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let archive_file: PathBuf = archive_path
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| Error::Index("index archive has no file name".into()))?;

    #[cfg(unix)]
    {
        if std::os::unix::fs::symlink(&archive_file, &alias).is_ok() {
            return Ok(());
        }
    }
    fs::copy(archive_path, &alias)
        .map_err(|e| Error::Index(format!("cannot refresh index alias: {e}")))?;
    Ok(())
}
