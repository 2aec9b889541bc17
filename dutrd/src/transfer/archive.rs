//! Tar stream production and consumption, plus path resolution.
//!
//! Everything here is synchronous: the tar crate drives std IO, so the
//! transfer orchestrator runs these on blocking threads with the
//! accepted socket converted to `std::net::TcpStream`.
//!
//! Path resolution rules for Download and the size probe:
//! - a final component containing `*` or `?` expands as a glob rooted
//!   at the parent directory; matching files are included and matching
//!   directories expand recursively,
//! - a directory includes all descendants, named relative to the
//!   directory itself,
//! - anything else is a single file named after its basename.
//!
//! Archive entry names always use `/` separators; directory entries
//! carry a trailing `/`.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use dutr_common::AgentError;

/// One filesystem object headed into (or probed for) an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub abs: PathBuf,
    /// Slash-separated name inside the archive.
    pub name: String,
    pub is_dir: bool,
    pub len: u64,
}

/// Result of resolving a Download path specification.
#[derive(Debug, Clone)]
pub struct ResolvedTree {
    pub entries: Vec<ArchiveEntry>,
}

impl ResolvedTree {
    /// Uncompressed byte total: file content sizes only, headers and
    /// directories count zero.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.len)
            .sum()
    }
}

/// Resolve a path specification into the entries Download will stream.
pub fn resolve(path_spec: &str) -> Result<ResolvedTree, AgentError> {
    if path_spec.is_empty() {
        return Err(AgentError::TransferProtocol(
            "empty transfer path".to_string(),
        ));
    }

    let mut entries = Vec::new();

    if path_spec.contains('*') || path_spec.contains('?') {
        let root = Path::new(path_spec)
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .to_path_buf();
        let matches = glob::glob(path_spec)
            .map_err(|err| AgentError::TransferProtocol(format!("bad glob pattern: {err}")))?;
        for matched in matches {
            let path = matched
                .map_err(|err| AgentError::TransferProtocol(format!("glob walk failed: {err}")))?;
            push_path(&root, &path, &mut entries)?;
        }
        if entries.is_empty() {
            return Err(AgentError::TransferProtocol(format!(
                "no files match {path_spec}"
            )));
        }
        return Ok(ResolvedTree { entries });
    }

    let path = Path::new(path_spec);
    let meta = std::fs::metadata(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::PermissionDenied => AgentError::PermissionDenied(path.to_path_buf()),
        _ => AgentError::TransferProtocol(format!("{path_spec}: {err}")),
    })?;

    if meta.is_dir() {
        walk_dir(path, path, &mut entries)?;
    } else {
        let root = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        push_file(&root, path, meta.len(), &mut entries)?;
    }
    Ok(ResolvedTree { entries })
}

fn push_path(root: &Path, path: &Path, entries: &mut Vec<ArchiveEntry>) -> Result<(), AgentError> {
    let meta = std::fs::metadata(path)?;
    if meta.is_dir() {
        entries.push(ArchiveEntry {
            abs: path.to_path_buf(),
            name: entry_name(root, path, true)?,
            is_dir: true,
            len: 0,
        });
        walk_dir(root, path, entries)
    } else {
        push_file(root, path, meta.len(), entries)
    }
}

fn push_file(
    root: &Path,
    path: &Path,
    len: u64,
    entries: &mut Vec<ArchiveEntry>,
) -> Result<(), AgentError> {
    entries.push(ArchiveEntry {
        abs: path.to_path_buf(),
        name: entry_name(root, path, false)?,
        is_dir: false,
        len,
    });
    Ok(())
}

/// Recursively collect `dir`'s children, names relative to `root`.
/// Children are visited in name order so archives are deterministic.
fn walk_dir(root: &Path, dir: &Path, entries: &mut Vec<ArchiveEntry>) -> Result<(), AgentError> {
    let mut children: Vec<PathBuf> = std::fs::read_dir(dir)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    children.sort();

    for child in children {
        let meta = std::fs::symlink_metadata(&child)?;
        if meta.is_dir() {
            entries.push(ArchiveEntry {
                abs: child.clone(),
                name: entry_name(root, &child, true)?,
                is_dir: true,
                len: 0,
            });
            walk_dir(root, &child, entries)?;
        } else {
            push_file(root, &child, meta.len(), entries)?;
        }
    }
    Ok(())
}

/// Archive name for `path` relative to `root`: `/`-separated, trailing
/// `/` on directories.
fn entry_name(root: &Path, path: &Path, is_dir: bool) -> Result<String, AgentError> {
    let rel = path.strip_prefix(root).map_err(|_| {
        AgentError::TransferProtocol(format!(
            "{} escapes transfer root {}",
            path.display(),
            root.display()
        ))
    })?;
    let mut name = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if is_dir {
        name.push('/');
    }
    Ok(name)
}

/// Stream the resolved tree as a tar archive into `writer`.
///
/// Returns the number of file content bytes written (headers excluded).
pub fn write_archive<W: Write>(writer: W, tree: &ResolvedTree) -> Result<u64, AgentError> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(true);
    let mut bytes = 0u64;

    for entry in &tree.entries {
        if entry.is_dir {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            header.set_mtime(0);
            header.set_cksum();
            builder.append_data(&mut header, &entry.name, std::io::empty())?;
        } else {
            let mut file = std::fs::File::open(&entry.abs)?;
            let len = file.metadata()?.len();
            builder.append_file(&entry.name, &mut file)?;
            bytes += len;
        }
    }

    builder.finish()?;
    Ok(bytes)
}

/// Extract a tar stream under `dest`, enforcing the overwrite policy.
///
/// Returns the decoded file content byte count. Entry names that are
/// absolute or climb out of `dest` fail the operation; with
/// `overwrite = false` any collision with an existing file fails before
/// that file is touched.
pub fn extract_archive<R: Read>(
    reader: R,
    dest: &Path,
    overwrite: bool,
) -> Result<u64, AgentError> {
    let mut archive = tar::Archive::new(reader);
    let mut bytes = 0u64;

    let entries = archive
        .entries()
        .map_err(|err| AgentError::TransferProtocol(format!("tar stream unreadable: {err}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|err| AgentError::TransferProtocol(format!("tar entry bad: {err}")))?;
        let name = entry
            .path()
            .map_err(|err| AgentError::TransferProtocol(format!("tar entry name bad: {err}")))?
            .into_owned();
        let rel = sanitize_entry_name(&name)?;
        let target = dest.join(&rel);

        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }

        if target.exists() && !overwrite {
            return Err(AgentError::TransferProtocol(format!(
                "refusing to overwrite {}",
                target.display()
            )));
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let size = entry.size();
        entry
            .unpack(&target)
            .map_err(|err| AgentError::TransferProtocol(format!("unpack failed: {err}")))?;
        if entry.header().entry_type().is_file() {
            bytes += size;
        }
    }
    Ok(bytes)
}

/// Reject absolute names and parent-directory escapes.
fn sanitize_entry_name(name: &Path) -> Result<PathBuf, AgentError> {
    let mut clean = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(AgentError::TransferProtocol(format!(
                    "unsafe archive entry name {}",
                    name.display()
                )));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(AgentError::TransferProtocol(
            "empty archive entry name".to_string(),
        ));
    }
    Ok(clean)
}
