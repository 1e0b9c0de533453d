//! Confines requested filenames to a root directory.
//!
//! A filename is first normalised lexically, so a name that climbs out of
//! the root is refused before the filesystem is consulted at all. The
//! surviving path is then canonicalised and checked against the canonical
//! root, which catches symlinks pointing elsewhere.

use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

use crate::error::{Result, TftpError};
use crate::packet::ErrorCode;

fn access_violation(filename: &str, reason: &str) -> TftpError {
    warn!("Rejected path {:?}: {}", filename, reason);
    TftpError::Denied {
        code: ErrorCode::AccessViolation,
        message: "Access violation".to_string(),
    }
}

/// True when `err` came from the confinement check rather than from I/O.
pub fn is_violation(err: &TftpError) -> bool {
    matches!(
        err,
        TftpError::Denied {
            code: ErrorCode::AccessViolation,
            ..
        }
    )
}

/// The request filename as a path relative to the root, with `.` and `..`
/// resolved. Both separators are accepted and a leading separator is
/// ignored.
pub fn normalize(filename: &str) -> Result<PathBuf> {
    let cleaned = filename.replace('\\', "/");
    let mut relative = PathBuf::new();

    for component in Path::new(cleaned.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !relative.pop() {
                    return Err(access_violation(filename, "escapes the root"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(access_violation(filename, "absolute path"));
            }
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(access_violation(filename, "names the root itself"));
    }
    Ok(relative)
}

fn ensure_inside(resolved: &Path, root: &Path, filename: &str) -> Result<()> {
    if resolved.starts_with(root) {
        Ok(())
    } else {
        Err(access_violation(filename, "resolves outside the root"))
    }
}

/// Resolves an existing file to read.
pub fn resolve_read(root: &Path, filename: &str) -> Result<PathBuf> {
    let relative = normalize(filename)?;
    let canonical_root = root.canonicalize()?;

    let resolved = match canonical_root.join(&relative).canonicalize() {
        Ok(resolved) => resolved,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(TftpError::Denied {
                code: ErrorCode::FileNotFound,
                message: "File not found".to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    ensure_inside(&resolved, &canonical_root, filename)?;
    Ok(resolved)
}

/// Where an accepted upload is written.
#[derive(Debug)]
pub struct WriteTarget {
    pub path: PathBuf,
    created: Vec<PathBuf>,
}

impl WriteTarget {
    /// Directories made for this upload, deepest first.
    pub fn created_dirs(&self) -> &[PathBuf] {
        &self.created
    }
}

/// Resolves the destination of a write, creating missing parent
/// directories once the existing part of the path is known to be inside
/// the root.
pub fn resolve_write(root: &Path, filename: &str) -> Result<WriteTarget> {
    let relative = normalize(filename)?;
    let canonical_root = root.canonicalize()?;
    let target = canonical_root.join(&relative);

    let (parent, name) = match (target.parent(), target.file_name()) {
        (Some(parent), Some(name)) => (parent.to_path_buf(), name.to_os_string()),
        _ => return Err(access_violation(filename, "has no file name")),
    };

    let missing: Vec<PathBuf> = parent
        .ancestors()
        .take_while(|ancestor| !ancestor.exists())
        .map(Path::to_path_buf)
        .collect();
    let existing = parent
        .ancestors()
        .find(|ancestor| ancestor.exists())
        .unwrap_or(canonical_root.as_path());
    ensure_inside(&existing.canonicalize()?, &canonical_root, filename)?;

    std::fs::create_dir_all(&parent)?;
    let canonical_parent = parent.canonicalize()?;
    ensure_inside(&canonical_parent, &canonical_root, filename)?;

    Ok(WriteTarget {
        path: canonical_parent.join(name),
        created: missing,
    })
}
