//! Zip bundle extraction into a scratch directory.
//!
//! Every member path is validated before anything is written: a single
//! member escaping the destination rejects the whole archive.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::PublishError;

/// Scratch directory owned by one publish call. Removed on drop, so every
/// exit path of the call cleans it up.
#[derive(Debug)]
pub struct Staging {
    dir: TempDir,
}

impl Staging {
    pub fn new() -> Result<Self, PublishError> {
        let dir = tempfile::Builder::new()
            .prefix("bi-publish-")
            .tempdir()
            .map_err(|e| PublishError::io(std::env::temp_dir(), e))?;
        debug!(path = %dir.path().display(), "Created staging directory");
        Ok(Staging { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Files below the staging directory with the given extension, sorted
    /// by path.
    pub fn files_with_extension(&self, extension: &str) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(self.path())
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .map(|e| e.to_string_lossy().eq_ignore_ascii_case(extension))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files
    }
}

/// Extracts `container` into a fresh [`Staging`] directory.
pub fn extract_to_staging(container: &Path) -> Result<Staging, PublishError> {
    let staging = Staging::new()?;
    extract(container, staging.path())?;
    Ok(staging)
}

/// Extracts every member of the zip at `container` below `dest`, keeping the
/// directory structure and, on unix, the stored permissions. Returns the
/// written file paths.
pub fn extract(container: &Path, dest: &Path) -> Result<Vec<PathBuf>, PublishError> {
    let file = fs::File::open(container).map_err(|e| PublishError::io(container, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|source| PublishError::Archive {
        path: container.to_path_buf(),
        source,
    })?;
    let archive_err = |source| PublishError::Archive {
        path: container.to_path_buf(),
        source,
    };

    let mut targets = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(archive_err)?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| PublishError::PathTraversal {
                member: entry.name().to_string(),
                dest: dest.to_path_buf(),
            })?;
        targets.push(dest.join(relative));
    }

    fs::create_dir_all(dest).map_err(|e| PublishError::io(dest, e))?;
    let mut written = Vec::new();
    for (i, target) in targets.into_iter().enumerate() {
        let mut entry = archive.by_index(i).map_err(archive_err)?;
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| PublishError::io(&target, e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| PublishError::io(parent, e))?;
        }
        let mut out = fs::File::create(&target).map_err(|e| PublishError::io(&target, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| PublishError::io(&target, e))?;
        // Staged files stay owner-writable: workbook members are rewritten in place.
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode | 0o200))
                .map_err(|e| PublishError::io(&target, e))?;
        }
        written.push(target);
    }

    info!(
        container = %container.display(),
        dest = %dest.display(),
        files = written.len(),
        "Extracted bundle"
    );
    Ok(written)
}
