//! Host-side checks and copies of disk image files.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Image file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Image file does not have the .img extension: {path}")]
    WrongExtension { path: PathBuf },

    #[error("Working copy '{path}' is the base image itself")]
    SameFile { path: PathBuf },

    #[error("Failed to copy image '{from}' to '{to}': {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolve `path` to an absolute path of an existing `.img` file.
pub fn validate_image(path: &Path) -> Result<PathBuf, ImageError> {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    if !absolute.is_file() {
        return Err(ImageError::NotFound { path: absolute });
    }
    if absolute.extension().and_then(|e| e.to_str()) != Some("img") {
        return Err(ImageError::WrongExtension { path: absolute });
    }
    Ok(absolute)
}

/// `<dir>/<stem>-<suffix>.img` next to `base`.
pub fn derived_copy_path(base: &Path, suffix: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    base.with_file_name(format!("{}-{}.img", stem, suffix))
}

/// Resolve symlinks and relative segments; a missing file is resolved
/// through its parent directory.
fn resolved(path: &Path) -> PathBuf {
    if let Ok(real) = std::fs::canonicalize(path) {
        return real;
    }
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    if let (Some(dir), Some(name)) = (absolute.parent(), absolute.file_name()) {
        if let Ok(dir) = std::fs::canonicalize(dir) {
            return dir.join(name);
        }
    }
    absolute
}

/// Copy `base` to `dest` so provisioning never mutates the base image.
pub fn prepare_working_copy(base: &Path, dest: &Path) -> Result<PathBuf, ImageError> {
    let base = validate_image(base)?;
    if resolved(&base) == resolved(dest) {
        return Err(ImageError::SameFile { path: base });
    }
    tracing::info!("Copying {} -> {}", base.display(), dest.display());
    std::fs::copy(&base, dest).map_err(|source| ImageError::Copy {
        from: base.clone(),
        to: dest.to_path_buf(),
        source,
    })?;
    validate_image(dest)
}
