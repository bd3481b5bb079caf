//! Request validation: path confinement under the transfer roots, the upload
//! extension allow-list, and filesystem checks on the source or target.
//!
//! Everything here is synchronous and runs once at the start of a session,
//! before any file is opened or any ACK is sent.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::TransferError;

/// Extensions accepted for uploads unless overridden in the configuration.
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] =
    &[".txt", ".pdf", ".doc", ".docx", ".jpg", ".png", ".ul"];

/// Join the requested filename under `root`, rejecting any name that could
/// escape it. The check is lexical and never touches the filesystem; upload
/// targets do not exist yet.
pub fn resolve_under_root(root: &Path, filename: &str) -> Result<PathBuf, TransferError> {
    let relative = Path::new(filename);
    let confined = !filename.is_empty()
        && !relative.is_absolute()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !confined {
        return Err(TransferError::AccessDenied {
            detail: "Access violation",
        });
    }
    Ok(root.join(relative))
}

/// Uploads must end in one of the allowed extensions. The comparison is an
/// exact, case-sensitive suffix match.
pub fn check_extension(filename: &str, allowed: &[String]) -> Result<(), TransferError> {
    if allowed.iter().any(|ext| filename.ends_with(ext.as_str())) {
        Ok(())
    } else {
        Err(TransferError::InvalidExtension)
    }
}

/// A download source must exist and be a regular file.
pub fn check_download_source(path: &Path) -> Result<(), TransferError> {
    let meta = fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => TransferError::NotFound,
        _ => TransferError::AccessDenied {
            detail: "Access violation",
        },
    })?;
    if !meta.is_file() {
        return Err(TransferError::AccessDenied {
            detail: "Access violation",
        });
    }
    Ok(())
}

/// An upload target must not exist yet, and the write root must be a
/// directory we can create files in.
pub fn check_upload_target(path: &Path, write_root: &Path) -> Result<(), TransferError> {
    if path.exists() {
        return Err(TransferError::AlreadyExists);
    }
    let denied = TransferError::AccessDenied {
        detail: "Access violation: Cannot write to directory",
    };
    match fs::metadata(write_root) {
        Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => Ok(()),
        _ => Err(denied),
    }
}
