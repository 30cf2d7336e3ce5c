//! Upload intake: validation and sandboxed placement.
//!
//! Files land under `<uploads_root>/<project>/<scope>/<uuid>.<ext>`. After
//! the write, the file's canonical path must still lie strictly beneath the
//! canonical uploads root; if anything (symlinked directories, traversal in
//! inputs) moved it outside, the write is rolled back and the request fails.
//! Clients only ever see `{id, original_name}`.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::db::uploads::UploadRef;
use crate::db::Database;
use crate::error::UploadError;

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const TEXT_PROBE_BYTES: usize = 4096;
const MAX_CONTROL_OUTLIERS: usize = 8;

/// Declared MIME -> stored extension. Anything else is refused.
const MIME_WHITELIST: &[(&str, &str)] = &[
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("text/plain", "txt"),
    ("text/markdown", "md"),
    ("application/json", "json"),
    ("text/csv", "csv"),
];

/// What the client gets back. The server path stays server-side.
#[derive(Debug, Clone)]
pub struct UploadHandle {
    pub id: String,
    pub original_name: String,
}

pub struct UploadStore {
    root: PathBuf,
    store: Database,
}

impl UploadStore {
    pub fn new(root: PathBuf, store: Database) -> Self {
        Self { root, store }
    }

    /// Validate, write, confine, record. Any failure after the write removes
    /// the file again.
    pub async fn save(
        &self,
        project_alias: &str,
        scope_id: &str,
        original_name: &str,
        declared_mime: &str,
        bytes: &[u8],
    ) -> Result<UploadHandle, UploadError> {
        let ext = validate_content(declared_mime, bytes)?;

        let dir = self.root.join(project_alias).join(scope_id);
        std::fs::create_dir_all(&dir)?;
        let file_name = format!("{}.{ext}", Uuid::new_v4());
        let path = dir.join(&file_name);
        std::fs::write(&path, bytes)?;

        if let Err(e) = confine(&self.root, &path) {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        let row = self
            .store
            .insert_upload_ref(project_alias, original_name, &path.to_string_lossy())
            .await
            .map_err(|e| {
                let _ = std::fs::remove_file(&path);
                UploadError::Database(e)
            })?;
        Ok(UploadHandle {
            id: row.id,
            original_name: row.original_name,
        })
    }

    /// Record an externally written file, applying the same confinement.
    pub async fn create_reference(
        &self,
        project_alias: &str,
        original_name: &str,
        server_path: &Path,
    ) -> Result<UploadRef, UploadError> {
        confine(&self.root, server_path)?;
        Ok(self
            .store
            .insert_upload_ref(project_alias, original_name, &server_path.to_string_lossy())
            .await?)
    }

    pub async fn resolve(&self, id: &str) -> Result<Option<UploadRef>, UploadError> {
        Ok(self.store.get_upload_ref(id).await?)
    }

    pub async fn mark_consumed(&self, id: &str) -> Result<bool, UploadError> {
        Ok(self.store.mark_upload_consumed(id).await?)
    }

    /// Remove one scope's directory tree (a task finished with its uploads).
    pub async fn cleanup_scope_dir(
        &self,
        project_alias: &str,
        scope_id: &str,
    ) -> Result<(), UploadError> {
        let dir = self.root.join(project_alias).join(scope_id);
        if !dir.exists() {
            return Ok(());
        }
        confine(&self.root, &dir)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::Io(e)),
        }
    }
}

/// Canonical path must be strictly beneath the canonical uploads root.
fn confine(root: &Path, candidate: &Path) -> Result<(), UploadError> {
    let canonical_root = root.canonicalize().map_err(|_| UploadError::PathEscape)?;
    let canonical = candidate
        .canonicalize()
        .map_err(|_| UploadError::PathEscape)?;
    if canonical.starts_with(&canonical_root) && canonical != canonical_root {
        Ok(())
    } else {
        Err(UploadError::PathEscape)
    }
}

/// Size, MIME whitelist, and per-family content checks. Returns the stored
/// extension.
pub fn validate_content(declared_mime: &str, bytes: &[u8]) -> Result<&'static str, UploadError> {
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(UploadError::TooLarge {
            size: bytes.len(),
            max: MAX_UPLOAD_BYTES,
        });
    }
    let Some((mime, ext)) = MIME_WHITELIST
        .iter()
        .find(|(mime, _)| *mime == declared_mime)
    else {
        return Err(UploadError::MimeNotAllowed {
            mime: declared_mime.to_string(),
        });
    };

    if mime.starts_with("image/") {
        let sniffed = sniff_image(bytes);
        if sniffed != Some(*mime) {
            return Err(UploadError::SignatureMismatch {
                mime: declared_mime.to_string(),
            });
        }
    } else {
        check_texty(bytes)?;
    }
    Ok(ext)
}

/// Content-signature sniffing for the allowed image formats.
fn sniff_image(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]) {
        Some("image/png")
    } else if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Text family rule: no NUL, and fewer than 8 control-char outliers in the
/// first 4 KiB.
fn check_texty(bytes: &[u8]) -> Result<(), UploadError> {
    let probe = &bytes[..bytes.len().min(TEXT_PROBE_BYTES)];
    let mut outliers = 0usize;
    for &b in probe {
        if b == 0 {
            return Err(UploadError::InvalidText {
                reason: "contains NUL byte".to_string(),
            });
        }
        if b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t' {
            outliers += 1;
            if outliers >= MAX_CONTROL_OUTLIERS {
                return Err(UploadError::InvalidText {
                    reason: format!("{outliers}+ control characters in first 4KiB"),
                });
            }
        }
    }
    Ok(())
}
