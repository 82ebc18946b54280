//! Document storage: resolve a document id to its stored bytes.
//!
//! Uploaded documents live under a fixed convention,
//! `<storage_root>/<document_id>.<extension>`. Any backend that can "read
//! bytes by id" can stand in for the file system by implementing
//! [`DocumentStore`].

use crate::error::DocflowError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

static DOCUMENT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9._-]*$").expect("static regex"));

/// Read-only access to stored documents.
///
/// Implementations must be safe to call concurrently for different ids.
pub trait DocumentStore: Send + Sync {
    /// Deterministic location of the document, used in logs and errors.
    fn locate(&self, document_id: &str) -> Result<PathBuf, DocflowError>;

    /// Read the full document. Missing or unreadable → [`DocflowError::NotFound`].
    fn read(&self, document_id: &str) -> Result<Vec<u8>, DocflowError>;
}

/// Check that a document id maps onto a single file name.
///
/// Rejects empty ids, path separators and ids starting with `.` (which also
/// rules out `..`).
pub fn validate_document_id(document_id: &str) -> Result<(), DocflowError> {
    if DOCUMENT_ID.is_match(document_id) {
        Ok(())
    } else {
        Err(DocflowError::InvalidDocumentId {
            id: document_id.to_string(),
        })
    }
}

/// File-system store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
    extension: String,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl DocumentStore for FsDocumentStore {
    fn locate(&self, document_id: &str) -> Result<PathBuf, DocflowError> {
        validate_document_id(document_id)?;
        Ok(self
            .root
            .join(format!("{}.{}", document_id, self.extension)))
    }

    fn read(&self, document_id: &str) -> Result<Vec<u8>, DocflowError> {
        let path = self.locate(document_id)?;
        match std::fs::read(&path) {
            Ok(bytes) => {
                debug!("Read {} bytes from {}", bytes.len(), path.display());
                Ok(bytes)
            }
            // Permission errors are reported as NotFound too: the analyzer
            // only distinguishes "cannot get the bytes" from "bad bytes".
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                debug!("Permission denied reading {}", path.display());
                Err(DocflowError::NotFound { path })
            }
            Err(_) => Err(DocflowError::NotFound { path }),
        }
    }
}
