//! Tool result offloading: move bulky results to disk, leave a reference.
//!
//! Tool results are the single largest context consumer in an agent loop.
//! Most of that bulk is irrelevant once the model has read it, but unlike
//! outright eviction, offloading keeps the data recoverable: the full text
//! lands in a store file and the message keeps a one-line reference the
//! model (or the compactor) can follow to read it back.
//!
//! The store never reaches outside its root. Every restore and delete
//! first proves the path resolves inside the root directory; a reference
//! pointing elsewhere is left alone and the file untouched.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tracing::debug;

/// Prefix of the in-history reference to an offloaded tool result.
///
/// The reference writer, the "already offloaded?" check, and the parser
/// all use this constant so they can't drift out of sync.
pub const OFFLOAD_REFERENCE_PREFIX: &str = "Tool result is at: ";

/// Render the reference line stored in place of an offloaded result.
pub fn offload_reference(path: &Path) -> String {
    format!("{OFFLOAD_REFERENCE_PREFIX}{}", path.display())
}

/// Parse a reference line back into its path.
///
/// Returns `None` for ordinary text. Recognizing a reference says nothing
/// about whether the path is safe; callers must still check
/// [`OffloadStore::contains`] before touching the file.
pub fn parse_offload_reference(text: &str) -> Option<PathBuf> {
    let rest = text.strip_prefix(OFFLOAD_REFERENCE_PREFIX)?.trim();
    if rest.is_empty() {
        return None;
    }
    Some(PathBuf::from(rest))
}

/// Generate a unique file stem for an offloaded result.
fn generate_offload_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // Use a counter to handle sub-nanosecond calls.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("of-{ts:x}-{count:04x}")
}

/// Flat on-disk store for offloaded tool results.
///
/// One directory, one file per result. JSON object payloads get a `.json`
/// extension so downstream tooling can tell them apart; everything else
/// is `.txt`.
#[derive(Debug, Clone)]
pub struct OffloadStore {
    root: PathBuf,
}

impl OffloadStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// The root is canonicalized so containment checks are not fooled by
    /// symlinks in the configured path.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, String> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| format!("failed to create offload store at {}: {e}", root.display()))?;
        let root = root
            .canonicalize()
            .map_err(|e| format!("failed to canonicalize {}: {e}", root.display()))?;
        Ok(Self { root })
    }

    /// The canonical store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write one result to a fresh file and return its path.
    pub async fn offload(&self, text: &str) -> Result<PathBuf, String> {
        let extension = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) if value.is_object() => "json",
            _ => "txt",
        };
        let path = self.root.join(format!("{}.{extension}", generate_offload_id()));
        tokio::fs::write(&path, text)
            .await
            .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
        debug!(path = %path.display(), chars = text.chars().count(), "offloaded tool result");
        Ok(path)
    }

    /// Read an offloaded result back.
    ///
    /// Refuses paths that do not resolve inside the store root.
    pub async fn restore(&self, path: &Path) -> Result<String, String> {
        if !self.contains(path) {
            return Err(format!("path escapes store root: {}", path.display()));
        }
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("failed to read {}: {e}", path.display()))
    }

    /// Every file currently in the store.
    pub async fn list(&self) -> Result<Vec<PathBuf>, String> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| format!("failed to list {}: {e}", self.root.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| format!("failed to list {}: {e}", self.root.display()))?
        {
            let path = entry.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Delete one offloaded file.
    ///
    /// Refuses paths that do not resolve inside the store root.
    pub async fn remove(&self, path: &Path) -> Result<(), String> {
        if !self.contains(path) {
            return Err(format!("path escapes store root: {}", path.display()));
        }
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| format!("failed to remove {}: {e}", path.display()))
    }

    /// Whether `path` resolves strictly inside the store root.
    ///
    /// Existing paths are canonicalized, so symlinks pointing out of the
    /// root are rejected. Non-existent paths are checked lexically and
    /// must not contain `..` components.
    pub fn contains(&self, path: &Path) -> bool {
        match path.canonicalize() {
            Ok(resolved) => resolved.starts_with(&self.root),
            Err(_) => {
                path.starts_with(&self.root)
                    && !path.components().any(|c| matches!(c, Component::ParentDir))
            }
        }
    }
}
