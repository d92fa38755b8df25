// Workspace Manager
//
// Each judging run gets its own directory under the configured root. The
// directory name combines a process-wide monotonic sequence number with a
// random suffix, so concurrent acquisitions can never pick the same path.
//
// A Workspace removes its directory when released or dropped, whichever
// comes first. Cleanup failures are logged and counted, never returned.

use crate::metrics;
use anyhow::{bail, Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static WORKSPACE_SEQ: AtomicU64 = AtomicU64::new(0);

const MAX_ACQUIRE_ATTEMPTS: usize = 8;
const MAX_LABEL_CHARS: usize = 36;

pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Create a manager rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create workspace root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn next_id(&self, submission_id: &str) -> String {
        let seq = WORKSPACE_SEQ.fetch_add(1, Ordering::Relaxed);
        let random = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{:08}-{}", sanitize_label(submission_id), seq, &random[..16])
    }

    /// Allocate a fresh, empty directory for one submission.
    pub async fn acquire(&self, submission_id: &str) -> Result<Workspace> {
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let id = self.next_id(submission_id);
            let path = self.root.join(&id);

            // create_dir (not create_dir_all) fails on an existing path
            match tokio::fs::create_dir(&path).await {
                Ok(()) => {
                    metrics::ACTIVE_WORKSPACES.inc();
                    debug!(workspace = %id, path = %path.display(), "Workspace acquired");
                    return Ok(Workspace {
                        id,
                        root_path: path,
                        created_files: Vec::new(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    warn!(workspace = %id, "Workspace path collision, retrying");
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to create workspace {}", path.display())
                    });
                }
            }
        }
        bail!(
            "Could not allocate a unique workspace after {} attempts",
            MAX_ACQUIRE_ATTEMPTS
        )
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(MAX_LABEL_CHARS)
        .collect();
    if cleaned.is_empty() {
        "submission".to_string()
    } else {
        cleaned
    }
}

/// An isolated directory owned by exactly one judging run.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    root_path: PathBuf,
    created_files: Vec<PathBuf>,
    released: bool,
}

impl Workspace {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.root_path
    }

    pub fn created_files(&self) -> &[PathBuf] {
        &self.created_files
    }

    /// Write `contents` to `path`, which must lie inside this workspace.
    pub async fn write_file(&mut self, path: &Path, contents: &str) -> Result<()> {
        if path.parent() != Some(self.root_path.as_path()) {
            bail!(
                "Refusing to write {} outside workspace {}",
                path.display(),
                self.root_path.display()
            );
        }
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.created_files.push(path.to_path_buf());
        Ok(())
    }

    /// Remove the workspace directory. Returns whether removal succeeded;
    /// failures are logged, not propagated.
    pub async fn release(mut self) -> bool {
        if !self.mark_released() {
            return true;
        }
        let removal = tokio::fs::remove_dir_all(&self.root_path).await;
        self.report_removal(removal)
    }

    /// Returns false if the workspace was already released.
    fn mark_released(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        metrics::ACTIVE_WORKSPACES.dec();
        true
    }

    fn report_removal(&self, removal: std::io::Result<()>) -> bool {
        match removal {
            Ok(()) => {
                debug!(
                    workspace = %self.id,
                    files = self.created_files.len(),
                    "Workspace released"
                );
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(workspace = %self.id, "Workspace already removed");
                true
            }
            Err(e) => {
                metrics::WORKSPACE_CLEANUP_FAILURES.inc();
                warn!(
                    workspace = %self.id,
                    path = %self.root_path.display(),
                    error = %e,
                    "Failed to remove workspace"
                );
                false
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // Covers early returns, cancellation and panics; no runtime to await on here
        if self.mark_released() {
            let removal = std::fs::remove_dir_all(&self.root_path);
            self.report_removal(removal);
        }
    }
}
