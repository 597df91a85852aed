//! Resume resolution.
//!
//! The resolver re-derives the resume point from the filesystem rather
//! than trusting the persisted job state, because the state file itself
//! can be stale after a crash. Segment directories, final-structure
//! files and checkpoints are the ground truth; the persisted state is
//! only intent.

use crate::errors::ResolveError;
use crate::layout;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

/// How the next engine invocation should continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Continue mid-segment from a checkpoint artifact.
    Checkpoint,
    /// Start the segment from its initial structure; no prior progress
    /// within the segment is credited.
    Restart,
}

/// The computed resume point. Ephemeral — recomputed from disk each
/// time it is needed, never cached or persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeInfo {
    pub segment_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_file: Option<PathBuf>,
    pub mode: ResumeMode,
}

/// Reconstructs a consistent resume point from on-disk artifacts.
pub struct ResumeResolver {
    root: PathBuf,
}

impl ResumeResolver {
    pub fn new(project_root: &Path) -> Self {
        Self {
            root: project_root.to_path_buf(),
        }
    }

    /// Whether the whole job is done: the completion sentinel exists,
    /// or a merged final trajectory does.
    pub fn is_complete(&self) -> bool {
        self.root.join(layout::COMPLETION_SENTINEL).exists()
            || self.root.join(layout::FINAL_TRAJECTORY).exists()
    }

    /// Determine where execution must continue.
    ///
    /// Returns `Ok(None)` when there is nothing to resume — either the
    /// job is complete or no segment has ever run (fresh start at
    /// segment 0). Otherwise:
    /// - max-index segment has its final structure → resume at the
    ///   *next* index, no checkpoint;
    /// - it has a checkpoint → resume the *same* index from the newest
    ///   checkpoint by modification time;
    /// - it has neither → re-run the same index from scratch.
    ///
    /// An index gap in the on-disk segment directories is surfaced as
    /// `AmbiguousState` rather than guessed at.
    pub fn resolve(&self) -> Result<Option<ResumeInfo>, ResolveError> {
        if self.is_complete() {
            info!(root = %self.root.display(), "Job already complete");
            return Ok(None);
        }

        let indices = self.segment_indices()?;
        let Some(&max_index) = indices.last() else {
            info!("No segment directories found, starting fresh");
            return Ok(None);
        };

        if indices.len() != max_index + 1 {
            return Err(ResolveError::AmbiguousState {
                message: format!(
                    "segment directories are not contiguous: found {} of expected {}",
                    indices.len(),
                    max_index + 1
                ),
            });
        }

        let seg_dir = layout::segment_dir(&self.root, max_index);
        if seg_dir.join(layout::FINAL_STRUCTURE).exists() {
            info!(segment = max_index, "Last segment complete, advancing");
            return Ok(Some(ResumeInfo {
                segment_index: max_index + 1,
                checkpoint_file: None,
                mode: ResumeMode::Restart,
            }));
        }

        match latest_checkpoint(&seg_dir)? {
            Some(checkpoint) => {
                info!(
                    segment = max_index,
                    checkpoint = %checkpoint.display(),
                    "Interrupted segment has a checkpoint, resuming from it"
                );
                Ok(Some(ResumeInfo {
                    segment_index: max_index,
                    checkpoint_file: Some(checkpoint),
                    mode: ResumeMode::Checkpoint,
                }))
            }
            None => {
                warn!(
                    segment = max_index,
                    "Interrupted segment left no usable artifacts, restarting it"
                );
                Ok(Some(ResumeInfo {
                    segment_index: max_index,
                    checkpoint_file: None,
                    mode: ResumeMode::Restart,
                }))
            }
        }
    }

    /// Remove segment directories that hold neither a final structure
    /// nor a checkpoint — unusable partial state. A directory with a
    /// checkpoint is never removed, whatever else it is missing.
    ///
    /// Returns the directories that were removed.
    pub fn cleanup_incomplete(&self) -> Result<Vec<PathBuf>, ResolveError> {
        let mut removed = Vec::new();
        for index in self.segment_indices()? {
            let seg_dir = layout::segment_dir(&self.root, index);
            let has_final = seg_dir.join(layout::FINAL_STRUCTURE).exists();
            let has_checkpoint = latest_checkpoint(&seg_dir)?.is_some();
            if has_final || has_checkpoint {
                continue;
            }
            info!(dir = %seg_dir.display(), "Cleaning up incomplete segment directory");
            fs::remove_dir_all(&seg_dir).map_err(|source| ResolveError::Io {
                path: seg_dir.clone(),
                source,
            })?;
            removed.push(seg_dir);
        }
        Ok(removed)
    }

    /// Sorted segment indices for directories matching the strict
    /// `segment_NNN` scheme. Anything looser is ignored.
    fn segment_indices(&self) -> Result<Vec<usize>, ResolveError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ResolveError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut indices: Vec<usize> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(layout::parse_segment_dir_name)
            })
            .collect();
        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }
}

/// Newest checkpoint file in a directory by modification time. The
/// engine rewrites the same checkpoint repeatedly and may keep a
/// backup-rotated pair, so mtime is the tie-break, not filename order.
pub fn latest_checkpoint(segment_dir: &Path) -> Result<Option<PathBuf>, ResolveError> {
    let entries = match fs::read_dir(segment_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ResolveError::Io {
                path: segment_dir.to_path_buf(),
                source,
            });
        }
    };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_checkpoint = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(layout::is_checkpoint_file);
        if !is_checkpoint {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().is_none_or(|(t, _)| mtime > *t) {
            newest = Some((mtime, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}
