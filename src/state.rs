//! Persistent segment state.
//!
//! `JobState` is the durable record of what has run; `StateStore` is the
//! only component allowed to mutate it on disk. Every save goes through
//! a write-temp-then-rename sequence so a crash can never leave a
//! half-written state file behind.
//!
//! The store records *intent*; after a crash the resume resolver derives
//! *reality* from segment directories and artifacts, and the two are
//! reconciled by the runner.

use crate::errors::StateError;
use crate::layout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lifecycle status of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SegmentStatus {
    /// Whether the segment has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentStatus::Pending => write!(f, "pending"),
            SegmentStatus::Running => write!(f, "running"),
            SegmentStatus::Completed => write!(f, "completed"),
            SegmentStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One bounded slice of simulated time, executed as a single engine
/// invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Zero-based index; also the time order.
    pub index: usize,
    /// Start offset in simulated nanoseconds, inclusive.
    pub start_ns: f64,
    /// End offset in simulated nanoseconds, exclusive.
    pub end_ns: f64,
    pub status: SegmentStatus,
    /// Wall-clock time the engine was launched for this segment. Set on
    /// the transition to `Running`, so a missing log file can be told
    /// apart from a segment that never started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Wall-clock time the segment reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Checkpoint artifact recorded for this segment, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_file: Option<PathBuf>,
    /// The segment's working directory.
    pub dir: PathBuf,
    /// Error text from the most recent failure of this segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// How many times this segment has been retried after failure.
    #[serde(default)]
    pub retries: u32,
}

impl SegmentDescriptor {
    /// Simulated duration covered by this segment.
    pub fn duration_ns(&self) -> f64 {
        self.end_ns - self.start_ns
    }
}

/// The persisted aggregate: durations plus the ordered segment list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub total_ns: f64,
    pub segment_ns: f64,
    pub segments: Vec<SegmentDescriptor>,
}

impl JobState {
    pub fn new(total_ns: f64, segment_ns: f64, segments: Vec<SegmentDescriptor>) -> Self {
        Self {
            total_ns,
            segment_ns,
            segments,
        }
    }

    /// First pending segment, or a failed segment eligible for retry.
    pub fn next_runnable(&self) -> Option<&SegmentDescriptor> {
        self.segments
            .iter()
            .find(|s| s.status == SegmentStatus::Pending)
            .or_else(|| {
                self.segments
                    .iter()
                    .find(|s| s.status == SegmentStatus::Failed)
            })
    }

    /// The currently running segment, if any.
    pub fn current_running(&self) -> Option<&SegmentDescriptor> {
        self.segments
            .iter()
            .find(|s| s.status == SegmentStatus::Running)
    }

    pub fn segment(&self, index: usize) -> Option<&SegmentDescriptor> {
        self.segments.iter().find(|s| s.index == index)
    }

    pub fn completed_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Completed)
            .count()
    }

    pub fn is_all_completed(&self) -> bool {
        !self.segments.is_empty()
            && self
                .segments
                .iter()
                .all(|s| s.status == SegmentStatus::Completed)
    }

    /// Total simulated nanoseconds credited from completed segments.
    pub fn simulated_ns(&self) -> f64 {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Completed)
            .map(SegmentDescriptor::duration_ns)
            .sum()
    }

    /// Validate the structural invariants: indices are in order with no
    /// gaps, offsets are contiguous, the last segment ends at the total
    /// duration, and at most one segment is running.
    pub fn validate(&self) -> Result<(), StateError> {
        if self.segments.is_empty() {
            return Err(StateError::InvariantViolation {
                message: "job state has no segments".into(),
            });
        }
        let mut expected_start = 0.0_f64;
        for (i, segment) in self.segments.iter().enumerate() {
            if segment.index != i {
                return Err(StateError::InvariantViolation {
                    message: format!("segment at position {i} has index {}", segment.index),
                });
            }
            if (segment.start_ns - expected_start).abs() > 1e-9 {
                return Err(StateError::InvariantViolation {
                    message: format!(
                        "segment {i} starts at {} ns, expected {} ns",
                        segment.start_ns, expected_start
                    ),
                });
            }
            if segment.end_ns <= segment.start_ns {
                return Err(StateError::InvariantViolation {
                    message: format!("segment {i} has non-positive duration"),
                });
            }
            expected_start = segment.end_ns;
        }
        if (expected_start - self.total_ns).abs() > 1e-9 {
            return Err(StateError::InvariantViolation {
                message: format!(
                    "last segment ends at {expected_start} ns, expected {} ns",
                    self.total_ns
                ),
            });
        }
        let running = self
            .segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Running)
            .count();
        if running > 1 {
            return Err(StateError::AmbiguousState {
                message: format!("{running} segments marked running, at most one allowed"),
            });
        }
        Ok(())
    }
}

/// Durable storage for `JobState`, one file per project directory.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store for the state file under the given project root.
    pub fn new(project_root: &Path) -> Self {
        Self {
            path: project_root.join(layout::STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Persist the full state atomically: serialize to a temp file in
    /// the same directory, flush and sync it, then rename over the
    /// final path. Either the file reflects the new state or it retains
    /// the previous one.
    pub fn save(&self, state: &JobState) -> Result<(), StateError> {
        state.validate()?;

        let json = serde_json::to_string_pretty(state).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        let io_err = |source| StateError::Io {
            path: tmp_path.clone(),
            source,
        };

        let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), "Job state saved");
        Ok(())
    }

    /// Load and validate the persisted state. A missing file is
    /// `NotFound`; an unparsable one is `Corrupt` — callers must not
    /// confuse the two.
    pub fn load(&self) -> Result<JobState, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound {
                    path: self.path.clone(),
                });
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let state: JobState =
            serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        state.validate()?;
        Ok(state)
    }

    /// Read-modify-write a single segment's lifecycle under the same
    /// atomicity guarantee as `save`.
    ///
    /// A transition to `Running` is rejected while a different segment
    /// is persisted as running — there is one active execution slot.
    /// `Running` sets `started_at`; terminal states set `finished_at`.
    pub fn update_segment(
        &self,
        index: usize,
        status: SegmentStatus,
        checkpoint_file: Option<PathBuf>,
    ) -> Result<JobState, StateError> {
        let mut state = self.load()?;

        if status == SegmentStatus::Running {
            if let Some(running) = state.current_running() {
                if running.index != index {
                    return Err(StateError::AmbiguousState {
                        message: format!(
                            "cannot start segment {index} while segment {} is running",
                            running.index
                        ),
                    });
                }
            }
        }

        let segment = state
            .segments
            .iter_mut()
            .find(|s| s.index == index)
            .ok_or(StateError::UnknownSegment { index })?;

        let previous = segment.status;
        segment.status = status;
        match status {
            SegmentStatus::Running => {
                segment.started_at = Some(Utc::now());
                segment.finished_at = None;
                segment.error = None;
                if previous == SegmentStatus::Failed {
                    segment.retries += 1;
                }
            }
            SegmentStatus::Completed | SegmentStatus::Failed => {
                segment.finished_at = Some(Utc::now());
            }
            SegmentStatus::Pending => {
                segment.started_at = None;
                segment.finished_at = None;
            }
        }
        if checkpoint_file.is_some() {
            segment.checkpoint_file = checkpoint_file;
        }

        self.save(&state)?;
        Ok(state)
    }

    /// Record error text on a failed segment.
    pub fn record_failure(&self, index: usize, error: &str) -> Result<JobState, StateError> {
        let mut state = self.load()?;
        let segment = state
            .segments
            .iter_mut()
            .find(|s| s.index == index)
            .ok_or(StateError::UnknownSegment { index })?;
        segment.status = SegmentStatus::Failed;
        segment.finished_at = Some(Utc::now());
        segment.error = Some(error.to_string());
        self.save(&state)?;
        Ok(state)
    }
}
