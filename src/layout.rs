//! Well-known names in a project directory.
//!
//! Every path the orchestrator reads or writes is derived here, so the
//! segment naming scheme has exactly one parser and one formatter.
//! Segment directories follow the strict zero-padded `segment_NNN`
//! convention; looser "contains segment" matching is deliberately not
//! supported.

use std::path::{Path, PathBuf};

/// The persisted job state, relative to the project root.
pub const STATE_FILE: &str = ".segment_state.json";

/// Advisory lock file guarding against two orchestrators on one project.
pub const LOCK_FILE: &str = ".mdorch.lock";

/// Sentinel whose presence means the entire job is finished.
pub const COMPLETION_SENTINEL: &str = ".simulation_complete";

/// Merged final trajectory; also treated as proof of completion.
pub const FINAL_TRAJECTORY: &str = "final_trajectory.xtc";

/// Output file prefix the engine is given inside a segment directory.
pub const OUTPUT_PREFIX: &str = "md";

/// Engine log file inside a segment directory.
pub const SEGMENT_LOG: &str = "md.log";

/// Final structure the engine writes only on clean segment completion.
pub const FINAL_STRUCTURE: &str = "md_final.gro";

/// Engine job description file inside a segment directory.
pub const JOB_FILE: &str = "md.tpr";

/// Extension of engine checkpoint files.
pub const CHECKPOINT_EXT: &str = "cpt";

const SEGMENT_PREFIX: &str = "segment_";

/// Directory name for a segment index, e.g. `segment_007`.
pub fn segment_dir_name(index: usize) -> String {
    format!("{SEGMENT_PREFIX}{index:03}")
}

/// Parse a directory name back into a segment index.
///
/// Only the strict zero-padded form is accepted: the `segment_` prefix
/// followed by three or more ASCII digits and nothing else. Returns
/// `None` for anything looser.
pub fn parse_segment_dir_name(name: &str) -> Option<usize> {
    let digits = name.strip_prefix(SEGMENT_PREFIX)?;
    if digits.len() < 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Full path of a segment's working directory.
pub fn segment_dir(project_root: &Path, index: usize) -> PathBuf {
    project_root.join(segment_dir_name(index))
}

/// Output prefix path handed to the engine for a segment.
pub fn output_prefix(segment_dir: &Path) -> PathBuf {
    segment_dir.join(OUTPUT_PREFIX)
}

/// Path of the engine job file for a segment.
pub fn job_file(segment_dir: &Path) -> PathBuf {
    segment_dir.join(JOB_FILE)
}

/// Whether a file name looks like an engine checkpoint.
pub fn is_checkpoint_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(CHECKPOINT_EXT))
}
