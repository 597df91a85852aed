//! Segment planning.
//!
//! Pure computation: given total and per-segment durations, derive the
//! ordered list of segment descriptors. No I/O — the same inputs always
//! produce the same plan, which is what makes re-planning after a crash
//! safe.

use crate::errors::PlanError;
use crate::layout;
use crate::state::{SegmentDescriptor, SegmentStatus};
use std::path::Path;

/// Number of segments needed to cover `total_ns` in `segment_ns` slices.
pub fn segment_count(total_ns: f64, segment_ns: f64) -> usize {
    (total_ns / segment_ns).ceil().max(1.0) as usize
}

/// Derive the full ordered segment plan.
///
/// Segment `i` covers `[i * segment_ns, min((i + 1) * segment_ns,
/// total_ns))`; the final segment is clamped to the total duration. All
/// segments start `Pending` with their working directory under
/// `project_root`.
pub fn plan(
    project_root: &Path,
    total_ns: f64,
    segment_ns: f64,
) -> Result<Vec<SegmentDescriptor>, PlanError> {
    if !total_ns.is_finite() || total_ns <= 0.0 {
        return Err(PlanError::InvalidConfiguration {
            message: format!("total_ns must be positive, got {total_ns}"),
        });
    }
    if !segment_ns.is_finite() || segment_ns <= 0.0 {
        return Err(PlanError::InvalidConfiguration {
            message: format!("segment_ns must be positive, got {segment_ns}"),
        });
    }

    let count = segment_count(total_ns, segment_ns);
    let segments = (0..count)
        .map(|i| {
            let start_ns = i as f64 * segment_ns;
            let end_ns = ((i + 1) as f64 * segment_ns).min(total_ns);
            SegmentDescriptor {
                index: i,
                start_ns,
                end_ns,
                status: SegmentStatus::Pending,
                started_at: None,
                finished_at: None,
                checkpoint_file: None,
                dir: layout::segment_dir(project_root, i),
                error: None,
                retries: 0,
            }
        })
        .collect();
    Ok(segments)
}
