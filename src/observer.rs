//! Progress observation.
//!
//! Reads a segment's working directory to answer three questions: does
//! the engine still appear to be writing, how far did it get in
//! simulated time, and has it logged anything alarming. The observer is
//! advisory — it never fails hard. Any I/O problem degrades to a
//! default snapshot with the issue recorded.

use crate::layout;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Phrases the engine writes only at the end of a clean run. Either one
/// present means the run is over.
const COMPLETION_PHRASES: [&str; 2] = ["Finished mdrun", "GROMACS reminds you"];

/// Case-insensitive substrings flagging error lines.
const ERROR_KEYWORDS: [&str; 10] = [
    "ERROR:",
    "Fatal error:",
    "Segmentation fault",
    "Core dumped",
    "Out of memory",
    "SIGSEGV",
    "SIGABRT",
    "Assertion failed",
    "invalid",
    "failed",
];

/// Case-insensitive substrings flagging warning lines.
const WARNING_KEYWORDS: [&str; 5] = [
    "LINCS WARNING",
    "WARN:",
    "WARNING:",
    "Pressure coupling",
    "Temperature coupling",
];

/// Cap on collected error/warning lines, to bound memory and the size
/// of anything forwarded to a notifier.
const MAX_REPORTED_LINES: usize = 10;

/// How far back in the log the step/time scan looks. The log is
/// append-only and monotonic in step number, so the tail is enough.
const TAIL_LINES: usize = 100;

/// What the log says about the engine, as far as it can be known from
/// files alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No log file found. This cannot distinguish "engine not yet
    /// started" from "log not yet created"; the segment descriptor's
    /// `started_at` timestamp is what disambiguates.
    Unknown,
    /// Log exists with no completion phrase.
    Running,
    /// A completion phrase is present.
    Finished,
}

/// Point-in-time read of a segment's progress. Recomputed on every poll,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub engine: EngineState,
    /// Most recent step number seen in the log tail.
    pub current_step: u64,
    /// Most recent simulated time seen, in nanoseconds.
    pub current_ns: f64,
    /// Log file the snapshot was read from, if one was found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// Error lines collected from the log, capped.
    pub errors: Vec<String>,
    /// Warning lines collected from the log, capped.
    pub warnings: Vec<String>,
    /// Problems observing (unreadable log and the like) — about the
    /// observation itself, not the simulation.
    pub issues: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    fn unknown() -> Self {
        Self {
            engine: EngineState::Unknown,
            current_step: 0,
            current_ns: 0.0,
            log_file: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            issues: Vec::new(),
            observed_at: Utc::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.engine == EngineState::Running
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Scans segment directories for engine progress.
pub struct ProgressObserver {
    step_line: Regex,
}

impl Default for ProgressObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver {
    pub fn new() -> Self {
        Self {
            // A bare "step time" pair: two numeric tokens on a line of
            // their own, as the engine prints them in the log body.
            step_line: Regex::new(r"^\s*(\d+)\s+([\d.]+)\s*$").unwrap(),
        }
    }

    /// Observe a segment's working directory. Never fails: missing or
    /// unreadable files produce a degraded snapshot with the issue
    /// recorded in `issues`.
    pub fn observe(&self, segment_dir: &Path) -> ProgressSnapshot {
        let mut snapshot = ProgressSnapshot::unknown();

        let Some(log_file) = find_log_file(segment_dir) else {
            return snapshot;
        };
        snapshot.log_file = Some(log_file.clone());

        let content = match fs::read_to_string(&log_file) {
            Ok(content) => content,
            Err(e) => {
                debug!(log = %log_file.display(), error = %e, "Could not read engine log");
                snapshot
                    .issues
                    .push(format!("could not read {}: {e}", log_file.display()));
                return snapshot;
            }
        };

        snapshot.engine = if COMPLETION_PHRASES
            .iter()
            .any(|phrase| content.contains(phrase))
        {
            EngineState::Finished
        } else {
            EngineState::Running
        };

        let lines: Vec<&str> = content.lines().collect();
        let tail_start = lines.len().saturating_sub(TAIL_LINES);
        for line in &lines[tail_start..] {
            if let Some(caps) = self.step_line.captures(line) {
                if let (Ok(step), Ok(ns)) = (caps[1].parse::<u64>(), caps[2].parse::<f64>()) {
                    // Last match wins; the log is monotonic in step.
                    snapshot.current_step = step;
                    snapshot.current_ns = ns;
                }
            }
        }

        collect_flagged_lines(&lines, &mut snapshot);
        snapshot
    }
}

/// Find the engine log in a segment directory: the well-known name
/// first, otherwise the first `*.log` whose name contains "md".
fn find_log_file(segment_dir: &Path) -> Option<PathBuf> {
    let preferred = segment_dir.join(layout::SEGMENT_LOG);
    if preferred.exists() {
        return Some(preferred);
    }

    let entries = fs::read_dir(segment_dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "log")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.to_lowercase().contains("md"))
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

fn collect_flagged_lines(lines: &[&str], snapshot: &mut ProgressSnapshot) {
    for line in lines {
        let lower = line.to_lowercase();

        if snapshot.warnings.len() < MAX_REPORTED_LINES
            && WARNING_KEYWORDS
                .iter()
                .any(|kw| lower.contains(&kw.to_lowercase()))
        {
            snapshot.warnings.push(truncate(line));
        }

        if snapshot.errors.len() < MAX_REPORTED_LINES
            && !lower.contains("warning")
            && ERROR_KEYWORDS
                .iter()
                .any(|kw| lower.contains(&kw.to_lowercase()))
        {
            snapshot.errors.push(truncate(line));
        }
    }
}

fn truncate(line: &str) -> String {
    line.trim().chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_log(dir: &Path, content: &str) {
        fs::write(dir.join("md.log"), content).unwrap();
    }

    #[test]
    fn missing_directory_is_unknown_not_error() {
        let observer = ProgressObserver::new();
        let snap = observer.observe(Path::new("/nonexistent/segment_000"));
        assert_eq!(snap.engine, EngineState::Unknown);
        assert_eq!(snap.current_step, 0);
        assert!(snap.errors.is_empty());
    }

    #[test]
    fn missing_log_is_unknown() {
        let dir = tempdir().unwrap();
        let observer = ProgressObserver::new();
        let snap = observer.observe(dir.path());
        assert_eq!(snap.engine, EngineState::Unknown);
        assert!(snap.log_file.is_none());
    }

    #[test]
    fn log_without_completion_phrase_means_running() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), "           Step           Time\n  5000   10.00000\n");
        let snap = ProgressObserver::new().observe(dir.path());
        assert_eq!(snap.engine, EngineState::Running);
    }

    #[test]
    fn either_completion_phrase_means_finished() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), "  5000   10.0\nFinished mdrun on rank 0\n");
        assert_eq!(
            ProgressObserver::new().observe(dir.path()).engine,
            EngineState::Finished
        );

        write_log(dir.path(), "  5000   10.0\nGROMACS reminds you: ...\n");
        assert_eq!(
            ProgressObserver::new().observe(dir.path()).engine,
            EngineState::Finished
        );
    }

    #[test]
    fn last_step_time_pair_wins() {
        let dir = tempdir().unwrap();
        write_log(
            dir.path(),
            "   1000   2.00000\nsome text\n   2000   4.00000\n   3000   6.00000\n",
        );
        let snap = ProgressObserver::new().observe(dir.path());
        assert_eq!(snap.current_step, 3000);
        assert!((snap.current_ns - 6.0).abs() < 1e-9);
    }

    #[test]
    fn step_scan_only_reads_the_tail() {
        let dir = tempdir().unwrap();
        let mut content = String::from("   111   0.5\n");
        for _ in 0..200 {
            content.push_str("filler line\n");
        }
        content.push_str("   999   9.9\n");
        write_log(dir.path(), &content);

        let snap = ProgressObserver::new().observe(dir.path());
        assert_eq!(snap.current_step, 999);
    }

    #[test]
    fn error_and_warning_lines_are_collected() {
        let dir = tempdir().unwrap();
        write_log(
            dir.path(),
            "   100   1.0\nFatal error: something exploded\nLINCS WARNING relative constraint deviation\n",
        );
        let snap = ProgressObserver::new().observe(dir.path());
        assert_eq!(snap.errors.len(), 1);
        assert!(snap.errors[0].contains("Fatal error"));
        assert_eq!(snap.warnings.len(), 1);
        assert!(snap.has_errors());
    }

    #[test]
    fn warning_lines_are_not_double_counted_as_errors() {
        let dir = tempdir().unwrap();
        // "WARNING" contains no error keyword double-hit; an error
        // keyword on a warning line must stay a warning only.
        write_log(dir.path(), "WARNING: constraint failed slightly\n");
        let snap = ProgressObserver::new().observe(dir.path());
        assert!(snap.errors.is_empty());
        assert_eq!(snap.warnings.len(), 1);
    }

    #[test]
    fn collected_lines_are_capped() {
        let dir = tempdir().unwrap();
        let mut content = String::new();
        for i in 0..50 {
            content.push_str(&format!("ERROR: problem number {i}\n"));
        }
        write_log(dir.path(), &content);
        let snap = ProgressObserver::new().observe(dir.path());
        assert_eq!(snap.errors.len(), 10);
    }

    #[test]
    fn falls_back_to_md_named_log() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("md_prod.log"), "  10   0.02\n").unwrap();
        fs::write(dir.path().join("notes.log"), "  99   9.9\n").unwrap();
        let snap = ProgressObserver::new().observe(dir.path());
        assert_eq!(
            snap.log_file.as_deref(),
            Some(dir.path().join("md_prod.log").as_path())
        );
        assert_eq!(snap.current_step, 10);
    }
}
