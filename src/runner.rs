//! The orchestration loop.
//!
//! Ties the components together: plan → persist → resolve → execute →
//! observe → update, repeated until every segment is completed or a
//! fatal condition halts the loop. Ordering is strict: a segment's
//! terminal status must be durably committed before the next segment
//! may start, and a failed state save halts further starts.

use crate::backend::BackendSelector;
use crate::config::JobConfig;
use crate::controller::{ExecutionController, ProgressCallback, RunOutcome};
use crate::errors::{RunError, StateError};
use crate::layout;
use crate::lock::ProjectLock;
use crate::notify::{JobEvent, Notifier};
use crate::planner::plan;
use crate::resolver::{self, ResumeResolver};
use crate::state::{JobState, SegmentStatus, StateStore};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How a full orchestration run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// All segments completed and the completion sentinel was written.
    Completed,
    /// A stop was requested; the job resumes cleanly on the next run.
    Stopped,
}

enum SegmentRun {
    Completed,
    Stopped,
}

/// Drives a segmented simulation job to completion.
pub struct JobRunner {
    root: PathBuf,
    config: JobConfig,
    store: StateStore,
    resolver: ResumeResolver,
    controller: ExecutionController,
    backend: Arc<dyn BackendSelector>,
    notifier: Arc<dyn Notifier>,
}

impl JobRunner {
    pub fn new(
        project_root: &Path,
        config: JobConfig,
        backend: Arc<dyn BackendSelector>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, RunError> {
        config.validate()?;
        Ok(Self {
            root: project_root.to_path_buf(),
            store: StateStore::new(project_root),
            resolver: ResumeResolver::new(project_root),
            controller: ExecutionController::new(config.poll_interval(), config.stop_grace()),
            config,
            backend,
            notifier,
        })
    }

    /// Run segments until the job completes, a stop is requested, or a
    /// fatal error halts the loop. Holds the project lock for the whole
    /// run; a second orchestrator on the same project fails fast.
    ///
    /// The resume point is re-derived from disk on every iteration —
    /// the persisted state may be stale relative to a crash, the
    /// filesystem is not.
    pub async fn run(&self, cancel: CancellationToken) -> Result<JobOutcome, RunError> {
        let _lock = ProjectLock::acquire(&self.root)?;
        let mut state = self.load_or_plan()?;

        loop {
            if cancel.is_cancelled() {
                return Ok(JobOutcome::Stopped);
            }
            if self.resolver.is_complete() {
                info!("Completion marker present, nothing to do");
                return Ok(JobOutcome::Completed);
            }

            let resume = self.resolver.resolve()?;
            let (target, checkpoint) = match resume {
                Some(info) => (info.segment_index, info.checkpoint_file),
                None => (0, None),
            };

            let segment_count = state.segments.len();
            if target >= segment_count {
                state = self.reconcile(state, segment_count)?;
                self.finalize(&state)?;
                return Ok(JobOutcome::Completed);
            }

            state = self.reconcile(state, target)?;

            match self.run_segment(&state, target, checkpoint, &cancel).await? {
                SegmentRun::Completed => {
                    state = self.store.load()?;
                }
                SegmentRun::Stopped => return Ok(JobOutcome::Stopped),
            }
        }
    }

    /// Load persisted state, or plan from scratch on first run. A
    /// corrupt state file propagates as an error — it is not silently
    /// re-planned over.
    fn load_or_plan(&self) -> Result<JobState, RunError> {
        match self.store.load() {
            Ok(state) => {
                if (state.total_ns - self.config.total_ns).abs() > 1e-9
                    || (state.segment_ns - self.config.segment_ns).abs() > 1e-9
                {
                    warn!(
                        persisted_total = state.total_ns,
                        config_total = self.config.total_ns,
                        "Persisted durations differ from config, using persisted plan"
                    );
                }
                Ok(state)
            }
            Err(StateError::NotFound { .. }) => {
                let segments = plan(&self.root, self.config.total_ns, self.config.segment_ns)?;
                let state =
                    JobState::new(self.config.total_ns, self.config.segment_ns, segments);
                self.store.save(&state)?;
                info!(segments = state.segments.len(), "Planned new job");
                Ok(state)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Bring persisted intent in line with observed reality: segments
    /// before the resume target are completed on disk, and any stale
    /// `Running` or `Completed` mark at or beyond the target is demoted
    /// to `Pending`. This is the designed reclassification path for a
    /// segment left `Running` by a crash or stop — not a guess.
    fn reconcile(&self, mut state: JobState, target: usize) -> Result<JobState, RunError> {
        let mut changed = false;
        for segment in &mut state.segments {
            if segment.index < target {
                if segment.status != SegmentStatus::Completed {
                    info!(
                        segment = segment.index,
                        was = %segment.status,
                        "Disk shows segment complete, updating state"
                    );
                    segment.status = SegmentStatus::Completed;
                    changed = true;
                }
            } else if matches!(
                segment.status,
                SegmentStatus::Running | SegmentStatus::Completed
            ) {
                info!(
                    segment = segment.index,
                    was = %segment.status,
                    "Reclassifying stale segment status from disk state"
                );
                segment.status = SegmentStatus::Pending;
                changed = true;
            }
        }
        if changed {
            self.store.save(&state)?;
        }
        Ok(state)
    }

    async fn run_segment(
        &self,
        state: &JobState,
        index: usize,
        mut checkpoint: Option<PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<SegmentRun, RunError> {
        let descriptor = state
            .segment(index)
            .ok_or(StateError::UnknownSegment { index })?
            .clone();

        let max_attempts = self.config.max_segment_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Ok(SegmentRun::Stopped);
            }

            // The running transition must be durably committed before
            // the engine starts, or a crash loses the in-flight segment.
            self.store
                .update_segment(index, SegmentStatus::Running, None)?;
            self.notifier.notify(&JobEvent::SegmentStarted {
                index,
                start_ns: descriptor.start_ns,
                end_ns: descriptor.end_ns,
                resumed_from_checkpoint: checkpoint.is_some(),
            });

            let invocation = self.backend.build_invocation(
                &layout::job_file(&descriptor.dir),
                &layout::output_prefix(&descriptor.dir),
                checkpoint.as_deref(),
                self.config.checkpoint_interval_minutes,
            );

            let notifier = Arc::clone(&self.notifier);
            let on_progress: ProgressCallback = Box::new(move |snapshot| {
                notifier.notify(&JobEvent::SegmentProgress {
                    index,
                    current_step: snapshot.current_step,
                    current_ns: snapshot.current_ns,
                });
            });

            let handle = self
                .controller
                .run(invocation, cancel.child_token(), on_progress)?;

            match handle.wait().await? {
                RunOutcome::Stopped => {
                    // Persisted status stays `Running`; the resolver
                    // reclassifies it from disk artifacts on the next
                    // invocation.
                    return Ok(SegmentRun::Stopped);
                }
                RunOutcome::Completed => {
                    if descriptor.dir.join(layout::FINAL_STRUCTURE).exists() {
                        let recorded = resolver::latest_checkpoint(&descriptor.dir)?;
                        self.store
                            .update_segment(index, SegmentStatus::Completed, recorded)?;
                        self.notifier.notify(&JobEvent::SegmentCompleted {
                            index,
                            simulated_ns: descriptor.duration_ns(),
                        });
                        return Ok(SegmentRun::Completed);
                    }
                    last_error =
                        "engine exited cleanly but wrote no final structure".to_string();
                }
                RunOutcome::Failed { code } => {
                    last_error = format!("engine exited with code {code}");
                }
            }

            warn!(segment = index, attempt, error = %last_error, "Segment attempt failed");
            self.store.record_failure(index, &last_error)?;
            self.notifier.notify(&JobEvent::SegmentFailed {
                index,
                error: last_error.clone(),
                attempt,
            });

            if attempt < max_attempts {
                // Re-resolve before retrying: a checkpoint written
                // before the failure is still usable progress.
                checkpoint = self.resolver.resolve()?.and_then(|info| {
                    (info.segment_index == index)
                        .then_some(info.checkpoint_file)
                        .flatten()
                });
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(SegmentRun::Stopped),
                    _ = tokio::time::sleep(self.config.retry_backoff()) => {}
                }
            }
        }

        self.notifier.notify(&JobEvent::JobHalted {
            reason: format!("segment {index} failed after {max_attempts} attempts"),
        });
        Err(RunError::RetriesExhausted {
            segment: index,
            attempts: max_attempts,
            last_error,
        })
    }

    /// Write the completion sentinel once every segment's output has
    /// been validated, and announce the job.
    fn finalize(&self, state: &JobState) -> Result<(), RunError> {
        let sentinel = self.root.join(layout::COMPLETION_SENTINEL);
        std::fs::write(&sentinel, Utc::now().to_rfc3339()).map_err(|source| {
            StateError::Io {
                path: sentinel.clone(),
                source,
            }
        })?;
        info!(total_ns = state.total_ns, "All segments complete");
        self.notifier.notify(&JobEvent::JobCompleted {
            total_ns: state.total_ns,
        });
        Ok(())
    }

    /// Remove unusable partial segment directories. Delegates to the
    /// resolver's rules: anything holding a checkpoint survives.
    pub fn cleanup_incomplete(&self) -> Result<Vec<PathBuf>, RunError> {
        Ok(self.resolver.cleanup_incomplete()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendSelector, EngineInvocation};
    use crate::notify::NullNotifier;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Fake engine: a shell script that mimics the real engine's file
    /// behavior — writes a log, optionally a checkpoint and a final
    /// structure — then exits with a scripted code.
    struct ScriptedBackend {
        scripts: Mutex<Vec<String>>,
        fallback: String,
    }

    impl ScriptedBackend {
        fn completing() -> Self {
            Self {
                scripts: Mutex::new(Vec::new()),
                fallback: format!(
                    "printf '  100   1.0\\nFinished mdrun\\n' > {log}; touch {gro}; exit 0",
                    log = layout::SEGMENT_LOG,
                    gro = layout::FINAL_STRUCTURE
                ),
            }
        }

        fn with_scripts(scripts: Vec<String>, fallback: &str) -> Self {
            Self {
                scripts: Mutex::new(scripts),
                fallback: fallback.to_string(),
            }
        }
    }

    impl BackendSelector for ScriptedBackend {
        fn build_invocation(
            &self,
            job_file: &std::path::Path,
            _output_prefix: &std::path::Path,
            _checkpoint: Option<&std::path::Path>,
            _checkpoint_interval_minutes: u32,
        ) -> EngineInvocation {
            let mut scripts = self.scripts.lock().unwrap();
            let script = if scripts.is_empty() {
                self.fallback.clone()
            } else {
                scripts.remove(0)
            };
            EngineInvocation {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script],
                working_dir: job_file.parent().unwrap().to_path_buf(),
            }
        }
    }

    fn fast_config(total: f64, segment: f64) -> JobConfig {
        let mut config = JobConfig::new(total, segment);
        config.poll_interval_secs = 1;
        config.retry_backoff_secs = 0;
        config
    }

    fn runner(root: &Path, config: JobConfig, backend: ScriptedBackend) -> JobRunner {
        JobRunner::new(
            root,
            config,
            Arc::new(backend),
            Arc::new(NullNotifier),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn completes_all_segments_and_writes_sentinel() {
        let dir = tempdir().unwrap();
        let runner = runner(
            dir.path(),
            fast_config(30.0, 10.0),
            ScriptedBackend::completing(),
        );

        let outcome = runner.run(CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);
        assert!(dir.path().join(layout::COMPLETION_SENTINEL).exists());

        let state = StateStore::new(dir.path()).load().unwrap();
        assert!(state.is_all_completed());
        assert_eq!(state.segments.len(), 3);
    }

    #[tokio::test]
    async fn second_run_on_completed_job_is_a_no_op() {
        let dir = tempdir().unwrap();
        let config = fast_config(10.0, 10.0);
        let first = runner(dir.path(), config.clone(), ScriptedBackend::completing());
        first.run(CancellationToken::new()).await.unwrap();

        // The scripted engine would now fail loudly if invoked again.
        let second = runner(
            dir.path(),
            config,
            ScriptedBackend::with_scripts(vec![], "exit 9"),
        );
        let outcome = second.run(CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn retries_failed_segment_then_succeeds() {
        let dir = tempdir().unwrap();
        let succeed = format!(
            "printf 'Finished mdrun\\n' > {log}; touch {gro}; exit 0",
            log = layout::SEGMENT_LOG,
            gro = layout::FINAL_STRUCTURE
        );
        let backend = ScriptedBackend::with_scripts(vec!["exit 7".to_string()], &succeed);
        let runner = runner(dir.path(), fast_config(10.0, 10.0), backend);

        let outcome = runner.run(CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let state = StateStore::new(dir.path()).load().unwrap();
        assert_eq!(state.segments[0].retries, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_halt_with_error() {
        let dir = tempdir().unwrap();
        let mut config = fast_config(10.0, 10.0);
        config.max_segment_retries = 1;
        let backend = ScriptedBackend::with_scripts(vec![], "exit 5");
        let runner = runner(dir.path(), config, backend);

        let err = runner.run(CancellationToken::new()).await.unwrap_err();
        match err {
            RunError::RetriesExhausted {
                segment, attempts, ..
            } => {
                assert_eq!(segment, 0);
                assert_eq!(attempts, 2);
            }
            other => panic!("Expected RetriesExhausted, got {other}"),
        }

        let state = StateStore::new(dir.path()).load().unwrap();
        assert_eq!(state.segments[0].status, SegmentStatus::Failed);
        assert!(state.segments[0].error.as_deref().unwrap().contains("5"));
    }

    #[tokio::test]
    async fn clean_exit_without_final_structure_counts_as_failure() {
        let dir = tempdir().unwrap();
        let mut config = fast_config(10.0, 10.0);
        config.max_segment_retries = 0;
        // Exit 0 but never write the final structure.
        let backend = ScriptedBackend::with_scripts(vec![], "exit 0");
        let runner = runner(dir.path(), config, backend);

        let err = runner.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunError::RetriesExhausted { .. }));
        assert!(err.to_string().contains("no final structure"));
    }

    #[tokio::test]
    async fn resumes_past_segments_already_complete_on_disk() {
        let dir = tempdir().unwrap();
        let config = fast_config(30.0, 10.0);

        // A prior run completed segments 0 and 1 on disk, but the state
        // file still shows segment 1 running (crash before the save).
        {
            let segments = plan(dir.path(), 30.0, 10.0).unwrap();
            let mut state = JobState::new(30.0, 10.0, segments);
            state.segments[0].status = SegmentStatus::Completed;
            state.segments[1].status = SegmentStatus::Running;
            StateStore::new(dir.path()).save(&state).unwrap();
        }
        for i in 0..2 {
            let seg = layout::segment_dir(dir.path(), i);
            fs::create_dir_all(&seg).unwrap();
            fs::write(seg.join(layout::FINAL_STRUCTURE), "gro").unwrap();
        }

        let runner = runner(dir.path(), config, ScriptedBackend::completing());
        let outcome = runner.run(CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let state = StateStore::new(dir.path()).load().unwrap();
        assert!(state.is_all_completed());
    }

    #[tokio::test]
    async fn concurrent_runner_on_same_project_is_rejected() {
        let dir = tempdir().unwrap();
        let _lock = ProjectLock::acquire(dir.path()).unwrap();

        let runner = runner(
            dir.path(),
            fast_config(10.0, 10.0),
            ScriptedBackend::completing(),
        );
        let err = runner.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunError::Lock(_)));
    }

    #[tokio::test]
    async fn pre_cancelled_token_stops_before_starting_anything() {
        let dir = tempdir().unwrap();
        let runner = runner(
            dir.path(),
            fast_config(10.0, 10.0),
            ScriptedBackend::completing(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = runner.run(cancel).await.unwrap();
        assert_eq!(outcome, JobOutcome::Stopped);
        assert!(!dir.path().join(layout::COMPLETION_SENTINEL).exists());
    }
}
