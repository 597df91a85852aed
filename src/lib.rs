//! Segmented execution and resume orchestration core for long-running
//! molecular dynamics simulations.
//!
//! A multi-nanosecond run is broken into bounded time segments, each
//! executed as one invocation of an external engine (a GROMACS-style
//! subprocess) and checkpointed, so the job survives interruption and
//! resumes exactly where it left off. Disk artifacts — checkpoint files,
//! log files, segment directories — are the ground truth for recovery;
//! the persisted job state records intent.

pub mod backend;
pub mod config;
pub mod controller;
pub mod errors;
pub mod layout;
pub mod lock;
pub mod notify;
pub mod observer;
pub mod planner;
pub mod resolver;
pub mod runner;
pub mod shutdown;
pub mod state;

pub use backend::{BackendKind, BackendSelector, EngineInvocation, GmxBackend, GpuVendor};
pub use config::JobConfig;
pub use controller::{ExecutionController, RunHandle, RunOutcome, RunState};
pub use errors::{EngineError, LockError, PlanError, ResolveError, RunError, StateError};
pub use notify::{JobEvent, LogNotifier, Notifier, NullNotifier};
pub use observer::{EngineState, ProgressObserver, ProgressSnapshot};
pub use resolver::{ResumeInfo, ResumeMode, ResumeResolver};
pub use runner::{JobOutcome, JobRunner};
pub use state::{JobState, SegmentDescriptor, SegmentStatus, StateStore};
