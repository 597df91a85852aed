//! Job event notification.
//!
//! Fire-and-forget: the core reports lifecycle events and never awaits
//! or depends on the notifier's result. Transports (messaging, email)
//! live outside this crate behind the `Notifier` trait.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Lifecycle events emitted by the orchestration loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    SegmentStarted {
        index: usize,
        start_ns: f64,
        end_ns: f64,
        resumed_from_checkpoint: bool,
    },
    SegmentProgress {
        index: usize,
        current_step: u64,
        current_ns: f64,
    },
    SegmentCompleted {
        index: usize,
        simulated_ns: f64,
    },
    SegmentFailed {
        index: usize,
        error: String,
        attempt: u32,
    },
    JobCompleted {
        total_ns: f64,
    },
    JobHalted {
        reason: String,
    },
}

/// Receives job events. Implementations must not block the control
/// loop; anything slow belongs on the implementation's own task.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &JobEvent);
}

/// Default notifier: structured log events only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &JobEvent) {
        match event {
            JobEvent::SegmentStarted {
                index,
                start_ns,
                end_ns,
                resumed_from_checkpoint,
            } => info!(
                segment = index,
                start_ns, end_ns, resumed_from_checkpoint, "Segment started"
            ),
            JobEvent::SegmentProgress {
                index,
                current_step,
                current_ns,
            } => info!(segment = index, current_step, current_ns, "Segment progress"),
            JobEvent::SegmentCompleted {
                index,
                simulated_ns,
            } => info!(segment = index, simulated_ns, "Segment completed"),
            JobEvent::SegmentFailed {
                index,
                error,
                attempt,
            } => warn!(segment = index, attempt, %error, "Segment failed"),
            JobEvent::JobCompleted { total_ns } => info!(total_ns, "Job completed"),
            JobEvent::JobHalted { reason } => warn!(%reason, "Job halted"),
        }
    }
}

/// Discards every event. Useful in tests.
#[derive(Debug, Default, Clone)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: &JobEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Collects events for assertions.
    pub struct RecordingNotifier(pub Mutex<Vec<JobEvent>>);

    impl Notifier for RecordingNotifier {
        fn notify(&self, event: &JobEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let event = JobEvent::SegmentCompleted {
            index: 2,
            simulated_ns: 10.0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"segment_completed\""));
        let back: JobEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn recording_notifier_captures_events() {
        let notifier = RecordingNotifier(Mutex::new(Vec::new()));
        notifier.notify(&JobEvent::JobCompleted { total_ns: 30.0 });
        assert_eq!(notifier.0.lock().unwrap().len(), 1);
    }
}
