//! Engine backend selection and invocation building.
//!
//! The orchestration core treats the engine command line as a black
//! box: a `BackendSelector` turns a job file and output prefix into a
//! ready-to-spawn argv. The core only decides *whether* resume flags
//! are passed, never which flags.

use crate::layout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// GPU vendor reported by hardware detection (an external collaborator;
/// only its answer crosses this boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    None,
}

/// Which engine build and offload flags to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    GmxCuda,
    GmxSycl,
    GmxCpu,
}

impl BackendKind {
    /// Offload flags for this backend.
    pub fn offload_flags(&self) -> &'static [&'static str] {
        match self {
            BackendKind::GmxCuda => &["-nb", "gpu", "-pme", "gpu", "-bonded", "gpu"],
            BackendKind::GmxSycl => &["-nb", "gpu", "-pme", "gpu", "-bonded", "gpu"],
            BackendKind::GmxCpu => &["-nb", "cpu", "-pme", "cpu"],
        }
    }
}

/// Pick the backend for the detected GPU vendor.
pub fn select_backend(vendor: GpuVendor) -> BackendKind {
    let kind = match vendor {
        GpuVendor::Nvidia => BackendKind::GmxCuda,
        GpuVendor::Amd | GpuVendor::Intel => BackendKind::GmxSycl,
        GpuVendor::None => BackendKind::GmxCpu,
    };
    info!(?vendor, ?kind, "Selected engine backend");
    kind
}

/// An argv-equivalent description of one engine run, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl EngineInvocation {
    /// Single-line rendering for logs.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Builds a ready-to-spawn command for a segment run.
pub trait BackendSelector: Send + Sync {
    /// Build the invocation for one segment.
    ///
    /// `checkpoint` carries the checkpoint artifact when the run should
    /// continue mid-segment; `None` means a fresh start from the
    /// segment's initial structure.
    fn build_invocation(
        &self,
        job_file: &Path,
        output_prefix: &Path,
        checkpoint: Option<&Path>,
        checkpoint_interval_minutes: u32,
    ) -> EngineInvocation;
}

/// GROMACS mdrun backend.
#[derive(Debug, Clone)]
pub struct GmxBackend {
    kind: BackendKind,
    program: String,
}

impl GmxBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            program: "gmx".to_string(),
        }
    }

    /// Override the engine binary (e.g. `gmx_mpi`, a wrapper script).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }
}

impl BackendSelector for GmxBackend {
    fn build_invocation(
        &self,
        job_file: &Path,
        output_prefix: &Path,
        checkpoint: Option<&Path>,
        checkpoint_interval_minutes: u32,
    ) -> EngineInvocation {
        let working_dir = job_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        // The resolver treats this exact file as the segment-done signal.
        let final_structure = working_dir.join(layout::FINAL_STRUCTURE);

        let mut args = vec![
            "mdrun".to_string(),
            "-s".to_string(),
            job_file.to_string_lossy().into_owned(),
            "-deffnm".to_string(),
            output_prefix.to_string_lossy().into_owned(),
            "-c".to_string(),
            final_structure.to_string_lossy().into_owned(),
            "-cpt".to_string(),
            checkpoint_interval_minutes.to_string(),
        ];
        args.extend(self.kind.offload_flags().iter().map(|s| s.to_string()));

        if let Some(checkpoint) = checkpoint {
            args.push("-cpi".to_string());
            args.push(checkpoint.to_string_lossy().into_owned());
        }

        EngineInvocation {
            program: self.program.clone(),
            args,
            working_dir,
        }
    }
}
