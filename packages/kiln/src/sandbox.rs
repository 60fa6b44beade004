//! Inbound sandbox contract.
//!
//! The process sandbox is an external collaborator; it delivers file-access
//! reports, lifecycle events, and a terminating status per pip run. This
//! module owns the wire types and the ingestion step that turns raw
//! reports into deduplicated [`RawObservation`]s sorted by expanded path,
//! which is the order the observed-input processor contract requires.

use color_eyre::Result;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

use crate::{
    observe::{ObservationFlags, RawObservation},
    path::{PathId, PathTable},
};

/// What the process did to a path.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, strum::Display, Serialize, Deserialize)]
pub enum AccessOperation {
    Read,
    Probe,
    Enumerate,
    Write,
}

/// Whether the path existed at access time, as far as the sandbox knows.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub enum ReportedExistence {
    Existed,
    Absent,
    #[default]
    Unknown,
}

/// One file access observed by the sandbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileAccessReport {
    pub path: String,
    pub operation: AccessOperation,
    pub allowed: bool,
    pub existed: ReportedExistence,
}

/// Process lifecycle, for diagnostics and rusage accounting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ProcessLifecycleEvent {
    Started { pid: u32 },
    Exited { pid: u32, exit_code: i32 },
}

/// The terminating status of a sandboxed run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SandboxOutcome {
    pub exit_code: i32,
    pub user_time_ms: u64,
    pub system_time_ms: u64,
    pub peak_memory_bytes: u64,
}

/// Everything the sandbox delivers for one pip run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SandboxedRun {
    pub accesses: Vec<FileAccessReport>,
    pub events: Vec<ProcessLifecycleEvent>,
    pub outcome: SandboxOutcome,
}

/// Ingested accesses: read-like observations for the processor, written
/// paths for output reporting.
#[derive(Debug, Default)]
pub struct IngestedAccesses {
    /// Deduplicated observations in expanded-path order.
    pub observations: Vec<RawObservation>,
    /// Paths the process wrote.
    pub writes: Vec<PathId>,
}

/// Turn raw reports into canonical observations.
///
/// Reports for the same path merge: an enumeration and a read of one path
/// produce a single observation carrying both flags, and a read always
/// wins over a bare probe.
#[instrument(skip_all, fields(reports = run.accesses.len()))]
pub fn ingest(run: &SandboxedRun, paths: &PathTable) -> Result<IngestedAccesses> {
    let mut merged: std::collections::HashMap<PathId, ObservationFlags> =
        std::collections::HashMap::new();
    let mut writes = Vec::new();

    for report in &run.accesses {
        let path = paths.intern(&report.path)?;
        if report.operation == AccessOperation::Write {
            writes.push(path);
            continue;
        }
        let flags = match report.operation {
            AccessOperation::Read => ObservationFlags::read(),
            AccessOperation::Probe => ObservationFlags::probe(),
            AccessOperation::Enumerate => ObservationFlags::enumerate(),
            AccessOperation::Write => unreachable!("writes diverted above"),
        };
        let entry = merged.entry(path).or_default();
        entry.directory_location |= flags.directory_location;
        entry.enumeration |= flags.enumeration;
        entry.hashing_required |= flags.hashing_required;
        entry.file_probe |= flags.file_probe;
        if entry.hashing_required {
            entry.file_probe = false;
        }
    }

    let observations: Vec<RawObservation> = merged
        .into_iter()
        .map(|(path, flags)| RawObservation { path, flags })
        .sorted_by(|a, b| paths.cmp_expanded(a.path, b.path))
        .collect();
    writes.sort_by(|a, b| paths.cmp_expanded(*a, *b));
    writes.dedup();
    trace!(
        observations = observations.len(),
        writes = writes.len(),
        "ingested sandbox reports"
    );
    Ok(IngestedAccesses {
        observations,
        writes,
    })
}
