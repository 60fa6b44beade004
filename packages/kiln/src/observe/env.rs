//! The processor's environment: how observations are read and how policy
//! failures are answered.
//!
//! The processor is generic over the observation type so that the same
//! typing logic serves two callers: post-execution processing consumes
//! [`RawObservation`]s from the sandbox, cache-lookup processing replays
//! [`PathSetEntry`]s from a stored path set. The environments differ in
//! what an out-of-policy access means: a policy violation after
//! execution, a plain mismatch during lookup.

use std::collections::HashMap;

use lazy_regex::regex::Regex;
use tracing::warn;

use crate::{
    path::PathId,
    pip::GraphPip,
};

use super::{
    ObservationFlags, ObservationStatus, ObservedInput, RawObservation, pathset::PathSetEntry,
};

/// What to do with an observation that failed the access-policy check.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AccessCheckResult {
    /// Record the failure and degrade the pip's status.
    Fail,
    /// Drop the observation and continue.
    Suppress,
}

/// Capability set the processor requires of its caller.
pub trait ObservationEnvironment: Send + Sync {
    type Observation: Send + Sync;

    fn path_of(&self, observation: &Self::Observation) -> PathId;

    fn flags_of(&self, observation: &Self::Observation) -> ObservationFlags;

    fn is_search_path_enumeration(&self, observation: &Self::Observation) -> bool {
        self.flags_of(observation).search_path
    }

    fn enumerate_pattern_regex(&self, observation: &Self::Observation) -> Option<Regex>;

    /// Whether this run reconstructs a stored path set. Cache-lookup runs
    /// never elide absent probes and report policy failures as mismatches.
    fn is_cache_lookup(&self) -> bool;

    fn on_access_check_failure(&self, pip: &GraphPip, path: PathId) -> AccessCheckResult;

    /// The status a failed access check degrades the pip to.
    fn access_failure_status(&self) -> ObservationStatus {
        if self.is_cache_lookup() {
            ObservationStatus::Mismatched
        } else {
            ObservationStatus::Aborted
        }
    }

    fn on_allowing_undeclared_access(&self, _pip: &GraphPip, _path: PathId) {}

    fn report_unexpected_access(&self, _pip: &GraphPip, _path: PathId) {}

    /// Veto point for each typed observation before it enters the path set.
    fn check_proposed_observed_input(
        &self,
        _pip: &GraphPip,
        _input: &ObservedInput,
    ) -> ObservationStatus {
        ObservationStatus::Success
    }

    /// Accessed file names recorded alongside a stored path set. Replay
    /// must filter search-path enumerations with the names the original
    /// run referenced, not the (possibly elided) entries that survived.
    fn stored_accessed_names(&self) -> Option<&[String]> {
        None
    }
}

/// Environment for processing sandbox reports after a pip executed.
#[derive(Debug, Default)]
pub struct PostExecutionEnv {
    /// Directories the sandbox reported as search-path enumerations.
    pub search_path_dirs: std::collections::HashSet<PathId>,
    /// Enumeration patterns declared per directory.
    pub patterns: HashMap<PathId, Regex>,
    /// Suppress out-of-policy observations instead of failing the pip.
    pub suppress_policy_failures: bool,
}

impl ObservationEnvironment for PostExecutionEnv {
    type Observation = RawObservation;

    fn path_of(&self, observation: &RawObservation) -> PathId {
        observation.path
    }

    fn flags_of(&self, observation: &RawObservation) -> ObservationFlags {
        observation.flags
    }

    fn is_search_path_enumeration(&self, observation: &RawObservation) -> bool {
        observation.flags.search_path || self.search_path_dirs.contains(&observation.path)
    }

    fn enumerate_pattern_regex(&self, observation: &RawObservation) -> Option<Regex> {
        self.patterns.get(&observation.path).cloned()
    }

    fn is_cache_lookup(&self) -> bool {
        false
    }

    fn on_access_check_failure(&self, _pip: &GraphPip, _path: PathId) -> AccessCheckResult {
        if self.suppress_policy_failures {
            AccessCheckResult::Suppress
        } else {
            AccessCheckResult::Fail
        }
    }

    fn report_unexpected_access(&self, pip: &GraphPip, path: PathId) {
        warn!(pip = %pip.pip.display_name(), ?path, "unexpected file access");
    }
}

/// Environment for replaying a stored path set during cache lookup.
///
/// Patterns arrive as text in the stored entries; they are compiled once at
/// construction so replay cannot fail mid-pass.
#[derive(Debug, Default)]
pub struct CacheLookupEnv {
    patterns: HashMap<PathId, Regex>,
    accessed_names: Vec<String>,
}

impl CacheLookupEnv {
    pub fn new(entries: &[(PathId, PathSetEntry)], accessed_names: Vec<String>) -> Self {
        let mut patterns = HashMap::new();
        for (path, entry) in entries {
            if let Some(pattern) = &entry.enumerate_pattern {
                match Regex::new(pattern) {
                    Ok(compiled) => {
                        patterns.insert(*path, compiled);
                    }
                    Err(err) => {
                        warn!(?pattern, %err, "stored enumeration pattern does not compile");
                    }
                }
            }
        }
        Self {
            patterns,
            accessed_names,
        }
    }
}

impl ObservationEnvironment for CacheLookupEnv {
    type Observation = (PathId, PathSetEntry);

    fn path_of(&self, observation: &Self::Observation) -> PathId {
        observation.0
    }

    fn flags_of(&self, observation: &Self::Observation) -> ObservationFlags {
        observation.1.flags
    }

    fn enumerate_pattern_regex(&self, observation: &Self::Observation) -> Option<Regex> {
        self.patterns.get(&observation.0).cloned()
    }

    fn is_cache_lookup(&self) -> bool {
        true
    }

    fn on_access_check_failure(&self, _pip: &GraphPip, _path: PathId) -> AccessCheckResult {
        // A stored path set that no longer fits policy is simply not a hit.
        AccessCheckResult::Fail
    }

    fn stored_accessed_names(&self) -> Option<&[String]> {
        Some(&self.accessed_names)
    }
}
