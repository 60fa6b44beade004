//! Engine error taxonomy.
//!
//! Every user-visible failure class carries a stable numeric event id for
//! telemetry. Errors inside a single pip's observation processing do not use
//! this taxonomy directly; they flow through
//! [`ObservationStatus`](crate::observe::ObservationStatus) and only become
//! an [`EngineError`] when the pip as a whole is aborted.

use derive_more::{Display, Error};
use enum_assoc::Assoc;

/// Classified engine failure.
///
/// Variants map one-to-one to the failure classes surfaced to users:
/// configuration problems are reported before any pip runs, graph problems
/// are fatal at construction time, and the per-pip classes carry enough
/// context to name the offending pip and path.
#[derive(Clone, Debug, Display, Error, Assoc)]
#[func(pub fn event_id(&self) -> u16)]
#[func(pub fn is_fatal(&self) -> bool)]
pub enum EngineError {
    /// Malformed or contradictory configuration.
    #[display("configuration error: {reason}")]
    #[assoc(event_id = 2001, is_fatal = true)]
    Config { reason: String },

    /// Duplicate producer, cycle, or invalid seal contents.
    #[display("graph error: {reason}")]
    #[assoc(event_id = 2002, is_fatal = true)]
    Graph { reason: String },

    /// An observation lies outside the pip's declared dependencies and the
    /// pip does not allow undeclared reads.
    #[display("disallowed file access by {pip}: {path}")]
    #[assoc(event_id = 2003, is_fatal = false)]
    AccessPolicyViolation { pip: String, path: String },

    /// Content hashing failed.
    ///
    /// `retryable` is set when the host reported a transient error.
    #[display("failed to hash {path}: {reason}")]
    #[assoc(event_id = 2004, is_fatal = false)]
    HashFailure {
        path: String,
        reason: String,
        retryable: bool,
    },

    /// The cache backend is unreachable. Surfaced as a warning; the affected
    /// pip executes instead of replaying from cache.
    #[display("cache backend unavailable: {reason}")]
    #[assoc(event_id = 2005, is_fatal = false)]
    CacheInfrastructure { reason: String },

    /// An assertion failed while typing observations. Always includes the
    /// diagnostic triple so the failing state can be reconstructed.
    #[display("invariant violation for {pip} at {path}: {detail}")]
    #[assoc(event_id = 2006, is_fatal = true)]
    InternalInvariant {
        pip: String,
        path: String,
        detail: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ids_are_stable() {
        let err = EngineError::Config {
            reason: "x".into(),
        };
        assert_eq!(err.event_id(), 2001);
        let err = EngineError::AccessPolicyViolation {
            pip: "Pip1".into(),
            path: "/a".into(),
        };
        assert_eq!(err.event_id(), 2003);
        assert!(!err.is_fatal());
    }
}
