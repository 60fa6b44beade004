//! Observation reclassification rules.
//!
//! A rule maps an already-typed observation to a different variant or drops
//! it entirely. Pip-specific rules run before global rules; the first match
//! wins. Rule definitions are hashed into static fingerprints so that a
//! rule change invalidates the cache.

use std::collections::BTreeSet;

use lazy_regex::regex::Regex;
use serde::{Deserialize, Serialize};

use crate::hash::FingerprintHasher;

/// The kind of a typed observation.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
pub enum ObservedInputKind {
    AbsentPathProbe,
    FileContentRead,
    ExistingFileProbe,
    ExistingDirectoryProbe,
    DirectoryEnumeration,
}

/// What a matching rule turns the observation into.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum ReclassificationTarget {
    /// Remove the observation from the path set entirely.
    Drop,
    /// Re-type the observation.
    As(ObservedInputKind),
}

/// A named reclassification rule.
#[derive(Clone, Debug)]
pub struct ReclassificationRule {
    pub name: String,
    pub pattern: Regex,
    /// Observation kinds the rule applies to; `None` applies to all.
    pub applies_to: Option<BTreeSet<ObservedInputKind>>,
    pub target: ReclassificationTarget,
}

impl ReclassificationRule {
    pub fn new(
        name: impl Into<String>,
        pattern: Regex,
        applies_to: Option<BTreeSet<ObservedInputKind>>,
        target: ReclassificationTarget,
    ) -> Self {
        Self {
            name: name.into(),
            pattern,
            applies_to,
            target,
        }
    }

    /// Whether the rule applies to an observation of `kind` at `path`.
    pub fn matches(&self, kind: ObservedInputKind, expanded_path: &str) -> bool {
        if let Some(applies) = &self.applies_to {
            if !applies.contains(&kind) {
                return false;
            }
        }
        self.pattern.is_match(expanded_path)
    }

    /// Stable digest of the rule definition, mixed into static
    /// fingerprints.
    pub fn definition_hash(&self) -> u64 {
        let mut hasher = FingerprintHasher::new();
        hasher
            .add_str("name", &self.name)
            .add_str("pattern", self.pattern.as_str());
        if let Some(applies) = &self.applies_to {
            hasher.add_collection("appliesTo", applies, |h, kind| {
                h.add_str("kind", &kind.to_string());
            });
        }
        hasher.add_str(
            "target",
            &match self.target {
                ReclassificationTarget::Drop => "drop".to_owned(),
                ReclassificationTarget::As(kind) => kind.to_string(),
            },
        );
        let digest = hasher.finish();
        u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
    }
}

/// Find the first matching rule, pip-specific rules first.
pub fn first_match<'a>(
    pip_rules: &'a [std::sync::Arc<ReclassificationRule>],
    global_rules: &'a [std::sync::Arc<ReclassificationRule>],
    kind: ObservedInputKind,
    expanded_path: &str,
) -> Option<&'a ReclassificationRule> {
    pip_rules
        .iter()
        .chain(global_rules.iter())
        .map(AsRef::as_ref)
        .find(|rule| rule.matches(kind, expanded_path))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lazy_regex::regex::Regex;
    use pretty_assertions::assert_eq;

    use super::*;

    fn drop_logs() -> ReclassificationRule {
        ReclassificationRule::new(
            "ignore logs",
            Regex::new(r"/tmp/.*\.log$").unwrap(),
            None,
            ReclassificationTarget::Drop,
        )
    }

    #[test]
    fn rules_match_by_path_and_kind() {
        let rule = ReclassificationRule::new(
            "reads only",
            Regex::new(r"\.tmp$").unwrap(),
            Some([ObservedInputKind::FileContentRead].into_iter().collect()),
            ReclassificationTarget::As(ObservedInputKind::ExistingFileProbe),
        );
        assert!(rule.matches(ObservedInputKind::FileContentRead, "/x/a.tmp"));
        assert!(!rule.matches(ObservedInputKind::AbsentPathProbe, "/x/a.tmp"));
        assert!(!rule.matches(ObservedInputKind::FileContentRead, "/x/a.txt"));
    }

    #[test]
    fn pip_rules_win_over_global_rules() {
        let pip_rule = Arc::new(ReclassificationRule::new(
            "keep as probe",
            Regex::new(r"\.log$").unwrap(),
            None,
            ReclassificationTarget::As(ObservedInputKind::ExistingFileProbe),
        ));
        let global_rule = Arc::new(drop_logs());
        let pip_rules = [pip_rule];
        let global_rules = [global_rule];
        let found = first_match(
            &pip_rules,
            &global_rules,
            ObservedInputKind::FileContentRead,
            "/tmp/x.log",
        )
        .unwrap();
        assert_eq!(found.name, "keep as probe");
    }

    #[test]
    fn definition_hash_tracks_the_definition() {
        let a = drop_logs();
        let mut b = drop_logs();
        assert_eq!(a.definition_hash(), b.definition_hash());
        b.target = ReclassificationTarget::As(ObservedInputKind::AbsentPathProbe);
        assert_ne!(a.definition_hash(), b.definition_hash());
    }
}
