//! Engine configuration.
//!
//! Configuration comes from one TOML file plus command-line overrides of
//! the form `/name[:value]`; boolean options also accept a `+`/`-` suffix.
//! Unknown options fail fast. Options that used to exist are kept in a
//! separate deprecation list and produce a distinct error instead of being
//! silently ignored.
//!
//! Every toggle that influences observation typing or fingerprinting is
//! either mixed into the weak-fingerprint salt or recorded in the path
//! set's unsafe-options tag, so a configuration change can never replay a
//! cache entry computed under different rules.

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    error::EngineError,
    hash::FingerprintHasher,
    mount::{Mount, MountTable},
    path::PathTable,
};

/// Which graph-backed filesystem answers existence questions during
/// observed-input processing.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Debug,
    Default,
    strum::EnumString,
    strum::Display,
    Serialize,
    Deserialize,
)]
pub enum FileSystemMode {
    /// Real filesystem layered over the full pip graph.
    #[default]
    RealAndPipGraph,
    /// Real filesystem layered over the per-pip minimal graph.
    RealAndMinimalPipGraph,
    /// Always enumerate from the minimal graph plus alien files.
    AlwaysMinimalWithAlienFiles,
}

/// Options that used to exist. Using one is an error that names the list,
/// not a silent no-op.
pub const DEPRECATED_OPTIONS: &[&str] = &[
    "usePartialEvaluation",
    "enableLegacyPathSetFormat",
    "reuseOutputsOnDisk",
];

/// The engine's configuration surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct EngineConfig {
    pub filesystem_mode: FileSystemMode,

    /// Permit dropping absent-path probes under an already-enumerated
    /// parent when the enumeration came from the minimal graph.
    pub elide_absent_probes_under_minimal_graph: bool,

    /// Reclassify an absent directory-location probe under a known output
    /// directory as an existing-directory probe.
    pub treat_absent_directory_as_existent_under_opaque: bool,

    /// Global default for pips that do not set the option themselves.
    pub allow_undeclared_source_reads: bool,

    /// Keep original path casing when serializing path sets.
    pub preserve_path_set_casing: bool,

    /// Stale shared-opaque outputs are scrubbed lazily; enumeration must
    /// exclude files still carrying the shared-opaque marker.
    pub lazy_shared_opaque_deletion: bool,

    /// Outputs already on disk from a prior build count as produced.
    pub include_outputs_produced_before_caching: bool,

    /// Upper bound on prior path sets fetched per weak fingerprint.
    pub max_path_sets: usize,

    /// Salt mixed into every fingerprint.
    pub fingerprint_salt: String,

    pub stop_on_first_error: bool,
    pub warn_as_error: bool,

    /// Builds an unused file-content entry survives before purging.
    pub file_content_ttl_builds: u32,

    /// Directory for the diagnostic fingerprint store; disabled when unset.
    pub fingerprint_store_path: Option<String>,

    /// Slot pool sizes; zero means "pick a default from the host".
    pub process_slots: usize,
    pub cache_lookup_slots: usize,
    pub materialize_input_slots: usize,
    pub ipc_slots: usize,
    pub light_slots: usize,

    /// Execution sampler tick, in milliseconds.
    pub sample_interval_ms: u64,

    pub mounts: Vec<MountConfig>,
    pub untracked_scopes: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            filesystem_mode: FileSystemMode::default(),
            elide_absent_probes_under_minimal_graph: false,
            treat_absent_directory_as_existent_under_opaque: true,
            allow_undeclared_source_reads: false,
            preserve_path_set_casing: false,
            lazy_shared_opaque_deletion: false,
            include_outputs_produced_before_caching: false,
            max_path_sets: 5,
            fingerprint_salt: String::new(),
            stop_on_first_error: false,
            warn_as_error: false,
            file_content_ttl_builds: 15,
            fingerprint_store_path: None,
            process_slots: 0,
            cache_lookup_slots: 0,
            materialize_input_slots: 0,
            ipc_slots: 0,
            light_slots: 0,
            sample_interval_ms: 2000,
            mounts: Vec::new(),
            untracked_scopes: Vec::new(),
        }
    }
}

/// A mount as written in configuration, before path interning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MountConfig {
    pub name: String,
    pub root: String,
    #[serde(default = "default_true")]
    pub readable: bool,
    #[serde(default)]
    pub writable: bool,
    #[serde(default = "default_true")]
    pub hashable: bool,
    #[serde(default)]
    pub may_contain_outputs: bool,
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// Load from a TOML file. Unknown keys are configuration errors.
    #[instrument]
    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read configuration {path:?}"))?;
        let config: Self = toml::from_str(&text).map_err(|err| EngineError::Config {
            reason: format!("{path}: {err}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply a `/name[:value]` override. Booleans accept `+`/`-` suffixes
    /// and bare `/name` means true.
    pub fn apply_override(&mut self, raw: &str) -> Result<()> {
        let Some(body) = raw.strip_prefix('/') else {
            return Err(EngineError::Config {
                reason: format!("override {raw:?} must start with '/'"),
            }
            .into());
        };

        let (name, value) = match body.split_once(':') {
            Some((name, value)) => (name, Some(value.to_owned())),
            None => match body.strip_suffix('+') {
                Some(name) => (name, Some("true".to_owned())),
                None => match body.strip_suffix('-') {
                    Some(name) => (name, Some("false".to_owned())),
                    None => (body, None),
                },
            },
        };

        let config_err = |reason: String| -> color_eyre::Report {
            EngineError::Config { reason }.into()
        };
        let parse_bool = |value: Option<String>| -> Result<bool> {
            match value.as_deref() {
                None | Some("true") => Ok(true),
                Some("false") => Ok(false),
                Some(other) => Err(config_err(format!(
                    "option /{name} expects a boolean, got {other:?}"
                ))),
            }
        };
        let require_value = |value: Option<String>| -> Result<String> {
            value.ok_or_else(|| config_err(format!("option /{name} requires a value")))
        };

        match name {
            "filesystemMode" => {
                let value = require_value(value)?;
                self.filesystem_mode = value
                    .parse()
                    .map_err(|_| config_err(format!("unknown filesystem mode {value:?}")))?;
            }
            "elideAbsentProbesUnderMinimalGraph" => {
                self.elide_absent_probes_under_minimal_graph = parse_bool(value)?;
            }
            "treatAbsentDirectoryAsExistentUnderOpaque" => {
                self.treat_absent_directory_as_existent_under_opaque = parse_bool(value)?;
            }
            "allowUndeclaredSourceReads" => {
                self.allow_undeclared_source_reads = parse_bool(value)?;
            }
            "preservePathSetCasing" => self.preserve_path_set_casing = parse_bool(value)?,
            "lazySharedOpaqueDeletion" => self.lazy_shared_opaque_deletion = parse_bool(value)?,
            "includeOutputsProducedBeforeCaching" => {
                self.include_outputs_produced_before_caching = parse_bool(value)?;
            }
            "maxPathSets" => {
                let value = require_value(value)?;
                self.max_path_sets = value
                    .parse()
                    .map_err(|_| config_err(format!("invalid /maxPathSets value {value:?}")))?;
            }
            "fingerprintSalt" => self.fingerprint_salt = require_value(value)?,
            "stopOnFirstError" => self.stop_on_first_error = parse_bool(value)?,
            "warnAsError" => self.warn_as_error = parse_bool(value)?,
            "fileContentTtlBuilds" => {
                let value = require_value(value)?;
                self.file_content_ttl_builds = value.parse().map_err(|_| {
                    config_err(format!("invalid /fileContentTtlBuilds value {value:?}"))
                })?;
            }
            "fingerprintStorePath" => self.fingerprint_store_path = Some(require_value(value)?),
            "sampleIntervalMs" => {
                let value = require_value(value)?;
                self.sample_interval_ms = value.parse().map_err(|_| {
                    config_err(format!("invalid /sampleIntervalMs value {value:?}"))
                })?;
            }
            deprecated if DEPRECATED_OPTIONS.contains(&deprecated) => {
                return Err(config_err(format!(
                    "option /{deprecated} is deprecated and has no replacement semantics; \
                     remove it from the invocation"
                )));
            }
            unknown => {
                return Err(config_err(format!("unknown option /{unknown}")));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_path_sets == 0 {
            return Err(EngineError::Config {
                reason: "maxPathSets must be at least 1".into(),
            }
            .into());
        }
        if self.sample_interval_ms == 0 {
            return Err(EngineError::Config {
                reason: "sampleIntervalMs must be nonzero".into(),
            }
            .into());
        }
        Ok(())
    }

    /// Build the mount table by interning configured roots.
    pub fn materialize_mounts(&self, paths: &PathTable) -> Result<MountTable> {
        let mut mounts = Vec::with_capacity(self.mounts.len());
        for mount in &self.mounts {
            let root = paths.intern(&mount.root).map_err(|err| EngineError::Config {
                reason: format!("mount {:?}: {err:#}", mount.name),
            })?;
            mounts.push(
                Mount::builder()
                    .name(mount.name.clone())
                    .root(root)
                    .readable(mount.readable)
                    .writable(mount.writable)
                    .hashable(mount.hashable)
                    .may_contain_outputs(mount.may_contain_outputs)
                    .build(),
            );
        }
        let table = MountTable::new(mounts);
        for scope in &self.untracked_scopes {
            let root = paths.intern(scope).map_err(|err| EngineError::Config {
                reason: format!("untracked scope {scope:?}: {err:#}"),
            })?;
            table.add_untracked_scope(root);
        }
        Ok(table)
    }

    /// The compact tag recorded in every path set: the toggles that change
    /// typing must travel with the observations they shaped.
    pub fn unsafe_options_tag(&self) -> String {
        format!(
            "fs={};elide={};absentdir={};undeclared={};casing={}",
            self.filesystem_mode,
            self.elide_absent_probes_under_minimal_graph as u8,
            self.treat_absent_directory_as_existent_under_opaque as u8,
            self.allow_undeclared_source_reads as u8,
            self.preserve_path_set_casing as u8,
        )
    }

    /// Mix the configuration bits that affect typing into a fingerprint.
    pub fn add_fingerprint_salts(&self, hasher: &mut FingerprintHasher) {
        hasher
            .add_str("fingerprintSalt", &self.fingerprint_salt)
            .add_str("unsafeOptions", &self.unsafe_options_tag());
    }

    pub fn effective_process_slots(&self) -> usize {
        if self.process_slots > 0 {
            self.process_slots
        } else {
            num_cpus::get()
        }
    }

    pub fn effective_cache_lookup_slots(&self) -> usize {
        if self.cache_lookup_slots > 0 {
            self.cache_lookup_slots
        } else {
            num_cpus::get() * 2
        }
    }

    pub fn effective_materialize_input_slots(&self) -> usize {
        if self.materialize_input_slots > 0 {
            self.materialize_input_slots
        } else {
            num_cpus::get() * 4
        }
    }

    pub fn effective_ipc_slots(&self) -> usize {
        if self.ipc_slots > 0 { self.ipc_slots } else { 16 }
    }

    pub fn effective_light_slots(&self) -> usize {
        if self.light_slots > 0 {
            self.light_slots
        } else {
            num_cpus::get() * 8
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test_case("/allowUndeclaredSourceReads+", true; "plus suffix")]
    #[test_case("/allowUndeclaredSourceReads-", false; "minus suffix")]
    #[test_case("/allowUndeclaredSourceReads", true; "bare name")]
    #[test_case("/allowUndeclaredSourceReads:true", true; "explicit value")]
    #[test]
    fn boolean_override_forms(raw: &str, expected: bool) {
        let mut config = EngineConfig::default();
        config.apply_override(raw).unwrap();
        self::assert_eq!(config.allow_undeclared_source_reads, expected);
    }

    #[test]
    fn valued_overrides_parse() {
        let mut config = EngineConfig::default();
        config.apply_override("/maxPathSets:9").unwrap();
        config
            .apply_override("/filesystemMode:RealAndMinimalPipGraph")
            .unwrap();
        assert_eq!(config.max_path_sets, 9);
        assert_eq!(config.filesystem_mode, FileSystemMode::RealAndMinimalPipGraph);
    }

    #[test]
    fn unknown_options_fail_fast() {
        let mut config = EngineConfig::default();
        let err = config.apply_override("/noSuchOption+").unwrap_err();
        assert!(err.to_string().contains("unknown option"));
    }

    #[test]
    fn deprecated_options_get_a_distinct_error() {
        let mut config = EngineConfig::default();
        let err = config.apply_override("/usePartialEvaluation+").unwrap_err();
        assert!(err.to_string().contains("deprecated"));
    }

    #[test]
    fn unknown_toml_keys_are_rejected() {
        let parsed: Result<EngineConfig, _> = toml::from_str("noSuchKey = 1");
        assert!(parsed.is_err());
    }

    #[test]
    fn unsafe_options_tag_tracks_typing_toggles() {
        let mut config = EngineConfig::default();
        let before = config.unsafe_options_tag();
        config.allow_undeclared_source_reads = true;
        assert_ne!(before, config.unsafe_options_tag());
    }

    #[test]
    fn mounts_materialize_into_the_table() {
        let config: EngineConfig = toml::from_str(
            r#"
            [[mounts]]
            name = "Sources"
            root = "/repo/src"

            [[mounts]]
            name = "Out"
            root = "/repo/out"
            writable = true
            "#,
        )
        .unwrap();
        let paths = PathTable::new();
        let mounts = config.materialize_mounts(&paths).unwrap();
        let file = paths.intern("/repo/out/a.obj").unwrap();
        assert!(mounts.may_contain_outputs(&paths, file));
    }
}
