//! Observed-input processing scenarios, end to end over a real filesystem.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use kiln::{
    config::{EngineConfig, FileSystemMode},
    fs::PathExistence,
    hash::{PathSetHash, WeakFingerprint},
    observe::{
        ObservationFlags, ObservationStatus, ObservedInput, RawObservation,
        env::PostExecutionEnv,
        reclassify::{ObservedInputKind, ReclassificationRule, ReclassificationTarget},
        strong_fingerprint,
    },
    pip::{Pip, PipOptions},
    seal::SealKind,
    views::ProducedWhen,
};
use lazy_regex::regex::Regex;

use crate::TestEngine;

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

#[test_log::test(tokio::test)]
async fn absent_probe_is_elided_under_minimal_graph_enumeration() {
    let engine = TestEngine::new(EngineConfig {
        filesystem_mode: FileSystemMode::RealAndMinimalPipGraph,
        elide_absent_probes_under_minimal_graph: true,
        ..EngineConfig::default()
    });
    let dep = engine.file("src/a.c", b"int x;");
    let src = engine.path("src");
    let missing = engine.path("src/missing.txt");

    let id = engine
        .graph
        .add(
            Pip::builder()
                .semi_stable_hash(1)
                .description("compile")
                .file_dependencies(vec![dep])
                .build(),
        )
        .unwrap();
    let pip = engine.graph.pip(id).unwrap();

    let observations = vec![
        RawObservation {
            path: src,
            flags: ObservationFlags::enumerate(),
        },
        RawObservation {
            path: missing,
            flags: ObservationFlags::probe(),
        },
    ];
    let processed = engine
        .processor(Vec::new())
        .process(&PostExecutionEnv::default(), &pip, &observations, &cancel())
        .await
        .unwrap();

    assert_eq!(processed.status, ObservationStatus::Success);
    assert_eq!(processed.observations.len(), 1);
    assert!(matches!(
        processed.observations[0],
        ObservedInput::DirectoryEnumeration { path, .. } if path == src
    ));
}

#[test_log::test(tokio::test)]
async fn directory_symlink_with_enumeration_flag_types_as_enumeration() {
    let engine = TestEngine::new(EngineConfig::default());
    engine.file("src/real/a.txt", b"content");
    let link_abs = engine.abs("src/link");
    std::os::unix::fs::symlink(engine.abs("src/real"), &link_abs).unwrap();
    let link = engine.path("src/link");

    let id = engine
        .graph
        .add(
            Pip::builder()
                .semi_stable_hash(2)
                .description("scan")
                .build(),
        )
        .unwrap();
    let pip = engine.graph.pip(id).unwrap();

    let observations = vec![RawObservation {
        path: link,
        flags: ObservationFlags::enumerate(),
    }];
    let processed = engine
        .processor(Vec::new())
        .process(&PostExecutionEnv::default(), &pip, &observations, &cancel())
        .await
        .unwrap();

    assert_eq!(processed.status, ObservationStatus::Success);
    assert_eq!(processed.observations.len(), 1);
    assert!(matches!(
        processed.observations[0],
        ObservedInput::DirectoryEnumeration { path, .. } if path == link
    ));
}

#[test_log::test(tokio::test)]
async fn deferred_opaque_materialization_raises_no_false_violation() {
    let engine = TestEngine::new(EngineConfig::default());
    let od = engine.path("out/od");
    let artifact = engine
        .graph
        .seals()
        .reserve(od, SealKind::ExclusiveOpaque)
        .unwrap();
    let producer = engine
        .graph
        .add(
            Pip::builder()
                .semi_stable_hash(3)
                .description("producer")
                .output_directories(vec![artifact])
                .build(),
        )
        .unwrap();
    let consumer = engine
        .graph
        .add(
            Pip::builder()
                .semi_stable_hash(4)
                .description("consumer")
                .explicit_dependencies(vec![producer])
                .directory_dependencies(vec![artifact])
                .build(),
        )
        .unwrap();
    let consumer = engine.graph.pip(consumer).unwrap();

    // The opaque is not on disk yet; probes under it must not be memoized.
    engine.view.defer_materialization(od);
    let gen_path = engine.path("out/od/gen.h");
    assert_eq!(
        engine.view.real_existence(gen_path).await.unwrap(),
        PathExistence::Nonexistent
    );

    // The producer replays from cache: content lands on disk.
    engine.file("out/od/gen.h", b"#pragma once");
    engine.view.mark_materialized(od);
    engine.view.report_produced(gen_path, ProducedWhen::DuringBuild);
    assert_eq!(
        engine.view.real_existence(gen_path).await.unwrap(),
        PathExistence::ExistsAsFile
    );

    // The consumer re-runs and probes the produced file.
    let observations = vec![RawObservation {
        path: gen_path,
        flags: ObservationFlags::probe(),
    }];
    let processed = engine
        .processor(Vec::new())
        .process(
            &PostExecutionEnv::default(),
            &consumer,
            &observations,
            &cancel(),
        )
        .await
        .unwrap();

    assert_eq!(processed.status, ObservationStatus::Success);
    assert!(processed.failures.is_empty());
    assert!(matches!(
        processed.observations[0],
        ObservedInput::ExistingFileProbe { path } if path == gen_path
    ));
}

#[test_log::test(tokio::test)]
async fn reclassification_drop_removes_the_observation_and_its_trace() {
    let engine = TestEngine::new(EngineConfig::default());
    let dep = engine.file("src/a.c", b"int x;");
    let log = engine.file("src/logs/x.log", b"noise");

    let id = engine
        .graph
        .add(
            Pip::builder()
                .semi_stable_hash(5)
                .description("compile")
                .file_dependencies(vec![dep])
                .build(),
        )
        .unwrap();
    let pip = engine.graph.pip(id).unwrap();

    let rule = Arc::new(ReclassificationRule::new(
        "ignore logs",
        Regex::new(r"\.log$").unwrap(),
        None,
        ReclassificationTarget::Drop,
    ));
    let with_rule = engine
        .processor(vec![rule])
        .process(
            &PostExecutionEnv::default(),
            &pip,
            &[
                RawObservation {
                    path: dep,
                    flags: ObservationFlags::read(),
                },
                RawObservation {
                    path: log,
                    flags: ObservationFlags::read(),
                },
            ],
            &cancel(),
        )
        .await
        .unwrap();
    let without_observation = engine
        .processor(Vec::new())
        .process(
            &PostExecutionEnv::default(),
            &pip,
            &[RawObservation {
                path: dep,
                flags: ObservationFlags::read(),
            }],
            &cancel(),
        )
        .await
        .unwrap();

    assert_eq!(with_rule.status, ObservationStatus::Success);
    assert_eq!(with_rule.path_set.entries.len(), 1);
    assert!(with_rule.path_set.entries[0].path.ends_with("a.c"));

    // The strong fingerprint is identical to one computed without the
    // dropped observation ever existing.
    let weak = WeakFingerprint([1u8; 32]);
    let hash_a = with_rule.path_set.content_hash().unwrap();
    let hash_b = without_observation.path_set.content_hash().unwrap();
    assert_eq!(hash_a, hash_b);
    assert_eq!(
        strong_fingerprint(&engine.paths, &weak, &hash_a, &with_rule.observations),
        strong_fingerprint(&engine.paths, &weak, &hash_b, &without_observation.observations),
    );
}

#[test_log::test(tokio::test)]
async fn undeclared_reads_fail_policy_unless_opted_in() {
    let engine = TestEngine::new(EngineConfig::default());
    let dep = engine.file("src/a.c", b"int x;");
    let stray = engine.file("src/undeclared.h", b"secret");

    let strict = engine
        .graph
        .add(
            Pip::builder()
                .semi_stable_hash(6)
                .description("strict")
                .file_dependencies(vec![dep])
                .build(),
        )
        .unwrap();
    let strict = engine.graph.pip(strict).unwrap();
    let observations = vec![RawObservation {
        path: stray,
        flags: ObservationFlags::read(),
    }];
    let processed = engine
        .processor(Vec::new())
        .process(&PostExecutionEnv::default(), &strict, &observations, &cancel())
        .await
        .unwrap();
    assert_eq!(processed.status, ObservationStatus::Aborted);
    assert!(
        processed
            .failures
            .iter()
            .any(|f| f.to_string().contains("disallowed file access"))
    );

    let lenient = engine
        .graph
        .add(
            Pip::builder()
                .semi_stable_hash(7)
                .description("lenient")
                .file_dependencies(vec![dep])
                .options(PipOptions {
                    allow_undeclared_source_reads: true,
                    ..PipOptions::default()
                })
                .build(),
        )
        .unwrap();
    let lenient = engine.graph.pip(lenient).unwrap();
    let processed = engine
        .processor(Vec::new())
        .process(&PostExecutionEnv::default(), &lenient, &observations, &cancel())
        .await
        .unwrap();
    assert_eq!(processed.status, ObservationStatus::Success);
    assert!(processed.allowed_undeclared_reads.contains_key(&stray));
}

#[test_log::test(tokio::test)]
async fn processing_is_deterministic_and_ordered() {
    let engine = TestEngine::new(EngineConfig::default());
    let a = engine.file("src/a.c", b"a");
    let z = engine.file("src/z.c", b"z");
    let mid = engine.file("src/lib/m.c", b"m");

    let id = engine
        .graph
        .add(
            Pip::builder()
                .semi_stable_hash(8)
                .description("compile")
                .file_dependencies(vec![a, z, mid])
                .build(),
        )
        .unwrap();
    let pip = engine.graph.pip(id).unwrap();

    // Deliberately unsorted input.
    let observations = vec![
        RawObservation {
            path: z,
            flags: ObservationFlags::read(),
        },
        RawObservation {
            path: a,
            flags: ObservationFlags::read(),
        },
        RawObservation {
            path: mid,
            flags: ObservationFlags::read(),
        },
    ];

    let first = engine
        .processor(Vec::new())
        .process(&PostExecutionEnv::default(), &pip, &observations, &cancel())
        .await
        .unwrap();
    let second = engine
        .processor(Vec::new())
        .process(&PostExecutionEnv::default(), &pip, &observations, &cancel())
        .await
        .unwrap();

    let order: Vec<String> = first
        .observations
        .iter()
        .map(|o| engine.paths.expand(o.path()))
        .collect();
    let mut sorted = order.clone();
    sorted.sort();
    assert_eq!(order, sorted);

    assert_eq!(first.observations, second.observations);
    assert_eq!(first.path_set, second.path_set);
    let weak = WeakFingerprint([2u8; 32]);
    let hash: PathSetHash = first.path_set.content_hash().unwrap();
    assert_eq!(
        strong_fingerprint(&engine.paths, &weak, &hash, &first.observations),
        strong_fingerprint(&engine.paths, &weak, &hash, &second.observations),
    );
}

#[test_log::test(tokio::test)]
async fn hashing_under_a_non_hashable_mount_aborts() {
    let engine = TestEngine::new(EngineConfig::default());
    // Outside every mount: no policy, not hashable.
    let stray_abs = engine.abs("stray.bin");
    std::fs::write(&stray_abs, b"opaque").unwrap();
    let stray = engine.paths.intern(&stray_abs).unwrap();

    let id = engine
        .graph
        .add(
            Pip::builder()
                .semi_stable_hash(9)
                .description("reader")
                .build(),
        )
        .unwrap();
    let pip = engine.graph.pip(id).unwrap();

    let processed = engine
        .processor(Vec::new())
        .process(
            &PostExecutionEnv::default(),
            &pip,
            &[RawObservation {
                path: stray,
                flags: ObservationFlags::read(),
            }],
            &cancel(),
        )
        .await
        .unwrap();
    assert_eq!(processed.status, ObservationStatus::Aborted);
}

#[test_log::test(tokio::test)]
async fn kinds_map_to_existence_and_flags() {
    let engine = TestEngine::new(EngineConfig::default());
    let file = engine.file("src/exists.c", b"x");
    let dir = engine.path("src/sub");
    std::fs::create_dir_all(engine.abs("src/sub")).unwrap();
    std::fs::write(engine.abs("src/sub/member.h"), b"m").unwrap();
    engine.path("src/sub/member.h");
    let missing = engine.path("src/missing.c");

    let id = engine
        .graph
        .add(
            Pip::builder()
                .semi_stable_hash(10)
                .description("prober")
                .options(PipOptions {
                    allow_undeclared_source_reads: true,
                    ..PipOptions::default()
                })
                .build(),
        )
        .unwrap();
    let pip = engine.graph.pip(id).unwrap();

    let observations = vec![
        RawObservation {
            path: file,
            flags: ObservationFlags::probe(),
        },
        RawObservation {
            path: dir,
            flags: ObservationFlags::directory_probe(),
        },
        RawObservation {
            path: missing,
            flags: ObservationFlags::probe(),
        },
    ];
    let processed = engine
        .processor(Vec::new())
        .process(&PostExecutionEnv::default(), &pip, &observations, &cancel())
        .await
        .unwrap();

    let kinds: Vec<ObservedInputKind> =
        processed.observations.iter().map(|o| o.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            ObservedInputKind::ExistingFileProbe,
            ObservedInputKind::AbsentPathProbe,
            ObservedInputKind::ExistingDirectoryProbe,
        ]
    );
}
