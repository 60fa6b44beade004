//! Two-phase cache lookup over the local backend.

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use kiln::{
    cache::{CacheBackend, CacheLookupOutcome, CacheMetadata, LocalBackend, OutputRecord},
    config::EngineConfig,
    hash::StrongFingerprint,
    observe::{
        ObservationFlags, ObservationStatus, RawObservation, env::PostExecutionEnv,
        pathset::{ObservedPathSet, PathSetEntry},
    },
    pip::Pip,
};

use crate::TestEngine;

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

fn compile_pip(engine: &TestEngine, dep: kiln::path::PathId) -> kiln::pip::GraphPip {
    let id = engine
        .graph
        .add(
            Pip::builder()
                .semi_stable_hash(0xC0FFEE)
                .description("compile")
                .file_dependencies(vec![dep])
                .build(),
        )
        .unwrap();
    engine.graph.pip(id).unwrap()
}

#[test_log::test(tokio::test)]
async fn publish_then_lookup_hits() {
    let engine = TestEngine::new(EngineConfig::default());
    let dep = engine.file("src/a.c", b"int x;");
    let pip = compile_pip(&engine, dep);
    let backend = LocalBackend::open(&engine.abs("cache")).await.unwrap();
    let driver = engine.two_phase(backend);

    let processed = engine
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
    assert_eq!(processed.status, ObservationStatus::Success);

    let outputs = vec![OutputRecord {
        path: engine.abs("out/a.obj"),
        hash: kiln::hash::ContentHash::of_buffer(b"obj"),
        length: 3,
    }];
    let (_, _, published_strong) = driver
        .publish_execution(&pip, &processed, outputs, &cancel())
        .await
        .unwrap();

    match driver.lookup(&pip, &cancel()).await.unwrap() {
        CacheLookupOutcome::Hit {
            strong, metadata, ..
        } => {
            assert_eq!(strong, published_strong);
            assert_eq!(metadata.semi_stable_hash, 0xC0FFEE);
            assert_eq!(metadata.outputs.len(), 1);
        }
        CacheLookupOutcome::Miss { .. } => panic!("expected a cache hit"),
    }
}

#[test_log::test(tokio::test)]
async fn content_change_turns_the_hit_into_a_miss() {
    let engine = TestEngine::new(EngineConfig::default());
    let dep = engine.file("src/a.c", b"int x;");
    let pip = compile_pip(&engine, dep);
    let backend = LocalBackend::open(&engine.abs("cache")).await.unwrap();
    let driver = engine.two_phase(backend);

    let processed = engine
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
    driver
        .publish_execution(&pip, &processed, Vec::new(), &cancel())
        .await
        .unwrap();

    // A second build over the same workspace sees different content. The
    // path set still reproduces, but the strong fingerprint no longer
    // matches.
    let second = engine.reopen(EngineConfig::default());
    second.file("src/a.c", b"int y;");
    let dep2 = second.path("src/a.c");
    let pip2 = compile_pip(&second, dep2);
    let backend2 = LocalBackend::open(&second.abs("cache")).await.unwrap();
    let driver2 = second.two_phase(backend2);

    match driver2.lookup(&pip2, &cancel()).await.unwrap() {
        CacheLookupOutcome::Miss {
            candidates_rejected,
            ..
        } => assert_eq!(candidates_rejected, 1),
        CacheLookupOutcome::Hit { .. } => panic!("expected a miss after content change"),
    }
}

#[test_log::test(tokio::test)]
async fn search_path_fingerprint_survives_unrelated_tools() {
    let engine = TestEngine::new(EngineConfig::default());
    let tool = engine.file("src/tools/cl.exe", b"compiler");
    let tools_dir = engine.path("src/tools");
    let pip = compile_pip(&engine, tool);
    let backend = LocalBackend::open(&engine.abs("cache")).await.unwrap();
    let driver = engine.two_phase(backend);

    let observations = vec![
        RawObservation {
            path: tools_dir,
            flags: ObservationFlags {
                search_path: true,
                ..ObservationFlags::enumerate()
            },
        },
        RawObservation {
            path: tool,
            flags: ObservationFlags::read(),
        },
    ];
    let processed = engine
        .processor(Vec::new())
        .process(&PostExecutionEnv::default(), &pip, &observations, &cancel())
        .await
        .unwrap();
    assert_eq!(processed.status, ObservationStatus::Success);
    driver
        .publish_execution(&pip, &processed, Vec::new(), &cancel())
        .await
        .unwrap();

    // An unrelated tool appears on the search path between builds.
    engine.file("src/tools/unused.exe", b"noise");

    let second = engine.reopen(EngineConfig::default());
    let tool2 = second.path("src/tools/cl.exe");
    let pip2 = compile_pip(&second, tool2);
    let backend2 = LocalBackend::open(&second.abs("cache")).await.unwrap();
    let driver2 = second.two_phase(backend2);

    assert!(matches!(
        driver2.lookup(&pip2, &cancel()).await.unwrap(),
        CacheLookupOutcome::Hit { .. }
    ));
}

#[test_log::test(tokio::test)]
async fn empty_cache_misses_cleanly() {
    let engine = TestEngine::new(EngineConfig::default());
    let dep = engine.file("src/a.c", b"int x;");
    let pip = compile_pip(&engine, dep);
    let backend = LocalBackend::open(&engine.abs("cache")).await.unwrap();
    let driver = engine.two_phase(backend);

    match driver.lookup(&pip, &cancel()).await.unwrap() {
        CacheLookupOutcome::Miss {
            candidates_rejected,
            ..
        } => assert_eq!(candidates_rejected, 0),
        CacheLookupOutcome::Hit { .. } => panic!("expected a miss on an empty cache"),
    }
}

#[test_log::test(tokio::test)]
async fn poisoned_candidate_aborts_the_lookup() {
    let engine = TestEngine::new(EngineConfig::default());
    let dep = engine.file("src/a.c", b"int x;");
    let pip = compile_pip(&engine, dep);
    let backend = LocalBackend::open(&engine.abs("cache")).await.unwrap();
    let driver = engine.two_phase(backend.clone());

    // A file outside every mount cannot be hashed; a stored path set that
    // claims to have read it can never type successfully.
    let stray_abs = engine.abs("stray.bin");
    std::fs::write(&stray_abs, b"opaque").unwrap();
    let weak = driver.weak_fingerprint(&pip);
    let poisoned = ObservedPathSet::new(
        vec![PathSetEntry {
            path: stray_abs,
            flags: ObservationFlags::read(),
            enumerate_pattern: None,
        }],
        vec!["stray.bin".into()],
        engine.config.unsafe_options_tag(),
    );
    let metadata = CacheMetadata {
        strong_fingerprint: StrongFingerprint([9u8; 32]),
        semi_stable_hash: 0xC0FFEE,
        outputs: Vec::new(),
    };
    backend
        .publish(&weak, &poisoned, &metadata, &cancel())
        .await
        .unwrap();

    assert!(driver.lookup(&pip, &cancel()).await.is_err());
}

#[test_log::test(tokio::test)]
async fn published_path_set_round_trips_through_the_backend() {
    let engine = TestEngine::new(EngineConfig::default());
    let dep = engine.file("src/a.c", b"int x;");
    let tools_dir = engine.path("src/tools");
    engine.file("src/tools/cl.exe", b"tool");
    let pip = compile_pip(&engine, dep);
    let backend = LocalBackend::open(&engine.abs("cache")).await.unwrap();
    let driver = engine.two_phase(backend.clone());

    let observations = vec![
        RawObservation {
            path: dep,
            flags: ObservationFlags::read(),
        },
        RawObservation {
            path: tools_dir,
            flags: ObservationFlags::enumerate(),
        },
    ];
    let processed = engine
        .processor(Vec::new())
        .process(&PostExecutionEnv::default(), &pip, &observations, &cancel())
        .await
        .unwrap();
    let (weak, path_set_hash, _) = driver
        .publish_execution(&pip, &processed, Vec::new(), &cancel())
        .await
        .unwrap();

    let cancel_token = cancel();
    let mut stream = backend
        .query_path_sets(&weak, 5, &cancel_token)
        .await
        .unwrap();
    let (stored_hash, stored) = futures::TryStreamExt::try_next(&mut stream)
        .await
        .unwrap()
        .expect("one candidate");
    assert_eq!(stored_hash, path_set_hash);
    assert_eq!(stored, processed.path_set);
}
