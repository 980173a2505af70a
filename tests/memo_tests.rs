// Memoizing generator tests - public API, real store on disk
// Author: kelexine (https://github.com/kelexine)

use gencache::cache::{
    ArtifactCodec, CacheStore, GenerationRequest, Memoized, MemoizingGenerator, StoreOptions,
};
use gencache::config::CacheConfig;
use gencache::CacheError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DrugInfo {
    name: String,
    max_daily_mg: u32,
    warnings: Vec<String>,
}

fn drug(name: &str) -> DrugInfo {
    DrugInfo {
        name: name.to_string(),
        max_daily_mg: 4000,
        warnings: vec!["take with food".to_string()],
    }
}

fn request(name: &str) -> GenerationRequest {
    GenerationRequest::builder("test-model-1", "lookup_drug")
        .param("name", name)
        .param("temperature", 0.0)
        .build()
}

fn open_store(dir: &tempfile::TempDir) -> Arc<CacheStore> {
    Arc::new(CacheStore::open(dir.path().join("responses.db"), StoreOptions::default()).unwrap())
}

async fn lookup(
    generator: &MemoizingGenerator<DrugInfo>,
    name: &str,
    calls: &AtomicUsize,
) -> Memoized<DrugInfo> {
    generator
        .generate(&request(name), |req| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let name = match req.param("name") {
                Some(gencache::cache::ParamValue::Str(name)) => name.clone(),
                _ => anyhow::bail!("name parameter missing"),
            };
            Ok(drug(&name))
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_second_call_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let generator = MemoizingGenerator::new(open_store(&dir));
    let calls = AtomicUsize::new(0);

    let first = lookup(&generator, "aspirin", &calls).await;
    let second = lookup(&generator, "aspirin", &calls).await;

    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.artifact, second.artifact);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stats = generator.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.generations, 1);
}

#[tokio::test]
async fn test_distinct_requests_are_cached_separately() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let generator = MemoizingGenerator::new(store.clone());
    let calls = AtomicUsize::new(0);

    lookup(&generator, "aspirin", &calls).await;
    let aspirin_key = request("aspirin").fingerprint().unwrap();
    let stored_before = store.get(&aspirin_key).unwrap().unwrap().payload;

    let ibuprofen = lookup(&generator, "ibuprofen", &calls).await;
    assert!(!ibuprofen.from_cache);
    assert_eq!(ibuprofen.artifact.name, "ibuprofen");

    let aspirin = lookup(&generator, "aspirin", &calls).await;
    assert!(aspirin.from_cache);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Serving a hit never rewrites the stored bytes
    let stored_after = store.get(&aspirin_key).unwrap().unwrap().payload;
    assert_eq!(stored_before, stored_after);
    assert_eq!(store.stats().unwrap().entry_count, 2);
}

#[tokio::test]
async fn test_results_survive_a_new_generator() {
    let dir = tempfile::tempdir().unwrap();
    let calls = AtomicUsize::new(0);

    {
        let generator = MemoizingGenerator::new(open_store(&dir));
        lookup(&generator, "aspirin", &calls).await;
    }

    let generator = MemoizingGenerator::new(open_store(&dir));
    let again = lookup(&generator, "aspirin", &calls).await;
    assert!(again.from_cache);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_read_only_store_degrades_to_generation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("responses.db");
    let _writer = CacheStore::open(&path, StoreOptions::default()).unwrap();
    let reader = CacheStore::open(&path, StoreOptions::default().read_only(true)).unwrap();
    let generator = MemoizingGenerator::new(Arc::new(reader));
    let calls = AtomicUsize::new(0);

    let first = lookup(&generator, "aspirin", &calls).await;
    let second = lookup(&generator, "aspirin", &calls).await;

    assert_eq!(first.artifact, drug("aspirin"));
    assert!(!second.from_cache);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(generator.stats().store_errors, 2);
}

#[tokio::test]
async fn test_unopenable_store_disables_caching() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("responses.db");
    std::fs::write(&path, b"this is not a database, just some text").unwrap();

    let config = CacheConfig {
        store_path: path,
        ..CacheConfig::default()
    };
    let generator = MemoizingGenerator::<DrugInfo>::from_config(&config);
    assert!(!generator.is_enabled());

    let calls = AtomicUsize::new(0);
    let result = lookup(&generator, "aspirin", &calls).await;
    assert_eq!(result.artifact, drug("aspirin"));
    assert!(!result.from_cache);
}

#[tokio::test]
async fn test_from_config_opens_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        store_path: dir.path().join("nested").join("responses.db"),
        capacity_mb: 1,
        ..CacheConfig::default()
    };
    let generator = MemoizingGenerator::<DrugInfo>::from_config(&config);

    assert!(generator.is_enabled());
    let store = generator.store().unwrap();
    assert_eq!(store.capacity_bytes(), 1024 * 1024);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_generation() {
    let dir = tempfile::tempdir().unwrap();
    let generator = MemoizingGenerator::new(open_store(&dir));
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let generator = generator.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                generator
                    .generate(&request("aspirin"), move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok(drug("aspirin"))
                    })
                    .await
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        let memoized = result.unwrap().unwrap();
        assert_eq!(memoized.artifact, drug("aspirin"));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(generator.in_flight(), 0);
    let stats = generator.stats();
    assert_eq!(stats.generations, 1);
    assert_eq!(stats.coalesced + stats.hits, 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_generation_error_reaches_every_waiter() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let generator = MemoizingGenerator::<DrugInfo>::new(store.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let generator = generator.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                generator
                    .generate(&request("aspirin"), move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Err::<DrugInfo, _>(anyhow::anyhow!("upstream returned 503"))
                    })
                    .await
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        let err = result.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Generation(_)));
        assert!(err.to_string().contains("upstream returned 503"));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.stats().unwrap().entry_count, 0);
}

#[tokio::test]
async fn test_failed_generation_is_retried_next_call() {
    let generator = MemoizingGenerator::<DrugInfo>::disabled();

    let failed = generator
        .generate(&request("aspirin"), |_| async {
            Err::<DrugInfo, _>(anyhow::anyhow!("timeout"))
        })
        .await;
    assert!(failed.is_err());

    let ok = generator
        .generate(&request("aspirin"), |_| async { Ok(drug("aspirin")) })
        .await
        .unwrap();
    assert_eq!(ok.artifact.name, "aspirin");
}

#[tokio::test]
async fn test_cancelled_leader_releases_followers() {
    let generator = MemoizingGenerator::<DrugInfo>::disabled();

    let leader = {
        let generator = generator.clone();
        tokio::spawn(async move {
            generator
                .generate(&request("aspirin"), |_| async {
                    std::future::pending::<anyhow::Result<DrugInfo>>().await
                })
                .await
        })
    };
    while generator.in_flight() == 0 {
        tokio::task::yield_now().await;
    }

    let follower = {
        let generator = generator.clone();
        tokio::spawn(async move {
            generator
                .generate(&request("aspirin"), |_| async {
                    Ok::<_, anyhow::Error>(drug("never called"))
                })
                .await
        })
    };
    while generator.stats().coalesced == 0 {
        tokio::task::yield_now().await;
    }

    leader.abort();
    let result = follower.await.unwrap();
    assert!(matches!(result, Err(CacheError::Cancelled)));
    assert_eq!(generator.in_flight(), 0);
}

#[tokio::test]
async fn test_corrupt_entry_is_regenerated() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let key = request("aspirin").fingerprint().unwrap();
    store.put(&key, b"\x00\x01 definitely not an artifact").unwrap();

    let generator = MemoizingGenerator::new(store.clone());
    let calls = AtomicUsize::new(0);

    let first = lookup(&generator, "aspirin", &calls).await;
    assert!(!first.from_cache);

    // The regenerated artifact replaced the unreadable one
    let payload = store.get(&key).unwrap().unwrap().payload;
    let decoded: DrugInfo = ArtifactCodec::decode(&payload, "lookup_drug").unwrap();
    assert_eq!(decoded, drug("aspirin"));

    let second = lookup(&generator, "aspirin", &calls).await;
    assert!(second.from_cache);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_oversized_artifact_is_returned_but_not_stored() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        CacheStore::open(
            dir.path().join("responses.db"),
            StoreOptions::default().with_capacity(64),
        )
        .unwrap(),
    );
    let generator = MemoizingGenerator::new(store.clone());

    let result = generator
        .generate(&request("aspirin"), |_| async {
            Ok(DrugInfo {
                name: "aspirin".to_string(),
                max_daily_mg: 4000,
                warnings: vec!["x".repeat(256)],
            })
        })
        .await
        .unwrap();

    assert!(!result.from_cache);
    assert_eq!(result.artifact.warnings[0].len(), 256);
    assert_eq!(store.stats().unwrap().entry_count, 0);
    assert_eq!(generator.stats().store_errors, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_followers_get_result_when_leader_dropped_during_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("responses.db");
    let store = Arc::new(CacheStore::open(&path, StoreOptions::default()).unwrap());
    let generator = MemoizingGenerator::<DrugInfo>::new(store.clone());

    // Another process holds the write lock, so the leader's write waits on it
    let other = rusqlite::Connection::open(&path).unwrap();
    other.execute_batch("BEGIN IMMEDIATE").unwrap();

    let leader = {
        let generator = generator.clone();
        tokio::spawn(async move {
            generator
                .generate(&request("aspirin"), |_| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(drug("aspirin"))
                })
                .await
        })
    };
    while generator.in_flight() == 0 {
        tokio::task::yield_now().await;
    }

    let follower = {
        let generator = generator.clone();
        tokio::spawn(async move {
            generator
                .generate(&request("aspirin"), |_| async {
                    Ok::<_, anyhow::Error>(drug("never called"))
                })
                .await
        })
    };
    while generator.stats().coalesced == 0 {
        tokio::task::yield_now().await;
    }

    // Generation is done and the leader is stuck writing
    tokio::time::sleep(Duration::from_millis(400)).await;
    leader.abort();

    let result = follower.await.unwrap().unwrap();
    assert_eq!(result.artifact, drug("aspirin"));
    assert!(!result.from_cache);

    other.execute_batch("ROLLBACK").unwrap();
    drop(other);

    // The detached write still lands once the lock is released
    let key = request("aspirin").fingerprint().unwrap();
    let mut stored = false;
    for _ in 0..50 {
        if store.contains(&key).unwrap() {
            stored = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(stored);
}
