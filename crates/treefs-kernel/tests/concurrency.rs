//! Optimistic commits under contention and injected store failures.

use std::sync::Arc;

use treefs_kernel::store::ObjectStore;
use treefs_kernel::{FileSystemConfig, IoService, ObjectStoreProvider, ServiceConfig};
use treefs_testutil::{ContendedStore, init_tracing, memory_service, repo_path};
use treefs_types::{ErrorKind, FsPath};

fn contended_service(max_attempts: u32) -> (IoService, Arc<ContendedStore>) {
    init_tracing();
    let mut config = ServiceConfig::transient();
    config.commit.max_attempts = max_attempts;
    let store = Arc::new(ContendedStore::new());
    let service = IoService::new(config.clone()).unwrap();
    let provider = ObjectStoreProvider::open("flaky", store.clone(), &config, &FileSystemConfig::memory()).unwrap();
    service.mount(Arc::new(provider)).unwrap();
    (service, store)
}

fn flaky_path(key: &str) -> FsPath {
    FsPath::object("flaky", "master", key).unwrap()
}

#[tokio::test]
async fn lost_race_without_retry_surfaces_conflict() {
    let (service, store) = contended_service(1);
    let path = flaky_path("/a");
    service.write_string(&path, "first", &[]).await.unwrap();
    let head_before = store.head("master").unwrap();

    store.lose_next_races(1);
    let err = service.write_string(&path, "second", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrentModification);

    // The interloper's commit stands and nothing was merged into it.
    assert_eq!(store.interloper_count(), 1);
    assert_ne!(store.head("master").unwrap(), head_before);
    assert_eq!(service.read_all_string(&path).await.unwrap(), "first");
}

#[tokio::test]
async fn lost_races_are_retried() {
    let (service, store) = contended_service(5);
    let path = flaky_path("/a");
    store.lose_next_races(3);
    service.write_string(&path, "eventually", &[]).await.unwrap();

    assert_eq!(store.interloper_count(), 3);
    assert_eq!(service.read_all_string(&path).await.unwrap(), "eventually");
    let log = service.commit_log("flaky", "master").unwrap();
    // init, three interlopers, the write
    assert_eq!(log.len(), 5);
    assert_eq!(log[0].message, "write /a");
}

#[tokio::test]
async fn retries_are_bounded() {
    let (service, store) = contended_service(3);
    store.lose_next_races(10);
    let err = service.write_string(&flaky_path("/a"), "x", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrentModification);
    assert_eq!(store.interloper_count(), 3);
}

#[tokio::test]
async fn failed_object_write_leaves_head_alone() {
    let (service, store) = contended_service(5);
    let path = flaky_path("/a");
    service.write_string(&path, "kept", &[]).await.unwrap();
    let head = store.head("master").unwrap();

    store.fail_next_puts(1);
    let err = service.write_string(&path, "lost", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFailure);
    assert_eq!(store.head("master").unwrap(), head);
    assert_eq!(service.read_all_string(&path).await.unwrap(), "kept");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_all_land() {
    let service = Arc::new(memory_service());
    let mut tasks = Vec::new();
    for i in 0..8 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            let path = repo_path(&format!("/w/{i}.txt"));
            service.write_string(&path, &format!("writer {i}"), &[]).await
        }));
    }
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => {}
            Err(e) if e.is(ErrorKind::ConcurrentModification) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    // Each successful writer produced exactly one commit and its own file.
    let log = service.commit_log("repo", "master").unwrap();
    assert_eq!(log.len(), 1 + 8 - conflicts);
    for i in 0..8 {
        let path = repo_path(&format!("/w/{i}.txt"));
        if let Ok(text) = service.read_all_string(&path).await {
            assert_eq!(text, format!("writer {i}"));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_writers_to_one_path_never_mix() {
    let service = Arc::new(memory_service());
    let path = repo_path("/contested");
    let a = {
        let (service, path) = (service.clone(), path.clone());
        tokio::spawn(async move { service.write_string(&path, "aaaa", &[]).await })
    };
    let b = {
        let (service, path) = (service.clone(), path.clone());
        tokio::spawn(async move { service.write_string(&path, "bbbbbb", &[]).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];
    assert!(results.iter().any(Result::is_ok));

    let text = service.read_all_string(&path).await.unwrap();
    assert!(text == "aaaa" || text == "bbbbbb", "mixed content: {text}");
    assert_eq!(service.size(&path).await.unwrap(), text.len() as u64);
}
