// Cache resolution tests against a counting in-memory backend, so the
// zero-retransfer properties are observable through download call counts.

mod common;

use common::mocks::CountingBackend;
use ferry_transfer::{ContentCache, TransferError};
use ferry_storage::RootJail;
use std::path::Path;
use std::sync::Arc;

fn cache_over(backend: Arc<CountingBackend>, cache_dir: Option<&Path>) -> ContentCache {
    let jail = RootJail::new(backend, "").unwrap();
    ContentCache::new(jail, cache_dir.map(|p| p.to_path_buf()))
}

fn cache_entries(cache_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(cache_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test]
async fn test_first_fetch_downloads_and_caches() {
    let backend = Arc::new(CountingBackend::new());
    backend.insert("test/file.txt", b"hello world", "t1");
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = cache_over(backend.clone(), Some(cache_dir.path()));

    let resolved = cache.resolve("test/file.txt", true, None).await.unwrap();
    let path = resolved.expect("resolve should return a path");
    assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    assert_eq!(backend.open_count(), 1);

    // One pointer record plus one content blob, both flat in the cache dir.
    let entries = cache_entries(cache_dir.path());
    assert_eq!(entries.len(), 2);
    assert_eq!(entries.iter().filter(|n| n.ends_with(".ref")).count(), 1);
}

#[tokio::test]
async fn test_cache_hit_performs_zero_retransfer() {
    let backend = Arc::new(CountingBackend::new());
    backend.insert("test/file.txt", b"cached content", "t1");
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = cache_over(backend.clone(), Some(cache_dir.path()));

    let first = cache.resolve("test/file.txt", true, None).await.unwrap().unwrap();
    let second = cache.resolve("test/file.txt", true, None).await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(std::fs::read(&second).unwrap(), b"cached content");
    assert_eq!(backend.open_count(), 1, "second resolve must not re-download");
}

#[tokio::test]
async fn test_token_change_serves_fresh_content() {
    let backend = Arc::new(CountingBackend::new());
    backend.insert("obj", b"first version", "t1");
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = cache_over(backend.clone(), Some(cache_dir.path()));

    let v1_path = cache.resolve("obj", true, None).await.unwrap().unwrap();
    assert_eq!(std::fs::read(&v1_path).unwrap(), b"first version");

    backend.insert("obj", b"second version", "t2");

    let v2_path = cache.resolve("obj", true, None).await.unwrap().unwrap();
    assert_eq!(std::fs::read(&v2_path).unwrap(), b"second version");
    assert_ne!(v1_path, v2_path);
    assert_eq!(backend.open_count(), 2);

    // The superseded blob stays intact; only the pointer moved.
    assert_eq!(std::fs::read(&v1_path).unwrap(), b"first version");
}

#[tokio::test]
async fn test_identical_content_dedups_to_one_blob() {
    let backend = Arc::new(CountingBackend::new());
    backend.insert("ref/a", b"same bytes", "token-a");
    backend.insert("ref/b", b"same bytes", "token-b");
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = cache_over(backend.clone(), Some(cache_dir.path()));

    let a = cache.resolve("ref/a", true, None).await.unwrap().unwrap();
    let b = cache.resolve("ref/b", true, None).await.unwrap().unwrap();

    assert_eq!(a, b, "identical content should share one blob");

    // Two pointer records, one blob.
    let entries = cache_entries(cache_dir.path());
    assert_eq!(entries.len(), 3);
    assert_eq!(entries.iter().filter(|n| n.ends_with(".ref")).count(), 2);
}

#[tokio::test]
async fn test_missing_token_bypasses_cache_with_fresh_content() {
    let backend = Arc::new(CountingBackend::new());
    backend.insert("noetag/file.txt", b"something", "t1");
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = cache_over(backend.clone(), Some(cache_dir.path()));

    backend.strip_tokens(true);
    let path = cache
        .resolve("noetag/file.txt", true, None)
        .await
        .unwrap()
        .expect("bypass should still produce content");

    assert_eq!(std::fs::read(&path).unwrap(), b"something");
    assert!(
        cache_entries(cache_dir.path()).is_empty(),
        "no pointer or blob may be written on the bypass path"
    );
    assert!(!path.starts_with(cache_dir.path()));

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_empty_reference_contract() {
    let backend = Arc::new(CountingBackend::new());
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = cache_over(backend, Some(cache_dir.path()));

    match cache.resolve("", true, None).await {
        Err(TransferError::MissingReference(_)) => {}
        other => panic!("expected MissingReference, got {other:?}"),
    }
    assert!(cache.resolve("", false, None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_object_contract() {
    let backend = Arc::new(CountingBackend::new());
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = cache_over(backend, Some(cache_dir.path()));

    assert!(cache
        .resolve("nonexistent/file.txt", false, None)
        .await
        .unwrap()
        .is_none());
    match cache.resolve("nonexistent/file.txt", true, None).await {
        Err(TransferError::MissingReference(_)) => {}
        other => panic!("expected MissingReference, got {other:?}"),
    }
}

#[tokio::test]
async fn test_directory_reference_rejected() {
    let backend = Arc::new(CountingBackend::new());
    backend.insert("somedir/file.txt", b"x", "t1");
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = cache_over(backend, Some(cache_dir.path()));

    match cache.resolve("somedir", true, None).await {
        Err(TransferError::NotAFile(_)) => {}
        other => panic!("expected NotAFile, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disabled_cache_requires_fallback_target() {
    let backend = Arc::new(CountingBackend::new());
    let cache = cache_over(backend, None);

    match cache.resolve("k", true, None).await {
        Err(TransferError::Config(_)) => {}
        other => panic!("expected Config error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disabled_cache_fetches_to_fallback_target() {
    let backend = Arc::new(CountingBackend::new());
    backend.insert("obj", b"direct bytes", "t1");
    let cache = cache_over(backend.clone(), None);

    let out = tempfile::tempdir().unwrap();
    let target = out.path().join("nested/obj.bin");
    let resolved = cache
        .resolve("obj", true, Some(target.as_path()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(resolved, target);
    assert_eq!(std::fs::read(&target).unwrap(), b"direct bytes");
}

#[tokio::test]
async fn test_pointer_record_layout_is_flat_json() {
    let backend = Arc::new(CountingBackend::new());
    backend.insert("obj", b"payload", "t1");
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = cache_over(backend, Some(cache_dir.path()));

    let blob_path = cache.resolve("obj", true, None).await.unwrap().unwrap();
    let blob_name = blob_path.file_name().unwrap().to_string_lossy().into_owned();

    let entries = cache_entries(cache_dir.path());
    let pointer_name = entries
        .iter()
        .find(|n| n.ends_with(".ref"))
        .expect("pointer record should exist");

    let raw = std::fs::read(cache_dir.path().join(pointer_name)).unwrap();
    let record: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(record["revision_token"], "t1");
    assert_eq!(record["content_path"], blob_name.as_str());
}

#[tokio::test]
async fn test_evicted_blob_is_refetched() {
    let backend = Arc::new(CountingBackend::new());
    backend.insert("obj", b"payload", "t1");
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = cache_over(backend.clone(), Some(cache_dir.path()));

    let blob_path = cache.resolve("obj", true, None).await.unwrap().unwrap();
    std::fs::remove_file(&blob_path).unwrap();

    let restored = cache.resolve("obj", true, None).await.unwrap().unwrap();
    assert_eq!(std::fs::read(&restored).unwrap(), b"payload");
    assert_eq!(backend.open_count(), 2);
}
