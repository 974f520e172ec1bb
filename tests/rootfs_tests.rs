//! Integration tests for the rootfs acquisition pipeline: download,
//! resume, verification, extraction, and eviction.

mod common;

use common::{build_archive, manifest_for, sample_archive, test_image, MockTransport};
use droidbox::rootfs::{CancelFlag, ImageRefCounts, RootfsManager, RootfsStore};
use droidbox::{Error, ImageId, RootfsManifest, RootfsStatus};
use std::path::Path;
use std::sync::Arc;

const URL: &str = "https://images.test/rootfs.tar.gz";

fn make_manager(
    dir: &Path,
    transport: Arc<MockTransport>,
    manifest: RootfsManifest,
) -> RootfsManager {
    let store = RootfsStore::with_path(dir.join("images")).expect("store init");
    RootfsManager::new(store, manifest, transport)
}

struct FixedRefs(usize);

#[async_trait::async_trait]
impl ImageRefCounts for FixedRefs {
    async fn active_references(&self, _image: &ImageId) -> usize {
        self.0
    }
}

// =============================================================================
// Happy Path
// =============================================================================

#[tokio::test]
async fn test_ensure_ready_downloads_verifies_extracts() {
    let dir = tempfile::tempdir().unwrap();
    let image = test_image();
    let payload = sample_archive();
    let transport = Arc::new(MockTransport::new(payload.clone()));
    let manager = make_manager(dir.path(), transport.clone(), manifest_for(&image, URL, &payload));

    let rootfs = manager
        .ensure_ready(&image, &CancelFlag::new())
        .await
        .expect("pipeline should succeed");

    assert!(
        rootfs.join("etc/os-release").is_file(),
        "extracted tree should contain archive contents"
    );
    assert!(manager.store().is_ready(&image), "marker should be present");
    assert_eq!(manager.status(&image), RootfsStatus::Ready);
    assert_eq!(transport.fetches(), 1);
}

#[tokio::test]
async fn test_ensure_ready_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let image = test_image();
    let payload = sample_archive();
    let transport = Arc::new(MockTransport::new(payload.clone()));
    let manager = make_manager(dir.path(), transport.clone(), manifest_for(&image, URL, &payload));

    let first = manager.ensure_ready(&image, &CancelFlag::new()).await.unwrap();
    let second = manager.ensure_ready(&image, &CancelFlag::new()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(
        transport.fetches(),
        1,
        "a ready image must not be fetched again"
    );
}

#[tokio::test]
async fn test_concurrent_callers_share_one_download() {
    let dir = tempfile::tempdir().unwrap();
    let image = test_image();
    let payload = sample_archive();
    let transport = Arc::new(
        MockTransport::new(payload.clone())
            .chunk_size(64)
            .chunk_delay(std::time::Duration::from_millis(5)),
    );
    let manager = Arc::new(make_manager(
        dir.path(),
        transport.clone(),
        manifest_for(&image, URL, &payload),
    ));

    let a = {
        let manager = Arc::clone(&manager);
        let image = image.clone();
        tokio::spawn(async move { manager.ensure_ready(&image, &CancelFlag::new()).await })
    };
    let b = {
        let manager = Arc::clone(&manager);
        let image = image.clone();
        tokio::spawn(async move { manager.ensure_ready(&image, &CancelFlag::new()).await })
    };

    let path_a = a.await.unwrap().expect("first caller should succeed");
    let path_b = b.await.unwrap().expect("joined caller should succeed");
    assert_eq!(path_a, path_b);
    assert_eq!(
        transport.fetches(),
        1,
        "concurrent callers must join one transfer"
    );
}

// =============================================================================
// Verification
// =============================================================================

#[tokio::test]
async fn test_digest_mismatch_deletes_corrupt_archive() {
    let dir = tempfile::tempdir().unwrap();
    let image = test_image();
    let payload = sample_archive();
    let mut manifest = manifest_for(&image, URL, &payload);
    manifest.images.get_mut(&image).unwrap().digest =
        "sha256:0000000000000000000000000000000000000000000000000000000000000000".to_string();

    let transport = Arc::new(MockTransport::new(payload));
    let manager = make_manager(dir.path(), transport, manifest);

    let err = manager
        .ensure_ready(&image, &CancelFlag::new())
        .await
        .expect_err("mismatched digest must fail");
    assert!(matches!(err, Error::DigestMismatch { .. }), "got {err:?}");
    assert!(
        !manager.store().archive_path(&image).exists(),
        "corrupt archive must be deleted so a retry starts clean"
    );
    assert!(matches!(
        manager.status(&image),
        RootfsStatus::Failed { .. }
    ));
}

// =============================================================================
// Resume and Retry
// =============================================================================

#[tokio::test]
async fn test_transient_failure_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let image = test_image();
    // Large enough to cross one 8 MiB checkpoint boundary.
    let payload: Vec<u8> = (0..9 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let transport = Arc::new(MockTransport::new(payload.clone()));
    transport.fail_after(8 * 1024 * 1024 + 512 * 1024);
    let manager = make_manager(dir.path(), transport.clone(), manifest_for(&image, URL, &payload));

    manager
        .ensure_ready(&image, &CancelFlag::new())
        .await
        .expect_err("gzip garbage fails extraction, but the download must complete");

    let offsets = transport.offsets.lock().unwrap().clone();
    assert_eq!(offsets.len(), 2, "one failure, one retry");
    assert_eq!(offsets[0], 0);
    assert_eq!(
        offsets[1],
        8 * 1024 * 1024,
        "retry must resume from the last checkpoint"
    );
    assert_eq!(
        std::fs::metadata(manager.store().archive_path(&image))
            .unwrap()
            .len(),
        payload.len() as u64,
        "resumed download must complete the archive"
    );
}

#[tokio::test]
async fn test_range_unsupported_restarts_from_zero() {
    let dir = tempfile::tempdir().unwrap();
    let image = test_image();
    let payload = sample_archive();
    let transport = Arc::new(MockTransport::new(payload.clone()).without_range_support());
    let manager = make_manager(dir.path(), transport.clone(), manifest_for(&image, URL, &payload));

    // Fabricate a valid partial state from a previous run.
    let partial = &payload[..payload.len() / 2];
    std::fs::create_dir_all(manager.store().image_dir(&image)).unwrap();
    std::fs::write(manager.store().archive_path(&image), partial).unwrap();
    std::fs::write(
        manager.store().checkpoint_path(&image),
        serde_json::json!({
            "bytes_fetched": partial.len() as u64,
            "prefix_digest": droidbox::verifier::digest_bytes(partial),
        })
        .to_string(),
    )
    .unwrap();

    manager
        .ensure_ready(&image, &CancelFlag::new())
        .await
        .expect("restart from zero should still succeed");

    let offsets = transport.offsets.lock().unwrap().clone();
    assert_eq!(
        offsets,
        vec![partial.len() as u64],
        "resume should be attempted once"
    );
    assert_eq!(manager.status(&image), RootfsStatus::Ready);
}

#[tokio::test]
async fn test_corrupt_partial_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let image = test_image();
    let payload = sample_archive();
    let transport = Arc::new(MockTransport::new(payload.clone()));
    let manager = make_manager(dir.path(), transport.clone(), manifest_for(&image, URL, &payload));

    // Partial file that disagrees with its checkpoint digest.
    std::fs::create_dir_all(manager.store().image_dir(&image)).unwrap();
    std::fs::write(manager.store().archive_path(&image), b"garbage").unwrap();
    std::fs::write(
        manager.store().checkpoint_path(&image),
        serde_json::json!({
            "bytes_fetched": 7u64,
            "prefix_digest": "sha256:not-the-real-prefix",
        })
        .to_string(),
    )
    .unwrap();

    manager
        .ensure_ready(&image, &CancelFlag::new())
        .await
        .expect("pipeline should recover by restarting from zero");

    let offsets = transport.offsets.lock().unwrap().clone();
    assert_eq!(offsets, vec![0], "untrusted partial must not be resumed");
    assert_eq!(manager.status(&image), RootfsStatus::Ready);
}

#[tokio::test]
async fn test_cancelled_download_surfaces_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let image = test_image();
    let payload = sample_archive();
    let transport = Arc::new(MockTransport::new(payload.clone()).chunk_size(16));
    let manager = make_manager(dir.path(), transport, manifest_for(&image, URL, &payload));

    let cancel = CancelFlag::new();
    cancel.cancel();
    let err = manager
        .ensure_ready(&image, &cancel)
        .await
        .expect_err("cancelled flag must abort the pipeline");
    assert!(matches!(err, Error::Cancelled), "got {err:?}");
    assert!(
        !matches!(manager.status(&image), RootfsStatus::Failed { .. }),
        "cancellation is not a failure"
    );
}

// =============================================================================
// Extraction Safety
// =============================================================================

#[tokio::test]
async fn test_extraction_rejects_path_traversal() {
    let dir = tempfile::tempdir().unwrap();
    let image = test_image();
    let payload = build_archive(&[("../evil", "pwned")]);
    let transport = Arc::new(MockTransport::new(payload.clone()));
    let manager = make_manager(dir.path(), transport, manifest_for(&image, URL, &payload));

    let err = manager
        .ensure_ready(&image, &CancelFlag::new())
        .await
        .expect_err("traversal entry must be rejected");
    assert!(matches!(err, Error::PathTraversal { .. }), "got {err:?}");
    assert!(
        !manager.store().rootfs_dir(&image).exists(),
        "partial extraction must be removed"
    );
    assert!(!dir.path().join("images/evil").exists());
}

#[tokio::test]
async fn test_missing_marker_triggers_reextraction() {
    let dir = tempfile::tempdir().unwrap();
    let image = test_image();
    let payload = sample_archive();
    let transport = Arc::new(MockTransport::new(payload.clone()));
    let manager = make_manager(dir.path(), transport.clone(), manifest_for(&image, URL, &payload));

    manager.ensure_ready(&image, &CancelFlag::new()).await.unwrap();

    // Simulate a crash between extraction and marker write.
    std::fs::remove_file(manager.store().marker_path(&image)).unwrap();
    std::fs::remove_dir_all(manager.store().rootfs_dir(&image).join("etc")).unwrap();

    let rootfs = manager
        .ensure_ready(&image, &CancelFlag::new())
        .await
        .expect("re-extraction should succeed");
    assert!(rootfs.join("etc/os-release").is_file());
    assert_eq!(
        transport.fetches(),
        1,
        "the cached complete archive must be reused"
    );
}

#[tokio::test]
async fn test_manifest_digest_bump_reacquires_stale_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let image = test_image();
    let payload_v1 = sample_archive();
    let transport_v1 = Arc::new(MockTransport::new(payload_v1.clone()));
    let manager_v1 = make_manager(
        dir.path(),
        transport_v1,
        manifest_for(&image, URL, &payload_v1),
    );
    manager_v1.ensure_ready(&image, &CancelFlag::new()).await.unwrap();

    // The manifest now advertises updated content at the same URL, as a
    // fresh process would observe after a manifest refresh.
    let payload_v2 = build_archive(&[
        ("etc/os-release", "ID=testdistro\nVERSION=2\n"),
        ("etc/second-revision", "present\n"),
        ("bin/sh", "#!/bin/sh\n"),
    ]);
    let transport_v2 = Arc::new(MockTransport::new(payload_v2.clone()));
    let manager_v2 = make_manager(
        dir.path(),
        transport_v2.clone(),
        manifest_for(&image, URL, &payload_v2),
    );
    assert_eq!(
        manager_v2.status(&image),
        RootfsStatus::NotPresent,
        "an extraction from a superseded digest must not report Ready"
    );

    let rootfs = manager_v2
        .ensure_ready(&image, &CancelFlag::new())
        .await
        .expect("stale extraction must be re-acquired");
    assert!(
        rootfs.join("etc/second-revision").is_file(),
        "the tree must hold the updated content"
    );
    assert_eq!(transport_v2.fetches(), 1, "the new archive must be fetched");
    assert_eq!(
        manager_v2.store().marker_digest(&image).as_deref(),
        Some(droidbox::verifier::digest_bytes(&payload_v2).as_str()),
        "the marker must record the digest the tree came from"
    );
}

// =============================================================================
// Local Install and Eviction
// =============================================================================

#[tokio::test]
async fn test_install_from_local_archive() {
    let dir = tempfile::tempdir().unwrap();
    let image = test_image();
    let payload = sample_archive();
    let transport = Arc::new(MockTransport::new(Vec::new()));
    let manager = make_manager(dir.path(), transport.clone(), RootfsManifest::default());

    let archive_path = dir.path().join("bundled.tar.gz");
    std::fs::write(&archive_path, &payload).unwrap();

    let digest = droidbox::verifier::digest_bytes(&payload);
    let rootfs = manager
        .install_from_archive(&image, &archive_path, Some(&digest))
        .await
        .expect("local install should succeed");
    assert!(rootfs.join("bin/sh").is_file());
    assert_eq!(manager.status(&image), RootfsStatus::Ready);
    assert_eq!(transport.fetches(), 0, "local install must not download");
}

#[tokio::test]
async fn test_evict_refused_while_referenced() {
    let dir = tempfile::tempdir().unwrap();
    let image = test_image();
    let payload = sample_archive();
    let transport = Arc::new(MockTransport::new(payload.clone()));
    let manager = make_manager(dir.path(), transport, manifest_for(&image, URL, &payload));

    manager.ensure_ready(&image, &CancelFlag::new()).await.unwrap();

    let err = manager
        .evict(&image, &FixedRefs(2))
        .await
        .expect_err("referenced image must not be evicted");
    assert!(matches!(err, Error::ImageInUse { refs: 2, .. }), "got {err:?}");
    assert!(manager.store().is_ready(&image), "image must remain intact");

    manager
        .evict(&image, &FixedRefs(0))
        .await
        .expect("unreferenced image evicts");
    assert!(!manager.store().image_dir(&image).exists());
    assert_eq!(manager.status(&image), RootfsStatus::NotPresent);
}

#[tokio::test]
async fn test_installed_images_listing() {
    let dir = tempfile::tempdir().unwrap();
    let image = test_image();
    let payload = sample_archive();
    let transport = Arc::new(MockTransport::new(payload.clone()));
    let manager = make_manager(dir.path(), transport, manifest_for(&image, URL, &payload));

    assert!(manager.store().installed_images().unwrap().is_empty());
    manager.ensure_ready(&image, &CancelFlag::new()).await.unwrap();
    assert_eq!(manager.store().installed_images().unwrap(), vec![image]);
}
