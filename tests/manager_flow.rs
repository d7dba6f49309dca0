// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end manager flows against the in-memory transport.
//!
//! Every test gets its own data directory and a fixed free-space probe, so
//! nothing here touches the network or depends on the host's disk.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

use offline_vault::storage::FixedSpaceProbe;
use offline_vault::{
    DownloadEntry, DownloadStatus, DownloadTable, ManagerConfig, ManagerError, MemoryResource,
    MemoryTransport, MetadataStore, OfflineEvent, OfflineManager, Progress,
};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;
const TEST_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// FIXTURE
// =============================================================================

struct Fixture {
    dir: TempDir,
    transport: Arc<MemoryTransport>,
    probe: FixedSpaceProbe,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
            transport: Arc::new(MemoryTransport::new()),
            probe: FixedSpaceProbe::new(2 * GIB),
        }
    }

    fn config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::with_data_dir(self.dir.path());
        config.chunk_size = 4096;
        config.progress_interval = 4;
        config.shutdown_grace_ms = 5000;
        config
    }

    fn try_manager(&self) -> anyhow::Result<OfflineManager> {
        OfflineManager::with_components(
            self.config(),
            self.transport.clone(),
            Arc::new(self.probe.clone()),
        )
    }

    fn manager(&self) -> OfflineManager {
        self.try_manager().expect("Failed to create manager")
    }
}

fn slow(len: usize) -> MemoryResource {
    MemoryResource::patterned(len)
        .frame_size(4096)
        .frame_delay(Duration::from_millis(2))
}

async fn settle(manager: &OfflineManager, id: &str) {
    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), manager.wait_idle(id))
        .await
        .expect("Download did not settle in time");
}

fn drain(events: &mut broadcast::Receiver<OfflineEvent>) -> Vec<OfflineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn statuses_for(events: &[OfflineEvent], wanted: &str) -> Vec<DownloadStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            OfflineEvent::StatusChanged { id, status } if id == wanted => Some(*status),
            _ => None,
        })
        .collect()
}

/// Wait until `id` has reported some progress.
async fn first_progress(events: &mut broadcast::Receiver<OfflineEvent>, wanted: &str) {
    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        loop {
            match events.recv().await {
                Ok(OfflineEvent::Progress { id, percent }) if id == wanted && percent > 0 => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("No progress reported");
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test]
async fn test_add_runs_to_completion() {
    let fx = Fixture::new();
    let resource = MemoryResource::patterned(MIB as usize).frame_size(16 * 1024);
    fx.transport.insert("mem://cdn/m1.mp4", resource.clone());
    let manager = fx.manager();
    let mut events = manager.subscribe();

    manager
        .add("m1", "mem://cdn/m1.mp4", "Title", "https://img.test/m1.png")
        .await
        .unwrap();
    settle(&manager, "m1").await;

    let entry = manager.entry("m1").unwrap();
    assert_eq!(entry.status, DownloadStatus::Completed);
    assert_eq!(entry.progress, Progress::Known(100));
    assert_eq!(entry.expected_size_bytes, MIB);
    assert_eq!(entry.actual_size_bytes, MIB);
    assert_eq!(entry.icon_url, "https://img.test/m1.png");
    assert_eq!(fs::read(&entry.file_path).unwrap(), resource.data().to_vec());
    assert!(manager.is_downloaded("m1"));

    let events = drain(&mut events);
    assert_eq!(
        statuses_for(&events, "m1"),
        vec![DownloadStatus::Pending, DownloadStatus::Downloading, DownloadStatus::Completed]
    );
    assert!(events.contains(&OfflineEvent::Completed { id: "m1".into() }));
    assert!(events.contains(&OfflineEvent::StorageUsage { total_bytes: MIB }));

    let percents: Vec<i32> = events
        .iter()
        .filter_map(|e| match e {
            OfflineEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(!percents.is_empty());
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", percents);
}

#[tokio::test]
async fn test_not_enough_space_to_start() {
    let fx = Fixture::new();
    fx.transport
        .insert("mem://cdn/m2.mp4", MemoryResource::patterned(4096).advertised_length(GIB));
    fx.probe.set(500 * MIB);
    let manager = fx.manager();
    let mut events = manager.subscribe();

    manager.add("m2", "mem://cdn/m2.mp4", "Big", "").await.unwrap();
    settle(&manager, "m2").await;

    assert_eq!(manager.status("m2"), Some(DownloadStatus::StorageFull));
    assert_eq!(manager.active_count(), 0);
    assert!(fx.transport.gets("mem://cdn/m2.mp4").is_empty());
    assert!(!manager.file_path("m2").unwrap().exists());

    let events = drain(&mut events);
    assert!(events.contains(&OfflineEvent::Error {
        id: "m2".into(),
        message: "Not enough storage space to start download.".into(),
    }));
}

#[tokio::test]
async fn test_pause_stops_writing() {
    let fx = Fixture::new();
    fx.transport.insert("mem://cdn/m1.mp4", slow(512 * 1024));
    let manager = fx.manager();
    let mut events = manager.subscribe();

    manager.add("m1", "mem://cdn/m1.mp4", "Title", "").await.unwrap();
    first_progress(&mut events, "m1").await;
    manager.pause("m1").unwrap();
    settle(&manager, "m1").await;

    let entry = manager.entry("m1").unwrap();
    assert_eq!(entry.status, DownloadStatus::Paused);
    let on_disk = fs::metadata(&entry.file_path).unwrap().len();
    assert_eq!(entry.actual_size_bytes, on_disk);
    assert!(on_disk < 512 * 1024);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fs::metadata(&entry.file_path).unwrap().len(), on_disk);
    assert_eq!(fx.transport.gets("mem://cdn/m1.mp4").len(), 1);
}

#[tokio::test]
async fn test_resume_continues_from_partial_file() {
    let fx = Fixture::new();
    let resource = MemoryResource::patterned(102_400);
    fx.transport.insert("mem://cdn/m1.mp4", resource.clone());

    // A previous session left 30,720 bytes behind
    let config = fx.config();
    let mut entry = DownloadEntry::new("m1", "mem://cdn/m1.mp4", "Title", "", &config.downloads_dir);
    entry.status = DownloadStatus::Paused;
    entry.expected_size_bytes = 102_400;
    entry.actual_size_bytes = 30_720;
    entry.progress = Progress::Known(30);
    fs::create_dir_all(&config.downloads_dir).unwrap();
    fs::write(&entry.file_path, vec![0xAB; 30_720]).unwrap();
    let mut table = DownloadTable::new();
    table.insert("m1".into(), entry);
    MetadataStore::new(&config.metadata_file).save(&table).unwrap();

    let manager = fx.manager();
    manager.resume("m1").await.unwrap();
    settle(&manager, "m1").await;

    assert_eq!(manager.status("m1"), Some(DownloadStatus::Completed));
    let gets = fx.transport.gets("mem://cdn/m1.mp4");
    assert_eq!(gets.len(), 1);
    assert_eq!(gets[0].offset, Some(30_720));

    let content = fs::read(manager.file_path("m1").unwrap()).unwrap();
    assert_eq!(content.len(), 102_400);
    assert!(content[..30_720].iter().all(|b| *b == 0xAB), "existing bytes were rewritten");
    assert_eq!(&content[30_720..], &resource.data()[30_720..]);
}

#[tokio::test]
async fn test_cancel_while_downloading() {
    let fx = Fixture::new();
    fx.transport.insert("mem://cdn/m3.mp4", slow(512 * 1024));
    let manager = fx.manager();
    let mut events = manager.subscribe();

    manager.add("m3", "mem://cdn/m3.mp4", "Title", "").await.unwrap();
    first_progress(&mut events, "m3").await;
    manager.cancel("m3").unwrap();
    settle(&manager, "m3").await;

    let entry = manager.entry("m3").unwrap();
    assert_eq!(entry.status, DownloadStatus::Cancelled);
    assert_eq!(entry.progress, Progress::Known(0));
    assert_eq!(entry.actual_size_bytes, 0);
    assert!(!entry.file_path.exists());
    assert_eq!(manager.total_storage_used(), 0);
}

#[tokio::test]
async fn test_corrupted_metadata_starts_empty() {
    let fx = Fixture::new();
    let config = fx.config();
    fs::write(&config.metadata_file, "{ this is not json").unwrap();

    let manager = fx.manager();
    assert!(manager.all_entries().is_empty());
    assert_eq!(manager.total_storage_used(), 0);
}

// =============================================================================
// PROPERTIES
// =============================================================================

#[tokio::test]
async fn test_state_survives_restart() {
    let fx = Fixture::new();
    fx.transport.insert("mem://cdn/done.mkv", MemoryResource::patterned(20_000));
    fx.transport.insert("mem://cdn/half.mp4", slow(512 * 1024));

    {
        let manager = fx.manager();
        let mut events = manager.subscribe();
        manager.add("done", "mem://cdn/done.mkv", "Done", "").await.unwrap();
        settle(&manager, "done").await;
        manager.add("half", "mem://cdn/half.mp4", "Half", "").await.unwrap();
        first_progress(&mut events, "half").await;
        manager.stop_all(false).await;
        assert_eq!(manager.active_count(), 0);
    }

    let manager = fx.manager();
    let entries = manager.all_entries();
    assert_eq!(
        entries.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
        vec!["done", "half"]
    );
    assert!(entries.iter().all(|e| e.status != DownloadStatus::Downloading));
    assert_eq!(manager.status("done"), Some(DownloadStatus::Completed));
    assert_eq!(manager.status("half"), Some(DownloadStatus::Paused));
    assert!(manager.is_downloaded("done"));

    // The paused one picks up where it stopped
    let on_disk = manager.entry("half").unwrap().actual_size_bytes;
    assert!(on_disk > 0);
    manager.resume("half").await.unwrap();
    settle(&manager, "half").await;
    assert_eq!(manager.status("half"), Some(DownloadStatus::Completed));
    assert_eq!(fx.transport.gets("mem://cdn/half.mp4").last().unwrap().offset, Some(on_disk));
}

#[tokio::test]
async fn test_interrupted_download_loads_as_paused() {
    let fx = Fixture::new();
    let config = fx.config();
    let mut entry = DownloadEntry::new("m1", "mem://cdn/m1.mp4", "Title", "", &config.downloads_dir);
    entry.status = DownloadStatus::Downloading;
    let mut table = DownloadTable::new();
    table.insert("m1".into(), entry);
    MetadataStore::new(&config.metadata_file).save(&table).unwrap();

    let manager = fx.manager();
    assert_eq!(manager.status("m1"), Some(DownloadStatus::Paused));
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn test_storage_full_then_space_freed() {
    let fx = Fixture::new();
    fx.transport.insert("mem://cdn/m1.mp4", MemoryResource::patterned(64 * 1024));
    fx.probe.set(MIB);
    let manager = fx.manager();

    manager.add("m1", "mem://cdn/m1.mp4", "Title", "").await.unwrap();
    assert_eq!(manager.status("m1"), Some(DownloadStatus::StorageFull));

    fx.probe.set(2 * GIB);
    manager.resume("m1").await.unwrap();
    settle(&manager, "m1").await;
    assert_eq!(manager.status("m1"), Some(DownloadStatus::Completed));
}

#[tokio::test]
async fn test_network_drop_pauses_then_resumes() {
    let fx = Fixture::new();
    let resource = MemoryResource::patterned(100_000).frame_size(4096).fail_at(40_960);
    fx.transport.insert("mem://cdn/m1.mp4", resource.clone());
    let manager = fx.manager();

    manager.add("m1", "mem://cdn/m1.mp4", "Title", "").await.unwrap();
    settle(&manager, "m1").await;
    let entry = manager.entry("m1").unwrap();
    assert_eq!(entry.status, DownloadStatus::Paused);
    assert_eq!(entry.actual_size_bytes, 40_960);

    // Connection is back
    fx.transport.insert("mem://cdn/m1.mp4", MemoryResource::new(resource.data().clone()));
    manager.resume("m1").await.unwrap();
    settle(&manager, "m1").await;

    assert_eq!(manager.status("m1"), Some(DownloadStatus::Completed));
    assert_eq!(fs::read(&entry.file_path).unwrap(), resource.data().to_vec());
}

#[tokio::test]
async fn test_server_error_then_retry() {
    let fx = Fixture::new();
    fx.transport
        .insert("mem://cdn/m1.mp4", MemoryResource::patterned(10_000).get_status(503));
    let manager = fx.manager();
    let mut events = manager.subscribe();

    manager.add("m1", "mem://cdn/m1.mp4", "Title", "").await.unwrap();
    settle(&manager, "m1").await;
    assert_eq!(manager.status("m1"), Some(DownloadStatus::Error));
    assert!(drain(&mut events).contains(&OfflineEvent::Error {
        id: "m1".into(),
        message: "Download failed: Server error 503".into(),
    }));

    fx.transport.insert("mem://cdn/m1.mp4", MemoryResource::patterned(10_000));
    manager.retry("m1").await.unwrap();
    settle(&manager, "m1").await;
    assert_eq!(manager.status("m1"), Some(DownloadStatus::Completed));
}

#[tokio::test]
async fn test_readding_failed_entry_starts_fresh() {
    let fx = Fixture::new();
    fx.transport.insert("mem://cdn/m1.mp4", MemoryResource::patterned(10_000));
    let manager = fx.manager();

    manager.add("m1", "mem://cdn/m1.mp4", "Old", "").await.unwrap();
    manager.cancel("m1").unwrap();
    settle(&manager, "m1").await;
    assert_eq!(manager.status("m1"), Some(DownloadStatus::Cancelled));

    manager.add("m1", "mem://cdn/m1.mp4", "New", "").await.unwrap();
    settle(&manager, "m1").await;
    let entry = manager.entry("m1").unwrap();
    assert_eq!(entry.title, "New");
    assert_eq!(entry.status, DownloadStatus::Completed);
}

#[tokio::test]
async fn test_stop_all_with_cancel_deletes_partials() {
    let fx = Fixture::new();
    let manager = fx.manager();
    let mut events = manager.subscribe();
    for id in ["a", "b", "c"] {
        let url = format!("mem://cdn/{}.mp4", id);
        fx.transport.insert(url.clone(), slow(512 * 1024));
        manager.add(id, &url, id, "").await.unwrap();
    }
    first_progress(&mut events, "c").await;

    manager.stop_all(true).await;

    assert_eq!(manager.active_count(), 0);
    for entry in manager.all_entries() {
        assert_eq!(entry.status, DownloadStatus::Cancelled);
        assert!(!entry.file_path.exists(), "{} left a file behind", entry.id);
    }
    assert_eq!(manager.total_storage_used(), 0);
}

#[tokio::test]
async fn test_extra_metadata_is_persisted() {
    let fx = Fixture::new();
    fx.transport.insert("mem://cdn/m1.mp4", MemoryResource::patterned(1000));
    let manager = fx.manager();

    let mut extra = std::collections::BTreeMap::new();
    extra.insert("season".to_string(), serde_json::json!(2));
    extra.insert("status".to_string(), serde_json::json!("hijack"));
    manager
        .add_with_metadata("m1", "mem://cdn/m1.mp4", "Title", "", extra)
        .await
        .unwrap();
    settle(&manager, "m1").await;
    drop(manager);

    let manager = fx.manager();
    let entry = manager.entry("m1").unwrap();
    assert_eq!(entry.status, DownloadStatus::Completed);
    assert_eq!(entry.extra.get("season"), Some(&serde_json::json!(2)));
    assert!(!entry.extra.contains_key("status"));
}

// =============================================================================
// CONCURRENCY
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_share_one_worker() {
    let fx = Fixture::new();
    fx.transport.insert("mem://cdn/m1.mp4", slow(256 * 1024));
    let manager = fx.manager();
    manager.add("m1", "mem://cdn/m1.mp4", "Title", "").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move { manager.start("m1").await }));
    }
    for handle in handles {
        handle.await.expect("Task panicked").unwrap();
    }
    settle(&manager, "m1").await;

    assert_eq!(manager.status("m1"), Some(DownloadStatus::Completed));
    assert_eq!(fx.transport.gets("mem://cdn/m1.mp4").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pause_resume_storm_ends_consistent() {
    let fx = Fixture::new();
    let resource = slow(256 * 1024);
    fx.transport.insert("mem://cdn/m1.mp4", resource.clone());
    let manager = fx.manager();
    manager.add("m1", "mem://cdn/m1.mp4", "Title", "").await.unwrap();

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = manager.pause("m1");
        let _ = manager.resume("m1").await;
    }

    let finished = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        loop {
            settle(&manager, "m1").await;
            match manager.status("m1") {
                Some(DownloadStatus::Completed) => return,
                _ => manager.resume("m1").await.unwrap(),
            }
        }
    })
    .await;
    assert!(finished.is_ok(), "Download never completed");

    let content = fs::read(manager.file_path("m1").unwrap()).unwrap();
    assert_eq!(content, resource.data().to_vec());
    assert_eq!(manager.active_count(), 0);
}

// =============================================================================
// FILE NAMES
// =============================================================================

#[tokio::test]
async fn test_ids_that_sanitize_alike_keep_separate_files() {
    let fx = Fixture::new();
    let small = MemoryResource::patterned(5000);
    fx.transport.insert("mem://cdn/one.mp4", small.clone());
    fx.transport.insert("mem://cdn/two.mp4", MemoryResource::patterned(9000));
    let manager = fx.manager();

    manager.add("a b", "mem://cdn/one.mp4", "Spaced", "").await.unwrap();
    settle(&manager, "a b").await;
    manager.add("a_b", "mem://cdn/two.mp4", "Underscored", "").await.unwrap();
    settle(&manager, "a_b").await;

    let spaced = manager.entry("a b").unwrap();
    let underscored = manager.entry("a_b").unwrap();
    assert_ne!(spaced.file_path, underscored.file_path);
    assert_eq!(fs::metadata(&spaced.file_path).unwrap().len(), 5000);
    assert_eq!(fs::metadata(&underscored.file_path).unwrap().len(), 9000);

    manager.cancel("a_b").unwrap();

    assert!(!underscored.file_path.exists());
    assert_eq!(manager.status("a b"), Some(DownloadStatus::Completed));
    assert!(manager.is_downloaded("a b"));
    assert_eq!(fs::read(&spaced.file_path).unwrap(), small.data().to_vec());
}

#[tokio::test]
async fn test_add_refuses_a_file_already_in_use() {
    let fx = Fixture::new();
    fx.transport.insert("mem://cdn/two.mp4", MemoryResource::patterned(9000));

    // Written by an older build that mapped "a b" to a_b.mp4
    let config = fx.config();
    let mut legacy = DownloadEntry::new("a b", "mem://cdn/one.mp4", "Spaced", "", &config.downloads_dir);
    legacy.file_path = config.downloads_dir.join("a_b.mp4");
    legacy.status = DownloadStatus::Completed;
    fs::create_dir_all(&config.downloads_dir).unwrap();
    fs::write(&legacy.file_path, vec![1u8; 5000]).unwrap();
    let mut table = DownloadTable::new();
    table.insert("a b".into(), legacy.clone());
    MetadataStore::new(&config.metadata_file).save(&table).unwrap();

    let manager = fx.manager();
    match manager.add("a_b", "mem://cdn/two.mp4", "Underscored", "").await {
        Err(ManagerError::PathInUse { id, other }) => {
            assert_eq!(id, "a_b");
            assert_eq!(other, "a b");
        }
        other => panic!("expected PathInUse, got {:?}", other),
    }

    assert!(manager.entry("a_b").is_none());
    assert!(fx.transport.requests().is_empty());
    assert_eq!(fs::metadata(&legacy.file_path).unwrap().len(), 5000);
}

// =============================================================================
// DATA DIRECTORY
// =============================================================================

#[tokio::test]
async fn test_second_manager_on_same_dir_is_refused() {
    let fx = Fixture::new();
    let resource = slow(256 * 1024);
    fx.transport.insert("mem://cdn/m1.mp4", resource.clone());
    let owner = fx.manager();
    let mut events = owner.subscribe();

    owner.add("m1", "mem://cdn/m1.mp4", "Title", "").await.unwrap();
    first_progress(&mut events, "m1").await;

    let err = fx.try_manager().err().expect("second manager must not open");
    match err.downcast_ref::<ManagerError>() {
        Some(ManagerError::Busy { data_dir }) => assert_eq!(data_dir, fx.dir.path()),
        other => panic!("expected Busy, got {:?}", other),
    }

    // The saved table shows the transfer as running, not paused
    let saved = MetadataStore::new(&fx.config().metadata_file).snapshot().unwrap();
    assert_eq!(saved["m1"].status, DownloadStatus::Downloading);

    settle(&owner, "m1").await;
    assert_eq!(owner.status("m1"), Some(DownloadStatus::Completed));
    drop(owner);

    let next = fx.manager();
    let entry = next.entry("m1").unwrap();
    assert_eq!(entry.status, DownloadStatus::Completed);
    assert_eq!(fs::read(&entry.file_path).unwrap(), resource.data().to_vec());
}

#[tokio::test]
async fn test_data_dir_released_after_stop_all() {
    let fx = Fixture::new();
    fx.transport.insert("mem://cdn/m1.mp4", slow(512 * 1024));

    let owner = fx.manager();
    let mut events = owner.subscribe();
    owner.add("m1", "mem://cdn/m1.mp4", "Title", "").await.unwrap();
    first_progress(&mut events, "m1").await;
    owner.stop_all(false).await;
    drop(owner);

    let next = fx.try_manager().expect("data dir still locked after shutdown");
    assert_eq!(next.status("m1"), Some(DownloadStatus::Paused));
}

// =============================================================================
// PERSISTENCE
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queries_do_not_wait_for_metadata_writes() {
    use fs2::FileExt;

    let fx = Fixture::new();
    fx.transport.insert("mem://cdn/m1.mp4", MemoryResource::patterned(10_000));
    let manager = fx.manager();
    manager.add("m1", "mem://cdn/m1.mp4", "Title", "").await.unwrap();
    settle(&manager, "m1").await;

    // Someone else holds the metadata lock, so the next save has to wait
    let config = fx.config();
    let held = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(config.metadata_file.with_extension("lock"))
        .unwrap();
    FileExt::lock_exclusive(&held).unwrap();

    let canceller = manager.clone();
    let cancel = tokio::task::spawn_blocking(move || canceller.cancel("m1"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reader = manager.clone();
    let status = timeout(
        Duration::from_secs(1),
        tokio::task::spawn_blocking(move || reader.status("m1")),
    )
    .await
    .expect("status() blocked behind a metadata write")
    .expect("Task panicked");
    assert_eq!(status, Some(DownloadStatus::Cancelled));

    FileExt::unlock(&held).unwrap();
    cancel.await.expect("Task panicked").unwrap();

    let saved = MetadataStore::new(&config.metadata_file).snapshot().unwrap();
    assert_eq!(saved["m1"].status, DownloadStatus::Cancelled);
}
