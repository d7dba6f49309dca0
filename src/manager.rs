// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Orchestrator for offline downloads.
//!
//! [`OfflineManager`] owns the task table and the registry of running
//! workers. Both live behind one lock, so every check-then-act on an id is
//! atomic: two `start` calls can never spawn two workers for the same entry.
//! Each worker run carries a run number; reports from a run that is no longer
//! registered are ignored.
//!
//! The table is written to disk after the lock is released: every change takes
//! a numbered snapshot, and a snapshot older than one already written is
//! dropped. A manager also holds the data directory's instance lock until the
//! last clone (including running workers) is gone.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tokio::sync::{broadcast, watch};

use crate::config::ManagerConfig;
use crate::errors::{short_detail, ManagerError};
use crate::events::{EventBus, OfflineEvent};
use crate::locks::{resilient_lock, resilient_read, resilient_write};
use crate::storage::{Fs2SpaceProbe, SpaceProbe, StorageGuard};
use crate::store::{InstanceLock, MetadataStore};
use crate::transport::{ReqwestTransport, Transport, TransportError};
use crate::types::{sort_oldest_first, DownloadEntry, DownloadStatus, DownloadTable, Progress};
use crate::worker::{
    file_len, ProgressReport, StopToken, TransferJob, TransferOutcome, TransferResult,
    TransferWorker, WorkerSettings,
};

const MSG_NO_SPACE_TO_START: &str = "Not enough storage space to start download.";
const MSG_NETWORK_PAUSED: &str = "Network connection issue. Download paused.";
const MSG_PROBE_FAILED: &str = "Download failed: Network request error before starting.";

/// A registered worker run.
struct ActiveWorker {
    run_id: u64,
    stop: StopToken,
    /// Flips to true once the run has fully exited
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct State {
    entries: DownloadTable,
    workers: HashMap<String, ActiveWorker>,
}

impl State {
    fn is_current(&self, id: &str, run_id: u64) -> bool {
        self.workers.get(id).is_some_and(|w| w.run_id == run_id)
    }
}

struct Shared {
    config: ManagerConfig,
    store: MetadataStore,
    guard: StorageGuard,
    transport: Arc<dyn Transport>,
    events: EventBus,
    state: RwLock<State>,
    next_run: AtomicU64,
    /// Last snapshot number taken
    generation: AtomicU64,
    /// Last snapshot number written; also serializes writers
    saved: Mutex<u64>,
    _instance: InstanceLock,
}

/// A table snapshot waiting to be written.
struct PendingSave {
    generation: u64,
    entries: DownloadTable,
}

/// Releases a run's registry slot and wakes waiters, however the run ends.
///
/// Holds the manager weakly so a finished run never keeps the data directory
/// locked after its waiters wake.
struct RunGuard {
    shared: Weak<Shared>,
    id: String,
    run_id: u64,
    done: watch::Sender<bool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = resilient_write(&shared.state);
            if state.is_current(&self.id, self.run_id) {
                state.workers.remove(&self.id);
            }
        }
        let _ = self.done.send(true);
    }
}

/// Everything `start` needs once a slot is reserved.
struct Reservation {
    guard: RunGuard,
    stop: StopToken,
    url: String,
    file_path: PathBuf,
    known_total: u64,
}

/// Offline download manager.
///
/// Cheap to clone; clones share the same table, workers and event bus.
#[derive(Clone)]
pub struct OfflineManager {
    shared: Arc<Shared>,
}

impl OfflineManager {
    /// Manager with the HTTP transport and real free-space queries.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(config.head_timeout(), config.request_timeout())?;
        Self::with_components(config, Arc::new(transport), Arc::new(Fs2SpaceProbe))
    }

    /// Manager with an explicit transport and space probe.
    ///
    /// Takes the data directory's instance lock, failing with
    /// [`ManagerError::Busy`] while another manager holds it, then loads the
    /// persisted table; interrupted transfers come back paused.
    pub fn with_components(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        probe: Arc<dyn SpaceProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let instance = InstanceLock::acquire(&config.instance_lock_path())?;
        fs::create_dir_all(&config.downloads_dir).with_context(|| {
            format!("Failed to create downloads directory: {:?}", config.downloads_dir)
        })?;

        let store = MetadataStore::new(&config.metadata_file);
        let entries = store.load();
        tracing::info!(
            entries = entries.len(),
            path = %config.metadata_file.display(),
            "Loaded offline downloads"
        );

        let guard = StorageGuard::new(probe, &config.downloads_dir, config.storage_buffer_bytes);
        let events = EventBus::new(config.event_capacity);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                guard,
                transport,
                events,
                state: RwLock::new(State {
                    entries,
                    workers: HashMap::new(),
                }),
                next_run: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                saved: Mutex::new(0),
                _instance: instance,
            }),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// New receiver for [`OfflineEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<OfflineEvent> {
        self.shared.events.subscribe()
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Add an entry and start downloading it.
    ///
    /// No-op when the id exists and is not in a failed or cancelled state.
    pub async fn add(&self, id: &str, url: &str, title: &str, icon_url: &str) -> Result<(), ManagerError> {
        self.add_with_metadata(id, url, title, icon_url, BTreeMap::new()).await
    }

    /// [`add`](Self::add) with catalog metadata stored alongside the record.
    pub async fn add_with_metadata(
        &self,
        id: &str,
        url: &str,
        title: &str,
        icon_url: &str,
        extra: BTreeMap<String, serde_json::Value>,
    ) -> Result<(), ManagerError> {
        let pending = {
            let mut state = resilient_write(&self.shared.state);
            if let Some(existing) = state.entries.get(id) {
                if !existing.status.is_restartable() {
                    tracing::info!(id, status = %existing.status, "Download already present, not adding again");
                    return Ok(());
                }
            }

            let entry = DownloadEntry::new(id, url, title, icon_url, &self.shared.config.downloads_dir)
                .with_extra(extra);
            // Records written under another naming scheme can still clash
            if let Some(other) = state
                .entries
                .values()
                .find(|other| other.id != id && other.file_path == entry.file_path)
            {
                return Err(ManagerError::PathInUse {
                    id: id.to_string(),
                    other: other.id.clone(),
                });
            }
            state.entries.insert(id.to_string(), entry);
            self.snapshot(&state)
        };
        self.save(pending);

        tracing::info!(id, url, "Added download");
        self.emit_status(id, DownloadStatus::Pending);
        self.start(id).await
    }

    /// Start (or restart) the transfer for `id`.
    ///
    /// No-op when it is completed or a worker is already running. Probes the
    /// size first and refuses with `StorageFull` when the remaining bytes plus
    /// the safety buffer do not fit.
    pub async fn start(&self, id: &str) -> Result<(), ManagerError> {
        let Some(reservation) = self.reserve(id).await? else {
            return Ok(());
        };
        let Reservation {
            guard: run,
            stop,
            url,
            file_path,
            known_total,
        } = reservation;
        let run_id = run.run_id;

        let probe = tokio::select! {
            biased;
            _ = stop.stopped() => {
                tracing::debug!(id, "Stopped during size probe");
                return Ok(());
            }
            probe = self.shared.transport.head(&url) => probe,
        };

        let probed_len = match probe {
            Ok(info) => info.content_length,
            // HEAD not supported: size stays unknown
            Err(TransportError::Http(405 | 501)) => None,
            Err(TransportError::Http(code)) => {
                self.fail_before_start(
                    id,
                    run_id,
                    DownloadStatus::Error,
                    format!("Download failed: Server error {}", code),
                );
                return Ok(());
            }
            Err(TransportError::Network(detail)) => {
                tracing::warn!(id, "Size probe failed: {}", short_detail(&detail));
                self.fail_before_start(id, run_id, DownloadStatus::Paused, MSG_NETWORK_PAUSED.to_string());
                return Ok(());
            }
            Err(TransportError::Other(detail)) => {
                tracing::warn!(id, "Size probe failed: {}", short_detail(&detail));
                self.fail_before_start(id, run_id, DownloadStatus::Error, MSG_PROBE_FAILED.to_string());
                return Ok(());
            }
        };

        let on_disk = file_len(&file_path).await.unwrap_or(0);
        let total = probed_len.or((known_total > 0).then_some(known_total));
        let required = total.map(|total| total.saturating_sub(on_disk));
        if !self.shared.guard.check_before_start(required) {
            tracing::warn!(id, required = ?required, "Not enough free space to start");
            self.fail_before_start(id, run_id, DownloadStatus::StorageFull, MSG_NO_SPACE_TO_START.to_string());
            return Ok(());
        }

        let pending = {
            let mut state = resilient_write(&self.shared.state);
            if !state.is_current(id, run_id) || stop.is_stopped() {
                return Ok(());
            }
            let Some(entry) = state.entries.get_mut(id) else {
                return Ok(());
            };
            if !entry.transition(DownloadStatus::Downloading) {
                return Ok(());
            }
            if let Some(len) = probed_len {
                entry.expected_size_bytes = len;
            }
            entry.actual_size_bytes = on_disk;
            if entry.expected_size_bytes > 0 {
                entry.progress = Progress::from_bytes(on_disk, entry.expected_size_bytes);
            }
            self.snapshot(&state)
        };
        self.save(pending);

        tracing::info!(id, offset = on_disk, total = ?total, "Download started");
        self.emit_status(id, DownloadStatus::Downloading);

        let job = TransferJob {
            id: id.to_string(),
            url,
            file_path: file_path.clone(),
            known_total: total.unwrap_or(0),
        };
        let worker = TransferWorker::new(
            job,
            self.shared.transport.clone(),
            &self.shared.guard,
            stop,
            WorkerSettings::from(&self.shared.config),
        );

        let manager = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let reporter = manager.clone();
            let result = worker
                .run(move |report| reporter.on_progress(run_id, report))
                .await;
            manager.finish(&id, run_id, &file_path, result);
            // Let go of the manager before waking waiters
            drop(manager);
            drop(run);
        });

        Ok(())
    }

    /// Reserve the worker slot for `id`, waiting out a run that is still
    /// stopping. `None` means there is nothing to start.
    async fn reserve(&self, id: &str) -> Result<Option<Reservation>, ManagerError> {
        loop {
            let mut stopping = {
                let mut state = resilient_write(&self.shared.state);
                let entry = state
                    .entries
                    .get(id)
                    .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

                if entry.status == DownloadStatus::Completed {
                    tracing::debug!(id, "Already completed, nothing to start");
                    return Ok(None);
                }

                match state.workers.get(id) {
                    Some(worker) if !worker.stop.is_stopped() => {
                        tracing::debug!(id, "Worker already running");
                        return Ok(None);
                    }
                    Some(worker) => worker.done.clone(),
                    None => {
                        let url = entry.url.clone();
                        let file_path = entry.file_path.clone();
                        let known_total = entry.expected_size_bytes;

                        let run_id = self.shared.next_run.fetch_add(1, Ordering::SeqCst);
                        let stop = StopToken::new();
                        let (done_tx, done_rx) = watch::channel(false);
                        state.workers.insert(
                            id.to_string(),
                            ActiveWorker {
                                run_id,
                                stop: stop.clone(),
                                done: done_rx,
                            },
                        );

                        return Ok(Some(Reservation {
                            guard: RunGuard {
                                shared: Arc::downgrade(&self.shared),
                                id: id.to_string(),
                                run_id,
                                done: done_tx,
                            },
                            stop,
                            url,
                            file_path,
                            known_total,
                        }));
                    }
                }
            };

            // The previous run checks its token at the next chunk boundary
            tracing::debug!(id, "Waiting for previous run to stop");
            let _ = stopping.wait_for(|done| *done).await;
        }
    }

    /// Pause a running or pending download, keeping the partial file.
    pub fn pause(&self, id: &str) -> Result<(), ManagerError> {
        let pending = {
            let mut state = resilient_write(&self.shared.state);
            let State { entries, workers } = &mut *state;
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            let worker = workers.get(id);

            match entry.status {
                DownloadStatus::Paused => return Ok(()),
                DownloadStatus::Completed | DownloadStatus::Cancelled => {
                    return Err(invalid(entry, "pause"));
                }
                _ if worker.is_some() => {}
                DownloadStatus::Pending | DownloadStatus::Downloading => {}
                _ => return Err(invalid(entry, "pause")),
            }

            if let Some(worker) = worker {
                worker.stop.pause();
            }
            entry.transition(DownloadStatus::Paused);
            self.snapshot(&state)
        };
        self.save(pending);

        tracing::info!(id, "Download paused");
        self.emit_status(id, DownloadStatus::Paused);
        Ok(())
    }

    /// Continue a paused, failed or storage-blocked download from its partial file.
    pub async fn resume(&self, id: &str) -> Result<(), ManagerError> {
        self.ensure_status(id, "resume", DownloadStatus::is_resumable)?;
        self.start(id).await
    }

    /// Like [`resume`](Self::resume), also accepting cancelled entries.
    pub async fn retry(&self, id: &str) -> Result<(), ManagerError> {
        self.ensure_status(id, "retry", DownloadStatus::is_retryable)?;
        self.start(id).await
    }

    fn ensure_status(
        &self,
        id: &str,
        action: &'static str,
        allowed: fn(&DownloadStatus) -> bool,
    ) -> Result<(), ManagerError> {
        let state = resilient_read(&self.shared.state);
        let entry = state
            .entries
            .get(id)
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        if allowed(&entry.status) {
            Ok(())
        } else {
            Err(invalid(entry, action))
        }
    }

    /// Stop any transfer and delete the file. The entry stays, as `Cancelled`.
    pub fn cancel(&self, id: &str) -> Result<(), ManagerError> {
        let (removal, pending) = {
            let mut state = resilient_write(&self.shared.state);
            let State { entries, workers } = &mut *state;
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

            if let Some(worker) = workers.get(id) {
                worker.stop.cancel();
            }
            entry.transition(DownloadStatus::Cancelled);
            let removal = delete_file(&entry.file_path);
            entry.reset_progress();
            (removal, self.snapshot(&state))
        };
        self.save(pending);

        tracing::info!(id, "Download cancelled");
        self.emit_status(id, DownloadStatus::Cancelled);
        removal.map_err(ManagerError::Io)
    }

    /// Stop any transfer, delete the file and forget the entry.
    pub fn remove(&self, id: &str) -> Result<(), ManagerError> {
        let (removal, pending) = {
            let mut state = resilient_write(&self.shared.state);
            let entry = state
                .entries
                .remove(id)
                .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

            if let Some(worker) = state.workers.get(id) {
                worker.stop.cancel();
            }
            let removal = delete_file(&entry.file_path);
            (removal, self.snapshot(&state))
        };
        self.save(pending);

        tracing::info!(id, "Download removed");
        self.emit_list_changed();
        removal.map_err(ManagerError::Io)
    }

    /// Pause (or cancel, deleting partial files) every running transfer and
    /// wait up to the shutdown grace period for the workers to exit.
    pub async fn stop_all(&self, cancel_files: bool) {
        let (target, action) = if cancel_files {
            (DownloadStatus::Cancelled, "cancel")
        } else {
            (DownloadStatus::Paused, "pause")
        };

        let (ids, waiters, pending): (Vec<String>, Vec<watch::Receiver<bool>>, PendingSave) = {
            let mut state = resilient_write(&self.shared.state);
            let State { entries, workers } = &mut *state;

            let mut ids = Vec::new();
            let mut waiters = Vec::new();
            for (id, worker) in workers.iter() {
                if cancel_files {
                    worker.stop.cancel();
                } else {
                    worker.stop.pause();
                }
                waiters.push(worker.done.clone());

                if let Some(entry) = entries.get_mut(id) {
                    if entry.transition(target) {
                        if cancel_files {
                            if let Err(e) = delete_file(&entry.file_path) {
                                tracing::warn!(id = %id, "Failed to delete partial file: {}", e);
                            }
                            entry.reset_progress();
                        }
                        ids.push(id.clone());
                    }
                }
            }
            (ids, waiters, self.snapshot(&state))
        };
        self.save(pending);

        if waiters.is_empty() {
            return;
        }
        tracing::info!(count = waiters.len(), action, "Stopping all downloads");
        for id in &ids {
            self.shared.events.emit(OfflineEvent::StatusChanged {
                id: id.clone(),
                status: target,
            });
        }
        self.emit_list_changed();

        let grace = self.shared.config.shutdown_grace();
        let all_done = join_all(waiters.into_iter().map(|mut done| async move {
            let _ = done.wait_for(|done| *done).await;
        }));
        if tokio::time::timeout(grace, all_done).await.is_err() {
            tracing::warn!(active = self.active_count(), ?grace, "Some downloads did not stop in time");
        }

        let pending = self.snapshot(&resilient_read(&self.shared.state));
        self.save(pending);
    }

    /// Wait until no run is registered for `id`.
    pub async fn wait_idle(&self, id: &str) {
        loop {
            let done = {
                let state = resilient_read(&self.shared.state);
                state.workers.get(id).map(|w| w.done.clone())
            };
            match done {
                Some(mut done) => {
                    let _ = done.wait_for(|done| *done).await;
                }
                None => return,
            }
        }
    }

    /// Wait until no run is registered at all.
    pub async fn wait_all_idle(&self) {
        loop {
            let waiters: Vec<_> = {
                let state = resilient_read(&self.shared.state);
                state.workers.values().map(|w| w.done.clone()).collect()
            };
            if waiters.is_empty() {
                return;
            }
            join_all(waiters.into_iter().map(|mut done| async move {
                let _ = done.wait_for(|done| *done).await;
            }))
            .await;
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn status(&self, id: &str) -> Option<DownloadStatus> {
        resilient_read(&self.shared.state).entries.get(id).map(|e| e.status)
    }

    pub fn progress(&self, id: &str) -> Option<Progress> {
        resilient_read(&self.shared.state).entries.get(id).map(|e| e.progress)
    }

    /// Snapshot of one entry.
    pub fn entry(&self, id: &str) -> Option<DownloadEntry> {
        resilient_read(&self.shared.state).entries.get(id).cloned()
    }

    pub fn file_path(&self, id: &str) -> Option<PathBuf> {
        resilient_read(&self.shared.state)
            .entries
            .get(id)
            .map(|e| e.file_path.clone())
    }

    /// Completed with a non-empty file on disk.
    pub fn is_downloaded(&self, id: &str) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        entry.status == DownloadStatus::Completed
            && fs::metadata(&entry.file_path).is_ok_and(|m| m.len() > 0)
    }

    /// Snapshot of every entry, oldest first.
    pub fn all_entries(&self) -> Vec<DownloadEntry> {
        let mut entries: Vec<DownloadEntry> = resilient_read(&self.shared.state)
            .entries
            .values()
            .cloned()
            .collect();
        sort_oldest_first(&mut entries);
        entries
    }

    /// Bytes on disk across all entries.
    pub fn total_storage_used(&self) -> u64 {
        resilient_read(&self.shared.state)
            .entries
            .values()
            .map(DownloadEntry::stored_bytes)
            .sum()
    }

    /// Number of registered worker runs, including ones still stopping.
    pub fn active_count(&self) -> usize {
        resilient_read(&self.shared.state).workers.len()
    }

    // ========================================================================
    // Worker callbacks
    // ========================================================================

    fn on_progress(&self, run_id: u64, report: ProgressReport) {
        let (percent, pending) = {
            let mut state = resilient_write(&self.shared.state);
            if !state.is_current(&report.id, run_id) {
                return;
            }
            let Some(entry) = state.entries.get_mut(&report.id) else {
                return;
            };
            if entry.status != DownloadStatus::Downloading {
                return;
            }
            entry.actual_size_bytes = report.bytes_on_disk;
            if report.expected_size > 0 {
                entry.expected_size_bytes = report.expected_size;
            }
            entry.progress = report.progress;
            let percent = entry.progress.as_i32();
            (percent, self.snapshot(&state))
        };
        self.save(pending);

        tracing::debug!(id = %report.id, percent, bytes = report.bytes_on_disk, "Progress");
        self.shared.events.emit(OfflineEvent::Progress {
            id: report.id,
            percent,
        });
    }

    fn finish(&self, id: &str, run_id: u64, file_path: &Path, result: TransferResult) {
        let mut error_message = None;
        let mut completed = false;

        let (status, pending) = {
            let mut state = resilient_write(&self.shared.state);
            let current = state.is_current(id, run_id);
            if current {
                state.workers.remove(id);
            }

            let State { entries, workers } = &mut *state;
            let Some(entry) = entries.get_mut(id) else {
                // Removed while running
                if !workers.contains_key(id) {
                    let _ = delete_file(file_path);
                }
                return;
            };
            if !current {
                if matches!(result.outcome, TransferOutcome::StoppedForCancel)
                    && entry.status == DownloadStatus::Cancelled
                    && !workers.contains_key(id)
                {
                    let _ = delete_file(file_path);
                }
                return;
            }

            entry.actual_size_bytes = result.bytes_on_disk;
            if result.expected_size > 0 {
                entry.expected_size_bytes = result.expected_size;
            }

            let cancelled = entry.status == DownloadStatus::Cancelled
                || matches!(result.outcome, TransferOutcome::StoppedForCancel);

            if cancelled {
                if let Err(e) = delete_file(file_path) {
                    tracing::warn!(id, "Failed to delete cancelled file: {}", e);
                }
                entry.reset_progress();
                entry.transition(DownloadStatus::Cancelled);
            } else {
                match result.outcome {
                    TransferOutcome::Completed => {
                        if entry.transition(DownloadStatus::Completed) {
                            entry.expected_size_bytes = result.bytes_on_disk;
                            entry.progress = Progress::Known(100);
                            completed = true;
                        }
                    }
                    TransferOutcome::StoppedForPause => {
                        entry.transition(DownloadStatus::Paused);
                    }
                    TransferOutcome::StoppedForCancel => {}
                    TransferOutcome::Failed(ref error) => {
                        if entry.status == DownloadStatus::Paused {
                            tracing::debug!(id, "Ignoring failure after pause: {}", error);
                        } else if entry.transition(error.status()) {
                            tracing::warn!(id, kind = error.kind(), "Download failed: {}", error);
                            error_message = Some(error.user_message());
                        }
                    }
                }
                if entry.status != DownloadStatus::Completed && entry.expected_size_bytes > 0 {
                    entry.progress = Progress::from_bytes(entry.actual_size_bytes, entry.expected_size_bytes);
                }
            }

            let status = entry.status;
            (status, self.snapshot(&state))
        };
        self.save(pending);

        if completed {
            tracing::info!(id, "Download completed");
            self.shared.events.emit(OfflineEvent::Completed { id: id.to_string() });
        }
        if let Some(message) = error_message {
            self.shared.events.emit(OfflineEvent::Error {
                id: id.to_string(),
                message,
            });
        }
        self.emit_status(id, status);
    }

    /// Record a failure that happened before the worker was spawned.
    fn fail_before_start(&self, id: &str, run_id: u64, status: DownloadStatus, message: String) {
        let pending = {
            let mut state = resilient_write(&self.shared.state);
            if !state.is_current(id, run_id) {
                return;
            }
            state.workers.remove(id);
            let Some(entry) = state.entries.get_mut(id) else {
                return;
            };
            if !entry.transition(status) {
                return;
            }
            self.snapshot(&state)
        };
        self.save(pending);

        tracing::warn!(id, status = %status, "{}", message);
        self.shared.events.emit(OfflineEvent::Error {
            id: id.to_string(),
            message,
        });
        self.emit_status(id, status);
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Number and copy the table for [`save`](Self::save). Call with the
    /// state lock held so numbers follow the order of changes.
    fn snapshot(&self, state: &State) -> PendingSave {
        PendingSave {
            generation: self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1,
            entries: state.entries.clone(),
        }
    }

    /// Write a snapshot unless a newer one is already on disk.
    ///
    /// Runs without the state lock, so a slow disk or a contended metadata
    /// lock never stalls queries. Failures are logged and the in-memory state
    /// kept.
    fn save(&self, pending: PendingSave) {
        let mut saved = resilient_lock(&self.shared.saved);
        if *saved >= pending.generation {
            tracing::trace!(generation = pending.generation, "Skipping superseded metadata snapshot");
            return;
        }
        match self.shared.store.save(&pending.entries) {
            Ok(()) => *saved = pending.generation,
            Err(e) => tracing::warn!("Failed to persist download metadata: {:#}", e),
        }
    }

    fn emit_status(&self, id: &str, status: DownloadStatus) {
        self.shared.events.emit(OfflineEvent::StatusChanged {
            id: id.to_string(),
            status,
        });
        self.emit_list_changed();
    }

    fn emit_list_changed(&self) {
        self.shared.events.emit(OfflineEvent::ListChanged);
        self.shared.events.emit(OfflineEvent::StorageUsage {
            total_bytes: self.total_storage_used(),
        });
    }
}

fn invalid(entry: &DownloadEntry, action: &'static str) -> ManagerError {
    ManagerError::InvalidState {
        id: entry.id.clone(),
        status: entry.status,
        action,
    }
}

/// Delete `path`; a missing file is not an error.
fn delete_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
