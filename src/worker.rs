// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Streams one entry's bytes to disk.
//!
//! A worker resumes from whatever is already on disk, writes the body in
//! fixed-size chunks, checks its [`StopToken`] and [`SpaceBudget`] before
//! every write, and reports progress through a callback. It never touches the
//! task table; the manager turns the returned [`TransferResult`] into a status.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::config::ManagerConfig;
use crate::errors::TransferError;
use crate::storage::{SpaceBudget, StorageGuard};
use crate::transport::Transport;
use crate::types::Progress;

// ============================================================================
// Stop token
// ============================================================================

/// Cooperative stop request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopSignal {
    #[default]
    None,
    /// Stop and keep the partial file
    Pause,
    /// Stop; the partial file will be deleted
    Cancel,
}

/// Shared stop flag for one worker run.
///
/// Clones observe the same signal. A cancel is never downgraded to a pause.
#[derive(Debug, Clone)]
pub struct StopToken {
    tx: Arc<watch::Sender<StopSignal>>,
    rx: watch::Receiver<StopSignal>,
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

impl StopToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(StopSignal::None);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn pause(&self) {
        self.tx.send_if_modified(|signal| {
            if *signal == StopSignal::None {
                *signal = StopSignal::Pause;
                true
            } else {
                false
            }
        });
    }

    pub fn cancel(&self) {
        self.tx.send_replace(StopSignal::Cancel);
    }

    /// Current signal.
    pub fn signal(&self) -> StopSignal {
        *self.rx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.signal() != StopSignal::None
    }

    /// Resolves once a pause or cancel has been requested.
    pub async fn stopped(&self) -> StopSignal {
        let mut rx = self.rx.clone();
        let signal = match rx.wait_for(|signal| *signal != StopSignal::None).await {
            Ok(signal) => *signal,
            Err(_) => StopSignal::None,
        };
        if signal == StopSignal::None {
            // Sender gone: no stop can ever arrive
            std::future::pending::<()>().await;
        }
        signal
    }
}

// ============================================================================
// Worker
// ============================================================================

/// What to download and where.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: String,
    pub url: String,
    pub file_path: PathBuf,
    /// Total size from an earlier probe or run, 0 when unknown
    pub known_total: u64,
}

/// Chunking and reporting knobs.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub chunk_size: usize,
    pub progress_interval: u32,
    pub space_check_interval: u32,
}

impl From<&ManagerConfig> for WorkerSettings {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            progress_interval: config.progress_interval.max(1),
            space_check_interval: config.space_check_interval.max(1),
        }
    }
}

/// Progress snapshot sent while a transfer runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressReport {
    pub id: String,
    /// Bytes written by this run
    pub session_bytes: u64,
    pub bytes_on_disk: u64,
    /// Total size, 0 when unknown
    pub expected_size: u64,
    pub progress: Progress,
}

/// How a run ended.
#[derive(Debug)]
pub enum TransferOutcome {
    Completed,
    StoppedForPause,
    StoppedForCancel,
    Failed(TransferError),
}

/// Final state of a run.
#[derive(Debug)]
pub struct TransferResult {
    pub outcome: TransferOutcome,
    pub bytes_on_disk: u64,
    /// Total size as last determined, 0 when unknown
    pub expected_size: u64,
}

/// One transfer of one entry.
pub struct TransferWorker {
    job: TransferJob,
    transport: Arc<dyn Transport>,
    budget: SpaceBudget,
    stop: StopToken,
    settings: WorkerSettings,
    expected: u64,
}

impl TransferWorker {
    pub fn new(
        job: TransferJob,
        transport: Arc<dyn Transport>,
        guard: &StorageGuard,
        stop: StopToken,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            expected: job.known_total,
            budget: guard.budget(settings.space_check_interval),
            job,
            transport,
            stop,
            settings,
        }
    }

    /// Run to completion, stop or failure. Never panics on I/O errors.
    pub async fn run<F>(mut self, mut report: F) -> TransferResult
    where
        F: FnMut(ProgressReport) + Send,
    {
        let outcome = match self.transfer(&mut report).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!(id = %self.job.id, kind = e.kind(), "Transfer failed: {}", e);
                TransferOutcome::Failed(e)
            }
        };

        let bytes_on_disk = file_len(&self.job.file_path).await.unwrap_or(0);
        let expected_size = match outcome {
            TransferOutcome::Completed => bytes_on_disk,
            _ => self.expected,
        };

        TransferResult {
            outcome,
            bytes_on_disk,
            expected_size,
        }
    }

    async fn transfer<F>(&mut self, report: &mut F) -> Result<TransferOutcome, TransferError>
    where
        F: FnMut(ProgressReport) + Send,
    {
        let path = self.job.file_path.clone();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut existing = file_len(&path).await?;
        let known = self.job.known_total;

        if known > 0 && existing == known {
            tracing::info!(id = %self.job.id, bytes = existing, "File already complete on disk");
            report(self.snapshot(0, existing));
            return Ok(TransferOutcome::Completed);
        }
        if known > 0 && existing > known {
            tracing::warn!(
                id = %self.job.id,
                on_disk = existing,
                expected = known,
                "Partial file larger than expected, restarting from zero"
            );
            remove_partial(&path).await?;
            existing = 0;
        }

        if let Some(outcome) = stop_outcome(self.stop.signal()) {
            return Ok(outcome);
        }

        let (response, total) = loop {
            let offset = (existing > 0).then_some(existing);
            let response = tokio::select! {
                biased;
                signal = self.stop.stopped() => {
                    return Ok(stop_outcome(signal).unwrap_or(TransferOutcome::StoppedForPause));
                }
                response = self.transport.get(&self.job.url, offset) => response?,
            };

            if response.status == 416 && offset.is_some() {
                if response.content_range_total == Some(existing) {
                    tracing::info!(id = %self.job.id, bytes = existing, "Server reports file already complete");
                    self.expected = existing;
                    report(self.snapshot(0, existing));
                    return Ok(TransferOutcome::Completed);
                }
                tracing::warn!(id = %self.job.id, offset = existing, "Resume offset rejected, restarting from zero");
                remove_partial(&path).await?;
                existing = 0;
                continue;
            }
            if !response.is_success() {
                return Err(TransferError::Http { code: response.status });
            }

            if response.is_partial() && offset.is_some() {
                let total = response
                    .content_range_total
                    .or_else(|| response.content_length.map(|len| existing + len))
                    .unwrap_or(0);
                break (response, total);
            }
            if offset.is_some() {
                tracing::info!(id = %self.job.id, "Server ignored range request, restarting from zero");
                existing = 0;
            }
            let total = response.content_length.unwrap_or(0);
            break (response, total);
        };
        self.expected = total;

        tracing::debug!(
            id = %self.job.id,
            offset = existing,
            total,
            status = response.status,
            "Streaming body"
        );

        let mut file = open_destination(&path, existing > 0).await?;
        let mut body = response.body;
        let mut on_disk = existing;
        let mut session = 0u64;
        let mut chunks = 0u64;
        let interval = u64::from(self.settings.progress_interval);

        report(self.snapshot(session, on_disk));

        loop {
            let frame = tokio::select! {
                biased;
                signal = self.stop.stopped() => {
                    file.flush().await?;
                    return Ok(stop_outcome(signal).unwrap_or(TransferOutcome::StoppedForPause));
                }
                frame = body.next() => frame,
            };

            let mut rest = match frame {
                None => break,
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    file.flush().await?;
                    return Err(e.into());
                }
            };

            while !rest.is_empty() {
                let piece = rest.split_to(rest.len().min(self.settings.chunk_size));

                if let Some(outcome) = stop_outcome(self.stop.signal()) {
                    file.flush().await?;
                    return Ok(outcome);
                }
                if !self.budget.admit(piece.len() as u64) {
                    file.flush().await?;
                    return Err(TransferError::InsufficientSpace);
                }

                file.write_all(&piece).await?;
                on_disk += piece.len() as u64;
                session += piece.len() as u64;
                chunks += 1;

                if chunks % interval == 0 {
                    report(self.snapshot(session, on_disk));
                }
            }
        }

        file.flush().await?;
        file.sync_data().await?;

        if total > 0 && on_disk < total {
            return Err(TransferError::Incomplete {
                expected: total,
                actual: on_disk,
            });
        }

        self.expected = on_disk;
        report(self.snapshot(session, on_disk));
        tracing::info!(id = %self.job.id, bytes = on_disk, session, "Transfer finished");
        Ok(TransferOutcome::Completed)
    }

    fn snapshot(&self, session_bytes: u64, bytes_on_disk: u64) -> ProgressReport {
        ProgressReport {
            id: self.job.id.clone(),
            session_bytes,
            bytes_on_disk,
            expected_size: self.expected,
            progress: Progress::from_bytes(bytes_on_disk, self.expected),
        }
    }
}

fn stop_outcome(signal: StopSignal) -> Option<TransferOutcome> {
    match signal {
        StopSignal::None => None,
        StopSignal::Pause => Some(TransferOutcome::StoppedForPause),
        StopSignal::Cancel => Some(TransferOutcome::StoppedForCancel),
    }
}

/// Size of the file at `path`, 0 when it does not exist.
pub(crate) async fn file_len(path: &Path) -> io::Result<u64> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

async fn remove_partial(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn open_destination(path: &Path, append: bool) -> io::Result<File> {
    if append {
        OpenOptions::new().append(true).open(path).await
    } else {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
    }
}
