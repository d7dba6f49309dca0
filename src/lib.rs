// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! offline-vault - Offline download manager library
//!
//! Downloads media files in the background so they can be played without a
//! connection. Transfers can be paused, resumed from the bytes already on
//! disk, cancelled, and they survive process restarts.
//!
//! # Core Modules
//!
//! - [`manager`] - The orchestrator: task table, worker registry, commands
//! - [`worker`] - One resumable transfer of one file
//! - [`storage`] - Free-space checks with a safety buffer
//! - [`store`] - Locked, atomic JSON persistence of the task table
//! - [`transport`] - HTTP (and in-memory) byte sources with range support
//! - [`events`] - Change notifications for a UI layer
//! - [`config`] - Tunables loaded from `config.json`
//! - [`error`] - Terminal-friendly error reports
//!
//! # Example
//!
//! ```no_run
//! use offline_vault::{ManagerConfig, OfflineManager};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let manager = OfflineManager::new(ManagerConfig::load()?)?;
//! manager
//!     .add("m1", "https://cdn.example.com/m1.mp4", "Episode 1", "")
//!     .await?;
//! manager.wait_idle("m1").await;
//! println!("{:?}", manager.status("m1"));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod errors;
pub mod events;
pub mod locks;
pub mod manager;
pub mod storage;
pub mod store;
pub mod transport;
pub mod types;
pub mod worker;

pub use config::ManagerConfig;
pub use errors::{ManagerError, TransferError};
pub use events::{EventBus, OfflineEvent};
pub use manager::OfflineManager;
pub use storage::{format_bytes, Fs2SpaceProbe, SpaceProbe, StorageGuard};
pub use store::MetadataStore;
pub use transport::{
    MemoryResource, MemoryTransport, ProbeInfo, ReqwestTransport, Transport, TransportError,
    TransportResponse,
};
pub use types::{DownloadEntry, DownloadStatus, DownloadTable, Progress};
