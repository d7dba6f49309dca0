// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Byte transport used by transfer workers.
//!
//! Workers only need two calls: a HEAD-style size probe and a GET that can
//! start at a byte offset. [`ReqwestTransport`] does this over HTTP;
//! [`MemoryTransport`] serves canned bytes for tests and demos.

mod http;
mod memory;

pub use http::ReqwestTransport;
pub use memory::{MemoryResource, MemoryTransport, RecordedRequest};

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Response body as a stream of byte frames.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connect failure, timeout or dropped connection
    #[error("network error: {0}")]
    Network(String),

    /// Non-success status on a probe
    #[error("HTTP {0}")]
    Http(u16),

    #[error("{0}")]
    Other(String),
}

/// Result of a size probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeInfo {
    /// Total size when the server announced one
    pub content_length: Option<u64>,
}

/// Status, size headers and body of a GET.
pub struct TransportResponse {
    pub status: u16,
    /// Length of this response body, if announced
    pub content_length: Option<u64>,
    /// Full resource size from `Content-Range`, if present
    pub content_range_total: Option<u64>,
    pub body: ByteStream,
}

impl TransportResponse {
    /// 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `206 Partial Content`.
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_range_total", &self.content_range_total)
            .finish_non_exhaustive()
    }
}

/// Source of download bytes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Discover the total size of `url` without fetching the body.
    ///
    /// Non-success statuses come back as [`TransportError::Http`].
    async fn head(&self, url: &str) -> Result<ProbeInfo, TransportError>;

    /// Fetch `url`, sending `Range: bytes=<offset>-` when `offset` is given.
    ///
    /// Any status is returned as a response; only failures to get one at all
    /// are errors.
    async fn get(&self, url: &str, offset: Option<u64>) -> Result<TransportResponse, TransportError>;
}

/// Total size from a `Content-Range` value.
///
/// Accepts `bytes 0-99/1000` and `bytes */1000`; an unknown total (`*`) gives
/// `None`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = spec.split_once('/')?;
    total.trim().parse().ok()
}

/// Value of the `Range` header for a request starting at `offset`.
pub fn range_header(offset: u64) -> String {
    format!("bytes={}-", offset)
}
