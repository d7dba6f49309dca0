// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory transport for tests and offline demos.
//!
//! Serves registered byte buffers the way a range-capable HTTP server would,
//! with knobs for the misbehaviour a real network produces: slow frames,
//! dropped connections, short bodies, servers that ignore `Range`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};

use super::{ByteStream, ProbeInfo, Transport, TransportError, TransportResponse};
use crate::locks::resilient_lock;

/// One canned resource.
#[derive(Debug, Clone)]
pub struct MemoryResource {
    data: Bytes,
    frame_size: usize,
    frame_delay: Duration,
    ranges: bool,
    send_length: bool,
    advertised_length: Option<u64>,
    head_status: u16,
    get_status: u16,
    unreachable: bool,
    fail_at: Option<u64>,
    truncate_at: Option<u64>,
    stall_at: Option<u64>,
}

impl MemoryResource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            frame_size: 16 * 1024,
            frame_delay: Duration::ZERO,
            ranges: true,
            send_length: true,
            advertised_length: None,
            head_status: 200,
            get_status: 200,
            unreachable: false,
            fail_at: None,
            truncate_at: None,
            stall_at: None,
        }
    }

    /// Resource of `len` bytes following a repeating pattern.
    pub fn patterned(len: usize) -> Self {
        Self::new((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    /// Bytes served by this resource.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Size of each body frame.
    pub fn frame_size(mut self, size: usize) -> Self {
        self.frame_size = size.max(1);
        self
    }

    /// Sleep before every body frame.
    pub fn frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    /// Ignore `Range` and always answer `200` with the full body.
    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    /// Omit the length on both HEAD and GET.
    pub fn without_length(mut self) -> Self {
        self.send_length = false;
        self
    }

    /// Announce a total different from the real body length.
    pub fn advertised_length(mut self, len: u64) -> Self {
        self.advertised_length = Some(len);
        self
    }

    /// Status returned by HEAD.
    pub fn head_status(mut self, status: u16) -> Self {
        self.head_status = status;
        self
    }

    /// Status returned by GET, with an empty body when not 200.
    pub fn get_status(mut self, status: u16) -> Self {
        self.get_status = status;
        self
    }

    /// Every request fails before a response arrives.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Drop the connection once the body reaches absolute byte `pos`.
    pub fn fail_at(mut self, pos: u64) -> Self {
        self.fail_at = Some(pos);
        self
    }

    /// End the body cleanly at absolute byte `pos`, still announcing the full length.
    pub fn truncate_at(mut self, pos: u64) -> Self {
        self.truncate_at = Some(pos);
        self
    }

    /// Stop producing frames at absolute byte `pos` without closing the stream.
    pub fn stall_at(mut self, pos: u64) -> Self {
        self.stall_at = Some(pos);
        self
    }

    fn announced_total(&self) -> Option<u64> {
        if !self.send_length {
            return None;
        }
        Some(self.advertised_length.unwrap_or(self.data.len() as u64))
    }

    fn body_from(&self, start: u64) -> ByteStream {
        let len = self.data.len() as u64;
        let mut end = len;
        if let Some(pos) = self.truncate_at {
            end = end.min(pos.max(start));
        }

        let fail_at = self.fail_at.filter(|pos| *pos > start && *pos < end);
        let stall_at = self.stall_at.filter(|pos| *pos >= start && *pos < end);
        let stop = [fail_at, stall_at].into_iter().flatten().min().unwrap_or(end);

        let data = self.data.clone();
        let frame_size = self.frame_size as u64;
        let frame_delay = self.frame_delay;

        let frames = stream::unfold(start, move |pos| {
            let data = data.clone();
            async move {
                if pos >= stop {
                    return None;
                }
                if !frame_delay.is_zero() {
                    tokio::time::sleep(frame_delay).await;
                }
                let next = (pos + frame_size).min(stop);
                Some((Ok::<_, TransportError>(data.slice(pos as usize..next as usize)), next))
            }
        });

        let tail: ByteStream = if stall_at == Some(stop) {
            stream::pending().boxed()
        } else if fail_at == Some(stop) {
            stream::once(async { Err(TransportError::Network("connection reset by peer".into())) })
                .boxed()
        } else {
            stream::empty().boxed()
        };

        frames.chain(tail).boxed()
    }
}

/// A request seen by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub url: String,
    pub offset: Option<u64>,
}

/// Transport serving [`MemoryResource`]s by URL.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    resources: Mutex<HashMap<String, MemoryResource>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the resource served at `url`.
    pub fn insert(&self, url: impl Into<String>, resource: MemoryResource) {
        resilient_lock(&self.resources).insert(url.into(), resource);
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        resilient_lock(&self.requests).clone()
    }

    /// GET requests received for `url`.
    pub fn gets(&self, url: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == "GET" && r.url == url)
            .collect()
    }

    fn record(&self, method: &'static str, url: &str, offset: Option<u64>) -> Option<MemoryResource> {
        resilient_lock(&self.requests).push(RecordedRequest {
            method,
            url: url.to_string(),
            offset,
        });
        resilient_lock(&self.resources).get(url).cloned()
    }
}

fn empty_response(status: u16, content_range_total: Option<u64>) -> TransportResponse {
    TransportResponse {
        status,
        content_length: Some(0),
        content_range_total,
        body: stream::empty().boxed(),
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn head(&self, url: &str) -> Result<ProbeInfo, TransportError> {
        let resource = self.record("HEAD", url, None).ok_or(TransportError::Http(404))?;
        if resource.unreachable {
            return Err(TransportError::Network("connection refused".into()));
        }
        if !(200..300).contains(&resource.head_status) {
            return Err(TransportError::Http(resource.head_status));
        }
        Ok(ProbeInfo {
            content_length: resource.announced_total(),
        })
    }

    async fn get(&self, url: &str, offset: Option<u64>) -> Result<TransportResponse, TransportError> {
        let Some(resource) = self.record("GET", url, offset) else {
            return Ok(empty_response(404, None));
        };
        if resource.unreachable {
            return Err(TransportError::Network("connection refused".into()));
        }
        if resource.get_status != 200 {
            return Ok(empty_response(resource.get_status, None));
        }

        let len = resource.data.len() as u64;
        match offset {
            Some(start) if resource.ranges => {
                if start >= len {
                    return Ok(empty_response(416, Some(len)));
                }
                Ok(TransportResponse {
                    status: 206,
                    content_length: resource.announced_total().map(|total| total.saturating_sub(start)),
                    content_range_total: Some(resource.advertised_length.unwrap_or(len)),
                    body: resource.body_from(start),
                })
            }
            _ => Ok(TransportResponse {
                status: 200,
                content_length: resource.announced_total(),
                content_range_total: None,
                body: resource.body_from(0),
            }),
        }
    }
}
