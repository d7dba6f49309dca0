// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP transport over `reqwest`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::Client;

use super::{
    parse_content_range_total, range_header, ProbeInfo, Transport, TransportError,
    TransportResponse,
};

/// Connect timeout for every request
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Transport backed by one shared `reqwest::Client`.
///
/// HEAD probes carry a whole-request timeout. GETs have no overall deadline
/// (a large file may take hours); instead the response headers and every
/// body frame must arrive within the read timeout.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    head_timeout: Duration,
    read_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(head_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("offline-vault/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            head_timeout,
            read_timeout,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn head(&self, url: &str) -> Result<ProbeInfo, TransportError> {
        let response = self
            .client
            .head(url)
            .timeout(self.head_timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(status.as_u16()));
        }

        Ok(ProbeInfo {
            content_length: header_u64(response.headers(), CONTENT_LENGTH.as_str()),
        })
    }

    async fn get(&self, url: &str, offset: Option<u64>) -> Result<TransportResponse, TransportError> {
        let mut request = self.client.get(url);
        if let Some(offset) = offset {
            request = request.header(RANGE, range_header(offset));
        }

        let response = tokio::time::timeout(self.read_timeout, request.send())
            .await
            .map_err(|_| {
                TransportError::Network(format!("no response within {:?}", self.read_timeout))
            })?
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response.headers();
        let content_length = header_u64(headers, CONTENT_LENGTH.as_str());
        let content_range_total = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);

        let read_timeout = self.read_timeout;
        let body = stream::unfold(response.bytes_stream().boxed(), move |mut inner| async move {
            match tokio::time::timeout(read_timeout, inner.next()).await {
                Ok(Some(Ok(frame))) => Some((Ok(frame), inner)),
                Ok(Some(Err(e))) => Some((Err(map_reqwest_error(e)), inner)),
                Ok(None) => None,
                Err(_) => Some((
                    Err(TransportError::Network(format!(
                        "no data received for {:?}",
                        read_timeout
                    ))),
                    inner,
                )),
            }
        })
        .boxed();

        Ok(TransportResponse {
            status,
            content_length,
            content_range_total,
            body,
        })
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
        TransportError::Network(e.to_string())
    } else if let Some(status) = e.status() {
        TransportError::Http(status.as_u16())
    } else {
        TransportError::Other(e.to_string())
    }
}
