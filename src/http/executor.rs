//! Request executors.
//!
//! Both executors run the same algorithm, driven by [`RetryState`]: send,
//! validate, and on failure either rewind the payload and the sink, wait and
//! go again, or give up. Every response handle is dropped before
//! the next attempt starts.

use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;

use super::classify::protocol_error;
use super::request::Request;
use super::retry::{RetryPolicy, RetryState};
use super::sink::{AsyncSink, Sink};
use crate::error::{Error, Result};
use crate::transport::{AsyncTransport, Transport};

/// A successful response, fully read.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    /// Decodes the body as JSON. An empty body decodes as `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let body: &[u8] = if self.body.is_empty() {
            b"null"
        } else {
            &self.body
        };

        serde_json::from_slice(body).map_err(|e| {
            Error::InvalidResponse(format!("failed to decode JSON (status {}): {}", self.status, e))
        })
    }
}

/// Blocking executor.
#[derive(Clone)]
pub struct Executor {
    transport: Arc<dyn Transport>,
}

impl Executor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Runs `request` and decodes the JSON reply.
    pub fn execute<T: DeserializeOwned>(&self, request: &Request, policy: &RetryPolicy) -> Result<T> {
        self.execute_with(request, policy, |reply| reply.json())
    }

    /// Runs `request` and validates the reply with `parse`. Parse failures
    /// count as failed attempts.
    #[tracing::instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub fn execute_with<T, F>(&self, request: &Request, policy: &RetryPolicy, parse: F) -> Result<T>
    where
        F: Fn(Reply) -> Result<T>,
    {
        let mut state = RetryState::new(policy, request.payload.is_rewindable());

        loop {
            match self.attempt(request).and_then(&parse) {
                Ok(value) => return Ok(value),
                Err(e) => state.recover(e, || request.payload.rewind())?,
            }
        }
    }

    /// Streams the reply body into `sink`, returning the byte count of the
    /// successful attempt.
    #[tracing::instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub fn download<S>(&self, request: &Request, policy: &RetryPolicy, sink: &mut S) -> Result<u64>
    where
        S: Sink + ?Sized,
    {
        let rewindable = request.payload.is_rewindable() && sink.is_rewindable();
        let mut state = RetryState::new(policy, rewindable);

        loop {
            match self.download_once(request, sink) {
                Ok(written) => return Ok(written),
                Err(e) => state.recover(e, || {
                    request.payload.rewind()?;
                    sink.rewind()
                })?,
            }
        }
    }

    fn attempt(&self, request: &Request) -> Result<Reply> {
        let mut response = self.transport.send(request)?;
        let status = response.status();
        let body = response.read_body()?;

        if !request.is_success(status) {
            return Err(protocol_error(status, &body));
        }

        Ok(Reply {
            status,
            headers: response.headers().clone(),
            body,
        })
    }

    fn download_once<S>(&self, request: &Request, sink: &mut S) -> Result<u64>
    where
        S: Sink + ?Sized,
    {
        let mut response = self.transport.send(request)?;
        let status = response.status();

        if !request.is_success(status) {
            let body = response.read_body().unwrap_or_default();
            return Err(protocol_error(status, &body));
        }

        let mut written = 0u64;
        while let Some(chunk) = response.read_chunk()? {
            sink.write_chunk(&chunk)?;
            written += chunk.len() as u64;
        }
        sink.flush()?;

        debug!("Downloaded {} bytes", written);
        Ok(written)
    }
}

/// Cooperative executor.
#[derive(Clone)]
pub struct AsyncExecutor {
    transport: Arc<dyn AsyncTransport>,
}

impl AsyncExecutor {
    pub fn new(transport: Arc<dyn AsyncTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn AsyncTransport> {
        &self.transport
    }

    /// Runs `request` and decodes the JSON reply.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        request: &Request,
        policy: &RetryPolicy,
    ) -> Result<T> {
        self.execute_with(request, policy, |reply| reply.json()).await
    }

    /// Runs `request` and validates the reply with `parse`. Parse failures
    /// count as failed attempts.
    #[tracing::instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub async fn execute_with<T, F>(
        &self,
        request: &Request,
        policy: &RetryPolicy,
        parse: F,
    ) -> Result<T>
    where
        F: Fn(Reply) -> Result<T>,
    {
        let mut state = RetryState::new(policy, request.payload.is_rewindable());

        loop {
            match self.attempt(request).await.and_then(&parse) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let rewind = async { request.payload.rewind() };
                    state.recover_async(e, rewind).await?;
                }
            }
        }
    }

    /// Streams the reply body into `sink`, returning the byte count of the
    /// successful attempt.
    #[tracing::instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub async fn download<S>(
        &self,
        request: &Request,
        policy: &RetryPolicy,
        sink: &mut S,
    ) -> Result<u64>
    where
        S: AsyncSink + ?Sized,
    {
        let rewindable = request.payload.is_rewindable() && sink.is_rewindable();
        let mut state = RetryState::new(policy, rewindable);

        loop {
            match self.download_once(request, sink).await {
                Ok(written) => return Ok(written),
                Err(e) => {
                    let rewind = async {
                        request.payload.rewind()?;
                        sink.rewind().await
                    };
                    state.recover_async(e, rewind).await?;
                }
            }
        }
    }

    async fn attempt(&self, request: &Request) -> Result<Reply> {
        let mut response = self.transport.send(request).await?;
        let status = response.status();
        let body = response.read_body().await?;

        if !request.is_success(status) {
            return Err(protocol_error(status, &body));
        }

        Ok(Reply {
            status,
            headers: response.headers().clone(),
            body,
        })
    }

    async fn download_once<S>(&self, request: &Request, sink: &mut S) -> Result<u64>
    where
        S: AsyncSink + ?Sized,
    {
        let mut response = self.transport.send(request).await?;
        let status = response.status();

        if !request.is_success(status) {
            let body = response.read_body().await.unwrap_or_default();
            return Err(protocol_error(status, &body));
        }

        let mut written = 0u64;
        while let Some(chunk) = response.read_chunk().await? {
            sink.write_chunk(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;

        debug!("Downloaded {} bytes", written);
        Ok(written)
    }
}
