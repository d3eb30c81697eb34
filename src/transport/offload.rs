use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use tokio::task;

use super::{AsyncResponse, AsyncTransport, BufferedResponse, Response, Transport};
use crate::error::{Error, ErrorKind, Result};
use crate::http::Request;

/// Runs a blocking session on tokio's blocking pool, giving it the
/// cooperative interface.
///
/// Responses to buffered requests are read completely on the pool thread;
/// streamed responses hop back to the pool for every chunk.
pub struct Offload<T> {
    inner: Arc<T>,
}

impl<T: Transport + 'static> Offload<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn from_arc(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<T: Transport + 'static> AsyncTransport for Offload<T> {
    async fn send(&self, request: &Request) -> Result<Box<dyn AsyncResponse>> {
        let inner = Arc::clone(&self.inner);
        let request = request.clone();

        let response = task::spawn_blocking(move || -> Result<Box<dyn AsyncResponse>> {
            let mut response = inner.send(&request)?;
            if request.stream {
                return Ok(Box::new(OffloadResponse::new(response)));
            }

            let status = response.status();
            let headers = response.headers().clone();
            let body = response.read_body()?;
            Ok(Box::new(BufferedResponse::new(status, headers, body)))
        })
        .await
        .map_err(join_error)??;

        Ok(response)
    }

    fn close(&self) {
        self.inner.close();
    }
}

struct OffloadResponse {
    status: u16,
    headers: HeaderMap,
    // Taken while a read runs on the blocking pool.
    inner: Option<Box<dyn Response>>,
}

impl OffloadResponse {
    fn new(inner: Box<dyn Response>) -> Self {
        Self {
            status: inner.status(),
            headers: inner.headers().clone(),
            inner: Some(inner),
        }
    }
}

#[async_trait]
impl AsyncResponse for OffloadResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let Some(mut inner) = self.inner.take() else {
            return Err(Error::transport(
                ErrorKind::Request,
                "Response body is no longer available",
                "a previous read was interrupted",
            ));
        };

        let (inner, chunk) = task::spawn_blocking(move || {
            let chunk = inner.read_chunk();
            (inner, chunk)
        })
        .await
        .map_err(join_error)?;

        self.inner = Some(inner);
        chunk
    }
}

fn join_error(error: task::JoinError) -> Error {
    Error::transport(ErrorKind::Request, "Blocking transport task failed", error)
}
