use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use tokio::runtime::{Builder, Runtime};

use super::{AsyncResponse, AsyncReqwestSession, AsyncTransport, Response, Transport};
use crate::error::{Error, ErrorKind, Result};
use crate::http::Request;
use crate::settings::Settings;

/// Blocking session over [`AsyncReqwestSession`], driven by a private
/// single-worker runtime so both share the same timeout behaviour.
///
/// Like `reqwest::blocking`, it must not be created, used or dropped from
/// within an async context.
pub struct ReqwestSession {
    inner: AsyncReqwestSession,
    runtime: Arc<Runtime>,
}

impl ReqwestSession {
    pub fn new(settings: &Settings) -> Result<Self> {
        Self::from_session(AsyncReqwestSession::new(settings)?)
    }

    pub fn from_session(inner: AsyncReqwestSession) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("yadisk-reqwest")
            .enable_all()
            .build()
            .map_err(|e| {
                Error::transport(ErrorKind::Request, "Failed to start the reqwest runtime", e)
            })?;

        Ok(Self {
            inner,
            runtime: Arc::new(runtime),
        })
    }
}

impl Transport for ReqwestSession {
    fn send(&self, request: &Request) -> Result<Box<dyn Response>> {
        let inner = self
            .runtime
            .block_on(AsyncTransport::send(&self.inner, request))?;

        Ok(Box::new(ReqwestResponse {
            inner,
            runtime: Arc::clone(&self.runtime),
        }))
    }

    fn close(&self) {
        AsyncTransport::close(&self.inner);
    }
}

struct ReqwestResponse {
    inner: Box<dyn AsyncResponse>,
    runtime: Arc<Runtime>,
}

impl Response for ReqwestResponse {
    fn status(&self) -> u16 {
        self.inner.status()
    }

    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        self.runtime.block_on(self.inner.read_chunk())
    }
}
