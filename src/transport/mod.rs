//! Transport sessions.
//!
//! A session sends one HTTP request and hands back the response, nothing
//! more: retries, classification and polling live above it. Error statuses
//! come back as ordinary responses so the executor can classify them the same
//! way for every backend.
//!
//! # Backends
//!
//! - `reqwest` - native async ([`AsyncReqwestSession`]); its blocking form
//!   ([`ReqwestSession`]) drives the async session on a private runtime
//! - `ureq` - blocking only ([`UreqSession`]); its cooperative form runs it
//!   on tokio's blocking pool through [`Offload`]

mod offload;
mod reqwest_async;
mod reqwest_blocking;
mod ureq_session;

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::io::{self, Read};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::http::{CHUNK_SIZE, Request, Timeout, classify};
use crate::settings::Settings;

pub use offload::Offload;
pub use reqwest_async::AsyncReqwestSession;
pub use reqwest_blocking::ReqwestSession;
pub use ureq_session::UreqSession;

/// Response handle for one attempt. Dropping it releases the connection.
pub trait Response: Send {
    fn status(&self) -> u16;

    fn headers(&self) -> &HeaderMap;

    /// Next piece of the body, `None` once it is exhausted.
    fn read_chunk(&mut self) -> Result<Option<Bytes>>;

    fn read_body(&mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.read_chunk()? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

/// Cooperative response handle.
#[async_trait]
pub trait AsyncResponse: Send {
    fn status(&self) -> u16;

    fn headers(&self) -> &HeaderMap;

    async fn read_chunk(&mut self) -> Result<Option<Bytes>>;

    async fn read_body(&mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.read_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

/// Blocking session.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    fn send(&self, request: &Request) -> Result<Box<dyn Response>>;

    /// Releases pooled connections. Later sends fail with
    /// [`Error::SessionClosed`].
    fn close(&self);
}

/// Cooperative session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AsyncTransport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<Box<dyn AsyncResponse>>;

    fn close(&self);
}

/// Backend identifier, for picking a session by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Reqwest,
    Ureq,
}

impl Backend {
    /// Opens a blocking session.
    ///
    /// The reqwest blocking client runs its own runtime and must not be
    /// created from within an async context.
    pub fn blocking(self, settings: &Settings) -> Result<Arc<dyn Transport>> {
        Ok(match self {
            Backend::Reqwest => Arc::new(ReqwestSession::new(settings)?),
            Backend::Ureq => Arc::new(UreqSession::new(settings)),
        })
    }

    /// Opens a cooperative session.
    pub fn cooperative(self, settings: &Settings) -> Result<Arc<dyn AsyncTransport>> {
        Ok(match self {
            Backend::Reqwest => Arc::new(AsyncReqwestSession::new(settings)?),
            Backend::Ureq => Arc::new(Offload::new(UreqSession::new(settings))),
        })
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Reqwest => write!(f, "reqwest"),
            Backend::Ureq => write!(f, "ureq"),
        }
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "reqwest" => Ok(Backend::Reqwest),
            "ureq" => Ok(Backend::Ureq),
            _ => Err(Error::InvalidRequest(format!(
                "Unknown backend: {}. Expected reqwest or ureq.",
                s
            ))),
        }
    }
}

/// Backend client handle that can be closed.
///
/// The lock is held only long enough to clone the handle; backend clients are
/// reference-counted pools, so the clone shares every connection. Requests
/// with their own timeouts get a variant client, built once per key.
pub(crate) struct Pool<C, K = Timeout> {
    client: RwLock<Option<C>>,
    variants: Mutex<HashMap<K, C>>,
}

impl<C: Clone, K: Eq + Hash> Pool<C, K> {
    pub(crate) fn new(client: C) -> Self {
        Self {
            client: RwLock::new(Some(client)),
            variants: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self) -> Result<C> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::SessionClosed)
    }

    /// The variant for `key`, built with `build` on first use.
    pub(crate) fn get_or_build<F>(&self, key: K, build: F) -> Result<C>
    where
        F: FnOnce(&K) -> Result<C>,
    {
        self.get()?;

        let mut variants = self.variants.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = variants.get(&key) {
            return Ok(client.clone());
        }

        let client = build(&key)?;
        variants.insert(key, client.clone());
        Ok(client)
    }

    /// Drops the pool and its variants. Returns false if it was already closed.
    pub(crate) fn close(&self) -> bool {
        let was_open = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        self.variants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        was_open
    }
}

/// Reads the next chunk of a blocking body.
pub(crate) fn read_chunk_from<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Bytes>> {
    let mut buf = vec![0; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(n) => {
                buf.truncate(n);
                return Ok(Some(Bytes::from(buf)));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(classify::from_body_io(e)),
        }
    }
}

/// Response whose body is already in memory.
pub(crate) struct BufferedResponse {
    status: u16,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl BufferedResponse {
    pub(crate) fn new(status: u16, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body: Some(body).filter(|b| !b.is_empty()),
        }
    }
}

impl Response for BufferedResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.body.take())
    }
}

#[async_trait]
impl AsyncResponse for BufferedResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.body.take())
    }
}
