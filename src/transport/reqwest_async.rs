use std::future::Future;
use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use log::debug;
use reqwest::header::{CONTENT_LENGTH, HeaderMap};
use reqwest::{Body, Client};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{AsyncResponse, AsyncTransport, Pool, read_chunk_from};
use crate::error::Result;
use crate::http::{Payload, Request, classify};
use crate::settings::Settings;

/// Cooperative session over a `reqwest::Client`.
///
/// The read timeout is an idle timeout: it restarts whenever upload data is
/// handed to the connection or a response chunk arrives. reqwest's own
/// `timeout`/`read_timeout` run from the start of the request, so neither is
/// set on the client.
pub struct AsyncReqwestSession {
    pool: Pool<Client, Duration>,
    connect_timeout: Option<Duration>,
    read_timeout: Duration,
    user_agent: String,
}

impl AsyncReqwestSession {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = build_client(settings.timeout.connect, &settings.user_agent)?;

        Ok(Self {
            pool: Pool::new(client),
            connect_timeout: Some(settings.timeout.connect),
            read_timeout: settings.timeout.read,
            user_agent: settings.user_agent.clone(),
        })
    }

    /// Wraps an existing client and shares its pool. Waits longer than
    /// `read_timeout` without progress fail.
    pub fn from_client(client: Client, read_timeout: Duration) -> Self {
        Self {
            pool: Pool::new(client),
            connect_timeout: None,
            read_timeout,
            user_agent: Settings::default().user_agent,
        }
    }

    fn client(&self, request: &Request) -> Result<Client> {
        match request.timeout {
            Some(timeout) if Some(timeout.connect) != self.connect_timeout => self
                .pool
                .get_or_build(timeout.connect, |connect| {
                    build_client(*connect, &self.user_agent)
                }),
            _ => self.pool.get(),
        }
    }
}

fn build_client(connect_timeout: Duration, user_agent: &str) -> Result<Client> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(user_agent)
        .build()
        .map_err(classify::from_reqwest)
}

#[async_trait]
impl AsyncTransport for AsyncReqwestSession {
    #[tracing::instrument(skip_all, fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: &Request) -> Result<Box<dyn AsyncResponse>> {
        let client = self.client(request)?;
        let idle = request.timeout.map_or(self.read_timeout, |t| t.read);
        let progress = Progress::new();

        let mut builder = client
            .request(request.method.clone(), &request.url)
            .query(&request.query)
            .headers(request.headers.clone());

        builder = match &request.payload {
            Payload::Empty => builder,
            Payload::Bytes(bytes) => builder.body(bytes.clone()),
            Payload::Stream(payload) => {
                if let Some(len) = payload.len() {
                    builder = builder.header(CONTENT_LENGTH, len);
                }
                let body = body_stream(payload.open()?, progress.clone());
                builder.body(Body::wrap_stream(body))
            }
        };

        let send = async { builder.send().await.map_err(classify::from_reqwest) };
        let response = until_idle(send, &progress, idle).await?;
        debug!("{} {} -> {}", request.method, request.url, response.status());

        Ok(Box::new(AsyncReqwestResponse {
            inner: response,
            read_timeout: idle,
        }))
    }

    fn close(&self) {
        if self.pool.close() {
            debug!("Closed reqwest session");
        }
    }
}

struct AsyncReqwestResponse {
    inner: reqwest::Response,
    read_timeout: Duration,
}

#[async_trait]
impl AsyncResponse for AsyncReqwestResponse {
    fn status(&self) -> u16 {
        self.inner.status().as_u16()
    }

    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        match tokio::time::timeout(self.read_timeout, self.inner.chunk()).await {
            Ok(chunk) => chunk.map_err(classify::from_reqwest),
            Err(_) => Err(classify::idle_timeout(self.read_timeout)),
        }
    }
}

/// Last time a request moved data.
#[derive(Clone)]
struct Progress(Arc<Mutex<Instant>>);

impl Progress {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives `send` until the response head arrives, failing once the request
/// has made no progress for `idle`.
async fn until_idle<F, T>(send: F, progress: &Progress, idle: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::pin!(send);

    loop {
        tokio::select! {
            result = &mut send => return result,
            _ = tokio::time::sleep_until(progress.last() + idle) => {
                if progress.last() + idle <= Instant::now() {
                    return Err(classify::idle_timeout(idle));
                }
            }
        }
    }
}

/// Feeds a blocking reader into a request body. Reads happen on the blocking
/// pool; the channel holds at most a couple of chunks ahead of the socket.
fn body_stream(
    mut reader: Box<dyn Read + Send>,
    progress: Progress,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    let (tx, rx) = mpsc::channel(2);

    tokio::task::spawn_blocking(move || {
        loop {
            let item = match read_chunk_from(&mut reader) {
                Ok(Some(chunk)) => Ok(chunk),
                Ok(None) => break,
                Err(e) => Err(std::io::Error::other(e)),
            };
            let failed = item.is_err();
            // The receiver is gone once the request is abandoned.
            if tx.blocking_send(item).is_err() || failed {
                break;
            }
        }
    });

    stream::unfold((rx, progress), |(mut rx, progress)| async move {
        let item = rx.recv().await?;
        progress.touch();
        Some((item, (rx, progress)))
    })
}
