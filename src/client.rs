//! Blocking client.

use std::sync::Arc;

use log::{debug, info};
use reqwest::header::HeaderValue;
use serde::de::DeserializeOwned;

use crate::api::{self, JobOutcome, Link};
use crate::error::Result;
use crate::http::{Executor, Payload, Request, RetryPolicy, RetryState, Sink};
use crate::operation::{self, OperationHandle, OperationStatus, WaitOptions};
use crate::settings::{RequestOptions, Settings};
use crate::transport::{Backend, Transport};

/// Blocking API client.
///
/// Clones share the session, so one client can serve many threads.
#[derive(Clone)]
pub struct Client {
    executor: Executor,
    settings: Arc<Settings>,
    token: Option<HeaderValue>,
}

impl Client {
    /// Client over the default backend.
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_backend(Backend::default(), settings)
    }

    pub fn with_backend(backend: Backend, settings: Settings) -> Result<Self> {
        let transport = backend.blocking(&settings)?;
        Ok(Self::with_transport(transport, settings))
    }

    pub fn with_transport(transport: Arc<dyn Transport>, settings: Settings) -> Self {
        Self {
            executor: Executor::new(transport),
            settings: Arc::new(settings),
            token: None,
        }
    }

    /// Sends `Authorization: OAuth <token>` with API calls.
    pub fn with_token(mut self, token: &str) -> Result<Self> {
        self.token = Some(api::oauth_header(token)?);
        Ok(self)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Closes the session. Calls made afterwards fail with
    /// [`Error::SessionClosed`](crate::Error::SessionClosed).
    pub fn close(&self) {
        self.executor.transport().close();
    }

    /// Runs an arbitrary API request and decodes the JSON reply.
    pub fn execute<T: DeserializeOwned>(&self, request: Request, options: &RequestOptions) -> Result<T> {
        let request = self.authorized(request, options);
        self.executor.execute(&request, &options.policy(&self.settings))
    }

    /// Runs a request that may start a server-side operation, waiting for it
    /// when `wait.wait` is set.
    #[tracing::instrument(skip_all, fields(url = %request.url))]
    pub fn execute_job(
        &self,
        request: Request,
        options: &RequestOptions,
        wait: &WaitOptions,
    ) -> Result<JobOutcome> {
        let request = self.authorized(request, options);
        let outcome = self.executor.execute_with(
            &request,
            &options.policy(&self.settings),
            api::parse_job,
        )?;

        match outcome {
            JobOutcome::Started(handle) if wait.wait => {
                debug!("Waiting for operation {}", handle.id());
                self.wait_for_operation(&handle, wait, options)?;
                Ok(JobOutcome::Completed)
            }
            outcome => Ok(outcome),
        }
    }

    #[tracing::instrument(skip(self, options))]
    pub fn get_operation_status(
        &self,
        handle: &OperationHandle,
        options: &RequestOptions,
    ) -> Result<OperationStatus> {
        let request = self.authorized(api::operation_status(handle), options);
        self.executor
            .execute_with(&request, &options.policy(&self.settings), api::parse_status)
    }

    /// Polls the operation until it finishes. A `failed` operation is
    /// [`Error::OperationFailed`](crate::Error::OperationFailed); running
    /// past `poll_timeout` is [`Error::PollTimeout`](crate::Error::PollTimeout).
    #[tracing::instrument(skip(self, options))]
    pub fn wait_for_operation(
        &self,
        handle: &OperationHandle,
        wait: &WaitOptions,
        options: &RequestOptions,
    ) -> Result<OperationStatus> {
        operation::wait_blocking(wait, || self.get_operation_status(handle, options))
    }

    pub fn get_upload_link(&self, path: &str, overwrite: bool, options: &RequestOptions) -> Result<Link> {
        self.upload_link(path, overwrite, options, &options.policy(&self.settings))
    }

    pub fn get_download_link(&self, path: &str, options: &RequestOptions) -> Result<Link> {
        self.download_link(path, options, &options.policy(&self.settings))
    }

    /// Uploads `payload` to a pre-signed upload link.
    #[tracing::instrument(skip(self, payload, options))]
    pub fn upload_by_link(
        &self,
        href: &str,
        payload: impl Into<Payload>,
        options: &RequestOptions,
    ) -> Result<()> {
        let policy = options.upload_policy(&self.settings);
        self.put_content(href, payload.into(), options, &policy)
    }

    /// Downloads a pre-signed download link into `sink`.
    #[tracing::instrument(skip(self, sink, options))]
    pub fn download_by_link<S>(&self, href: &str, sink: &mut S, options: &RequestOptions) -> Result<u64>
    where
        S: Sink + ?Sized,
    {
        let request = self.plain(api::download_from(href), options);
        self.executor
            .download(&request, &options.policy(&self.settings), sink)
    }

    /// Uploads `payload` to `path`. The link request and the transfer are
    /// retried together; a payload that cannot be rewound is sent once.
    #[tracing::instrument(skip(self, payload, options))]
    pub fn upload(
        &self,
        payload: impl Into<Payload>,
        path: &str,
        overwrite: bool,
        options: &RequestOptions,
    ) -> Result<()> {
        let payload = payload.into();
        let (outer, link_policy) =
            api::transfer_policies(options.upload_policy(&self.settings), payload.is_rewindable());
        let mut state = RetryState::new(&outer, true);

        loop {
            let result = self
                .upload_link(path, overwrite, options, &link_policy)
                .and_then(|link| {
                    self.put_content(&link.href, payload.clone(), options, &RetryPolicy::none())
                });

            match result {
                Ok(()) => {
                    info!("Uploaded {}", path);
                    return Ok(());
                }
                Err(e) => state.recover(e, || payload.rewind())?,
            }
        }
    }

    /// Downloads `path` into `sink`, retrying link request and transfer
    /// together when the sink can be rewound.
    #[tracing::instrument(skip(self, sink, options))]
    pub fn download<S>(&self, path: &str, sink: &mut S, options: &RequestOptions) -> Result<u64>
    where
        S: Sink + ?Sized,
    {
        let (outer, link_policy) =
            api::transfer_policies(options.policy(&self.settings), sink.is_rewindable());
        let mut state = RetryState::new(&outer, true);

        loop {
            let result = self.download_link(path, options, &link_policy).and_then(|link| {
                let request = self.plain(api::download_from(&link.href), options);
                self.executor.download(&request, &RetryPolicy::none(), &mut *sink)
            });

            match result {
                Ok(written) => {
                    info!("Downloaded {} ({} bytes)", path, written);
                    return Ok(written);
                }
                Err(e) => state.recover(e, || sink.rewind())?,
            }
        }
    }

    /// Copies `from` to `to`.
    pub fn copy(
        &self,
        from: &str,
        to: &str,
        overwrite: bool,
        options: &RequestOptions,
        wait: &WaitOptions,
    ) -> Result<JobOutcome> {
        self.execute_job(api::copy(&self.settings, from, to, overwrite), options, wait)
    }

    /// Moves `from` to `to`.
    pub fn move_(
        &self,
        from: &str,
        to: &str,
        overwrite: bool,
        options: &RequestOptions,
        wait: &WaitOptions,
    ) -> Result<JobOutcome> {
        self.execute_job(api::move_(&self.settings, from, to, overwrite), options, wait)
    }

    /// Removes `path`, to the trash unless `permanently`.
    pub fn remove(
        &self,
        path: &str,
        permanently: bool,
        options: &RequestOptions,
        wait: &WaitOptions,
    ) -> Result<JobOutcome> {
        self.execute_job(api::remove(&self.settings, path, permanently), options, wait)
    }

    pub fn restore_trash(
        &self,
        path: &str,
        overwrite: bool,
        options: &RequestOptions,
        wait: &WaitOptions,
    ) -> Result<JobOutcome> {
        self.execute_job(api::restore_trash(&self.settings, path, overwrite), options, wait)
    }

    /// Removes `path` from the trash; `None` empties the trash.
    pub fn remove_trash(
        &self,
        path: Option<&str>,
        options: &RequestOptions,
        wait: &WaitOptions,
    ) -> Result<JobOutcome> {
        self.execute_job(api::remove_trash(&self.settings, path), options, wait)
    }

    fn authorized(&self, request: Request, options: &RequestOptions) -> Request {
        api::prepare(request, options, self.token.as_ref())
    }

    // Pre-signed links carry their own credentials.
    fn plain(&self, request: Request, options: &RequestOptions) -> Request {
        api::prepare(request, options, None)
    }

    fn upload_link(
        &self,
        path: &str,
        overwrite: bool,
        options: &RequestOptions,
        policy: &RetryPolicy,
    ) -> Result<Link> {
        let request = self.authorized(api::upload_link(&self.settings, path, overwrite), options);
        self.executor.execute_with(&request, policy, api::parse_link)
    }

    fn download_link(&self, path: &str, options: &RequestOptions, policy: &RetryPolicy) -> Result<Link> {
        let request = self.authorized(api::download_link(&self.settings, path), options);
        self.executor.execute_with(&request, policy, api::parse_link)
    }

    fn put_content(
        &self,
        href: &str,
        payload: Payload,
        options: &RequestOptions,
        policy: &RetryPolicy,
    ) -> Result<()> {
        let request = self
            .plain(api::upload_to(href, payload), options)
            .timeout(options.upload_timeout(&self.settings));
        self.executor.execute_with(&request, policy, |_| Ok(()))
    }
}
