//! Cooperative client, the async twin of [`Client`](crate::Client).

use std::sync::Arc;

use log::{debug, info};
use reqwest::header::HeaderValue;
use serde::de::DeserializeOwned;

use crate::api::{self, JobOutcome, Link};
use crate::error::Result;
use crate::http::{AsyncExecutor, AsyncSink, Payload, Request, RetryPolicy, RetryState};
use crate::operation::{self, OperationHandle, OperationStatus, WaitOptions};
use crate::settings::{RequestOptions, Settings};
use crate::transport::{AsyncTransport, Backend};

/// Cooperative API client. Clones share the session.
#[derive(Clone)]
pub struct AsyncClient {
    executor: AsyncExecutor,
    settings: Arc<Settings>,
    token: Option<HeaderValue>,
}

impl AsyncClient {
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_backend(Backend::default(), settings)
    }

    pub fn with_backend(backend: Backend, settings: Settings) -> Result<Self> {
        let transport = backend.cooperative(&settings)?;
        Ok(Self::with_transport(transport, settings))
    }

    pub fn with_transport(transport: Arc<dyn AsyncTransport>, settings: Settings) -> Self {
        Self {
            executor: AsyncExecutor::new(transport),
            settings: Arc::new(settings),
            token: None,
        }
    }

    pub fn with_token(mut self, token: &str) -> Result<Self> {
        self.token = Some(api::oauth_header(token)?);
        Ok(self)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn executor(&self) -> &AsyncExecutor {
        &self.executor
    }

    pub fn close(&self) {
        self.executor.transport().close();
    }

    pub async fn execute<T: DeserializeOwned>(
        &self,
        request: Request,
        options: &RequestOptions,
    ) -> Result<T> {
        let request = self.authorized(request, options);
        self.executor
            .execute(&request, &options.policy(&self.settings))
            .await
    }

    #[tracing::instrument(skip_all, fields(url = %request.url))]
    pub async fn execute_job(
        &self,
        request: Request,
        options: &RequestOptions,
        wait: &WaitOptions,
    ) -> Result<JobOutcome> {
        let request = self.authorized(request, options);
        let outcome = self
            .executor
            .execute_with(&request, &options.policy(&self.settings), api::parse_job)
            .await?;

        match outcome {
            JobOutcome::Started(handle) if wait.wait => {
                debug!("Waiting for operation {}", handle.id());
                self.wait_for_operation(&handle, wait, options).await?;
                Ok(JobOutcome::Completed)
            }
            outcome => Ok(outcome),
        }
    }

    #[tracing::instrument(skip(self, options))]
    pub async fn get_operation_status(
        &self,
        handle: &OperationHandle,
        options: &RequestOptions,
    ) -> Result<OperationStatus> {
        let request = self.authorized(api::operation_status(handle), options);
        self.executor
            .execute_with(&request, &options.policy(&self.settings), api::parse_status)
            .await
    }

    #[tracing::instrument(skip(self, options))]
    pub async fn wait_for_operation(
        &self,
        handle: &OperationHandle,
        wait: &WaitOptions,
        options: &RequestOptions,
    ) -> Result<OperationStatus> {
        operation::wait_async(wait, move || self.get_operation_status(handle, options)).await
    }

    pub async fn get_upload_link(
        &self,
        path: &str,
        overwrite: bool,
        options: &RequestOptions,
    ) -> Result<Link> {
        self.upload_link(path, overwrite, options, &options.policy(&self.settings))
            .await
    }

    pub async fn get_download_link(&self, path: &str, options: &RequestOptions) -> Result<Link> {
        self.download_link(path, options, &options.policy(&self.settings))
            .await
    }

    #[tracing::instrument(skip(self, payload, options))]
    pub async fn upload_by_link(
        &self,
        href: &str,
        payload: impl Into<Payload>,
        options: &RequestOptions,
    ) -> Result<()> {
        let policy = options.upload_policy(&self.settings);
        self.put_content(href, payload.into(), options, &policy).await
    }

    #[tracing::instrument(skip(self, sink, options))]
    pub async fn download_by_link<S>(
        &self,
        href: &str,
        sink: &mut S,
        options: &RequestOptions,
    ) -> Result<u64>
    where
        S: AsyncSink + ?Sized,
    {
        let request = api::prepare(api::download_from(href), options, None);
        self.executor
            .download(&request, &options.policy(&self.settings), sink)
            .await
    }

    #[tracing::instrument(skip(self, payload, options))]
    pub async fn upload(
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
            let result = match self.upload_link(path, overwrite, options, &link_policy).await {
                Ok(link) => {
                    self.put_content(&link.href, payload.clone(), options, &RetryPolicy::none())
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    info!("Uploaded {}", path);
                    return Ok(());
                }
                Err(e) => {
                    let rewind = async { payload.rewind() };
                    state.recover_async(e, rewind).await?;
                }
            }
        }
    }

    #[tracing::instrument(skip(self, sink, options))]
    pub async fn download<S>(&self, path: &str, sink: &mut S, options: &RequestOptions) -> Result<u64>
    where
        S: AsyncSink + ?Sized,
    {
        let (outer, link_policy) =
            api::transfer_policies(options.policy(&self.settings), sink.is_rewindable());
        let mut state = RetryState::new(&outer, true);

        loop {
            let result = match self.download_link(path, options, &link_policy).await {
                Ok(link) => {
                    let request = api::prepare(api::download_from(&link.href), options, None);
                    self.executor
                        .download(&request, &RetryPolicy::none(), &mut *sink)
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(written) => {
                    info!("Downloaded {} ({} bytes)", path, written);
                    return Ok(written);
                }
                Err(e) => state.recover_async(e, sink.rewind()).await?,
            }
        }
    }

    pub async fn copy(
        &self,
        from: &str,
        to: &str,
        overwrite: bool,
        options: &RequestOptions,
        wait: &WaitOptions,
    ) -> Result<JobOutcome> {
        let request = api::copy(&self.settings, from, to, overwrite);
        self.execute_job(request, options, wait).await
    }

    pub async fn move_(
        &self,
        from: &str,
        to: &str,
        overwrite: bool,
        options: &RequestOptions,
        wait: &WaitOptions,
    ) -> Result<JobOutcome> {
        let request = api::move_(&self.settings, from, to, overwrite);
        self.execute_job(request, options, wait).await
    }

    pub async fn remove(
        &self,
        path: &str,
        permanently: bool,
        options: &RequestOptions,
        wait: &WaitOptions,
    ) -> Result<JobOutcome> {
        let request = api::remove(&self.settings, path, permanently);
        self.execute_job(request, options, wait).await
    }

    pub async fn restore_trash(
        &self,
        path: &str,
        overwrite: bool,
        options: &RequestOptions,
        wait: &WaitOptions,
    ) -> Result<JobOutcome> {
        let request = api::restore_trash(&self.settings, path, overwrite);
        self.execute_job(request, options, wait).await
    }

    pub async fn remove_trash(
        &self,
        path: Option<&str>,
        options: &RequestOptions,
        wait: &WaitOptions,
    ) -> Result<JobOutcome> {
        let request = api::remove_trash(&self.settings, path);
        self.execute_job(request, options, wait).await
    }

    fn authorized(&self, request: Request, options: &RequestOptions) -> Request {
        api::prepare(request, options, self.token.as_ref())
    }

    async fn upload_link(
        &self,
        path: &str,
        overwrite: bool,
        options: &RequestOptions,
        policy: &RetryPolicy,
    ) -> Result<Link> {
        let request = self.authorized(api::upload_link(&self.settings, path, overwrite), options);
        self.executor
            .execute_with(&request, policy, api::parse_link)
            .await
    }

    async fn download_link(
        &self,
        path: &str,
        options: &RequestOptions,
        policy: &RetryPolicy,
    ) -> Result<Link> {
        let request = self.authorized(api::download_link(&self.settings, path), options);
        self.executor
            .execute_with(&request, policy, api::parse_link)
            .await
    }

    async fn put_content(
        &self,
        href: &str,
        payload: Payload,
        options: &RequestOptions,
        policy: &RetryPolicy,
    ) -> Result<()> {
        let request = api::prepare(api::upload_to(href, payload), options, None)
            .timeout(options.upload_timeout(&self.settings));
        self.executor
            .execute_with(&request, policy, |_| Ok(()))
            .await
    }
}
