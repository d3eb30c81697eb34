//! The endpoints the execution layer needs, as request builders and reply
//! parsers shared by [`Client`](crate::Client) and
//! [`AsyncClient`](crate::AsyncClient).

use reqwest::Method;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::http::{Payload, Reply, Request, RetryPolicy};
use crate::operation::{OperationHandle, OperationStatus};
use crate::settings::{RequestOptions, Settings};

pub const RESOURCES_PATH: &str = "/v1/disk/resources";
pub const TRASH_PATH: &str = "/v1/disk/trash/resources";

/// Link object returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub templated: Option<bool>,
    /// Set on upload links: the operation tracking the upload.
    #[serde(default)]
    pub operation_id: Option<String>,
}

/// Result of a job-starting call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Finished, either synchronously or after waiting for the operation.
    Completed,
    /// Accepted and still running on the server.
    Started(OperationHandle),
}

impl JobOutcome {
    pub fn handle(&self) -> Option<&OperationHandle> {
        match self {
            JobOutcome::Started(handle) => Some(handle),
            JobOutcome::Completed => None,
        }
    }
}

pub(crate) fn oauth_header(token: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(&format!("OAuth {}", token))
        .map_err(|_| Error::InvalidRequest("token contains invalid characters".to_string()))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Applies per-call options, and the token when given. A caller-supplied
/// `Authorization` header wins over the token.
pub(crate) fn prepare(
    request: Request,
    options: &RequestOptions,
    token: Option<&HeaderValue>,
) -> Request {
    let mut request = request.headers(&options.headers);

    if let Some(token) = token {
        request
            .headers
            .entry(AUTHORIZATION)
            .or_insert_with(|| token.clone());
    }

    if options.timeout.is_some() {
        request = request.timeout(options.timeout);
    }

    request
}

/// Splits a transfer's policy between the outer "get link + transfer" loop and
/// the link request. A rewindable transfer is retried as a whole; otherwise
/// only the link request is.
pub(crate) fn transfer_policies(policy: RetryPolicy, rewindable: bool) -> (RetryPolicy, RetryPolicy) {
    let single = RetryPolicy {
        n_retries: 0,
        ..policy.clone()
    };

    if rewindable {
        (policy, single)
    } else {
        (single, policy)
    }
}

pub(crate) fn operation_status(handle: &OperationHandle) -> Request {
    Request::get(handle.status_url())
}

pub(crate) fn upload_link(settings: &Settings, path: &str, overwrite: bool) -> Request {
    Request::get(settings.api_url(&format!("{}/upload", RESOURCES_PATH)))
        .query("path", path)
        .query("overwrite", overwrite)
}

pub(crate) fn download_link(settings: &Settings, path: &str) -> Request {
    Request::get(settings.api_url(&format!("{}/download", RESOURCES_PATH))).query("path", path)
}

pub(crate) fn upload_to(href: &str, payload: Payload) -> Request {
    Request::new(Method::PUT, href)
        .payload(payload)
        .success_codes(&[201])
}

pub(crate) fn download_from(href: &str) -> Request {
    Request::get(href).stream(true).success_codes(&[200])
}

pub(crate) fn copy(settings: &Settings, from: &str, to: &str, overwrite: bool) -> Request {
    Request::new(Method::POST, settings.api_url(&format!("{}/copy", RESOURCES_PATH)))
        .query("from", from)
        .query("path", to)
        .query("overwrite", overwrite)
}

pub(crate) fn move_(settings: &Settings, from: &str, to: &str, overwrite: bool) -> Request {
    Request::new(Method::POST, settings.api_url(&format!("{}/move", RESOURCES_PATH)))
        .query("from", from)
        .query("path", to)
        .query("overwrite", overwrite)
}

pub(crate) fn remove(settings: &Settings, path: &str, permanently: bool) -> Request {
    Request::new(Method::DELETE, settings.api_url(RESOURCES_PATH))
        .query("path", path)
        .query("permanently", permanently)
}

pub(crate) fn restore_trash(settings: &Settings, path: &str, overwrite: bool) -> Request {
    Request::new(Method::PUT, settings.api_url(&format!("{}/restore", TRASH_PATH)))
        .query("path", path)
        .query("overwrite", overwrite)
}

/// Removes `path` from the trash, or empties it.
pub(crate) fn remove_trash(settings: &Settings, path: Option<&str>) -> Request {
    let request = Request::new(Method::DELETE, settings.api_url(TRASH_PATH));
    match path {
        Some(path) => request.query("path", path),
        None => request,
    }
}

pub(crate) fn parse_job(reply: Reply) -> Result<JobOutcome> {
    if reply.status == 202 {
        let link: Link = reply.json()?;
        Ok(JobOutcome::Started(OperationHandle::from_link(link.href)))
    } else {
        Ok(JobOutcome::Completed)
    }
}

pub(crate) fn parse_link(reply: Reply) -> Result<Link> {
    reply.json()
}

pub(crate) fn parse_status(reply: Reply) -> Result<OperationStatus> {
    reply.json()
}
