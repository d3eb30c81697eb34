//! Server-side asynchronous operations.
//!
//! Long-running calls (copying a large directory, emptying the trash) answer
//! with a link to an operation. [`PollSchedule`] decides, after every status
//! query, whether to stop or to wait and query again; [`wait_blocking`] and
//! [`wait_async`] drive it with a thread sleep or a tokio sleep.

use std::future::Future;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Status endpoint path, relative to the API root.
pub const OPERATIONS_PATH: &str = "/v1/disk/operations";

/// Default delay between status queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Reference to a server-side job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationHandle {
    href: String,
}

impl OperationHandle {
    /// From the operation link returned by the job-starting call.
    pub fn from_link(href: impl Into<String>) -> Self {
        Self { href: href.into() }
    }

    /// From an operation id.
    pub fn from_id(base_url: &str, id: &str) -> Self {
        Self {
            href: format!(
                "{}{}/{}",
                base_url.trim_end_matches('/'),
                OPERATIONS_PATH,
                id
            ),
        }
    }

    pub fn status_url(&self) -> &str {
        &self.href
    }

    /// Operation id: the last path segment of the status URL.
    pub fn id(&self) -> &str {
        let path = self.href.split(['?', '#']).next().unwrap_or_default();
        path.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
    }
}

/// Operation state as reported by the status endpoint. Any status other than
/// `in-progress` and `success` is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    #[serde(rename = "in-progress")]
    Pending,
    Success,
    #[serde(other)]
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationState::Pending)
    }
}

/// Status payload of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub status: OperationState,
    /// Remaining fields of the payload, kept as returned.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// How job-starting calls wait for their operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Wait for the operation instead of returning its handle.
    pub wait: bool,
    pub poll_interval: Duration,
    /// Give up after this long. `None` waits indefinitely.
    pub poll_timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            wait: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: None,
        }
    }
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the handle without waiting.
    pub fn no_wait() -> Self {
        Self {
            wait: false,
            ..Self::default()
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }
}

/// What to do after a status query.
#[derive(Debug, PartialEq)]
pub enum PollStep {
    /// The operation succeeded.
    Done(OperationStatus),
    /// Still running: query again after this delay.
    Wait(Duration),
}

/// Poll state machine for one wait.
#[derive(Debug)]
pub struct PollSchedule {
    interval: Duration,
    timeout: Option<Duration>,
    polls: u32,
}

impl PollSchedule {
    pub fn new(options: &WaitOptions) -> Self {
        Self {
            interval: options.poll_interval,
            timeout: options.poll_timeout,
            polls: 0,
        }
    }

    /// Status queries observed so far.
    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Feeds the result of a status query made `elapsed` after the wait
    /// started.
    pub fn observe(&mut self, status: OperationStatus, elapsed: Duration) -> Result<PollStep> {
        self.polls += 1;

        match status.status {
            OperationState::Success => {
                debug!("Operation succeeded after {} status queries", self.polls);
                Ok(PollStep::Done(status))
            }
            OperationState::Failed => {
                debug!("Operation failed after {} status queries", self.polls);
                Err(Error::OperationFailed { status })
            }
            OperationState::Pending => match self.timeout {
                Some(timeout) if elapsed >= timeout => Err(Error::PollTimeout {
                    timeout,
                    polls: self.polls,
                }),
                _ => {
                    debug!(
                        "Operation in progress ({} status queries, {:?} elapsed)",
                        self.polls, elapsed
                    );
                    Ok(PollStep::Wait(self.interval))
                }
            },
        }
    }
}

/// Polls with `query` until the operation is terminal or the timeout passes.
pub fn wait_blocking<F>(options: &WaitOptions, mut query: F) -> Result<OperationStatus>
where
    F: FnMut() -> Result<OperationStatus>,
{
    let started = std::time::Instant::now();
    let mut schedule = PollSchedule::new(options);

    loop {
        let status = query()?;
        match schedule.observe(status, started.elapsed())? {
            PollStep::Done(status) => return Ok(status),
            PollStep::Wait(delay) => std::thread::sleep(delay),
        }
    }
}

/// Cooperative counterpart of [`wait_blocking`].
pub async fn wait_async<F, Fut>(options: &WaitOptions, mut query: F) -> Result<OperationStatus>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<OperationStatus>>,
{
    let started = tokio::time::Instant::now();
    let mut schedule = PollSchedule::new(options);

    loop {
        let status = query().await?;
        match schedule.observe(status, started.elapsed())? {
            PollStep::Done(status) => return Ok(status),
            PollStep::Wait(delay) => tokio::time::sleep(delay).await,
        }
    }
}
