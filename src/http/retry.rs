//! Retry policy and the retry state machine shared by the blocking and the
//! cooperative executors.

use std::future::Future;
use std::io;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, ErrorKind, Result};

/// Default number of retries.
pub const DEFAULT_RETRIES: u32 = 3;

/// How a single call is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Attempts are `n_retries + 1`.
    pub n_retries: u32,
    /// Fixed delay between attempts.
    pub interval: Duration,
    /// Kinds retried for this call in addition to the built-in set.
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            n_retries: DEFAULT_RETRIES,
            interval: Duration::ZERO,
            retry_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn new(n_retries: u32, interval: Duration) -> Self {
        Self {
            n_retries,
            interval,
            retry_on: Vec::new(),
        }
    }

    /// A policy making exactly one attempt.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on.extend(kinds);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.n_retries.saturating_add(1)
    }

    /// Whether `error` is worth another attempt under this policy.
    pub fn should_retry(&self, error: &Error) -> bool {
        if error.retry_forbidden() {
            return false;
        }

        let kind = error.kind();
        kind.is_retryable() || self.retry_on.iter().any(|extra| kind.is_a(*extra))
    }
}

/// Attempt bookkeeping for one call.
///
/// Drivers call [`RetryState::next`] after every failed attempt: it either
/// returns the delay to wait before the next attempt or hands back the error
/// as terminal.
#[derive(Debug)]
pub struct RetryState<'a> {
    policy: &'a RetryPolicy,
    attempt: u32,
    max_attempts: u32,
}

impl<'a> RetryState<'a> {
    /// `rewindable` is false when the request body or the download sink cannot
    /// be reset, which limits the call to a single attempt.
    pub fn new(policy: &'a RetryPolicy, rewindable: bool) -> Self {
        let max_attempts = if rewindable { policy.max_attempts() } else { 1 };

        Self {
            policy,
            attempt: 1,
            max_attempts,
        }
    }

    /// Number of the attempt in progress, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what happens after the current attempt failed with `error`.
    pub fn next(&mut self, error: Error) -> Result<Duration> {
        if !self.policy.should_retry(&error) {
            debug!(
                "Not triggering an automatic retry: {} is not retryable (attempt {}/{}): {}",
                error.kind(),
                self.attempt,
                self.max_attempts,
                error
            );
            return Err(error);
        }

        if self.attempt >= self.max_attempts {
            warn!(
                "Giving up after {} attempt(s): {}",
                self.attempt, error
            );
            return Err(error);
        }

        info!(
            "Automatic retry triggered: attempt {}/{} failed ({}), retrying in {:?}",
            self.attempt, self.max_attempts, error, self.policy.interval
        );
        self.attempt += 1;
        Ok(self.policy.interval)
    }

    /// Blocking recovery after a failed attempt: decides with
    /// [`RetryState::next`], runs `rewind`, then sleeps the delay. Errors
    /// when the call is over or the rewind fails.
    pub fn recover<F>(&mut self, error: Error, rewind: F) -> Result<()>
    where
        F: FnOnce() -> io::Result<()>,
    {
        let delay = self.next(error)?;
        rewind().map_err(Error::Rewind)?;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(())
    }

    /// Cooperative counterpart of [`RetryState::recover`]. `rewind` is only
    /// awaited when another attempt follows.
    pub async fn recover_async<F>(&mut self, error: Error, rewind: F) -> Result<()>
    where
        F: Future<Output = io::Result<()>>,
    {
        let delay = self.next(error)?;
        rewind.await.map_err(Error::Rewind)?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}
