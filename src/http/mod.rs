//! Request execution: descriptors, error classification, retries and the
//! executors that drive a transport session.

pub mod classify;
mod executor;
mod request;
mod retry;
mod sink;

pub use executor::{AsyncExecutor, Executor, Reply};
pub(crate) use request::CHUNK_SIZE;
pub use request::{Payload, Request, StreamPayload, Timeout};
pub use retry::{DEFAULT_RETRIES, RetryPolicy, RetryState};
pub use sink::{AsyncSink, Forward, Rewindable, Sink};
