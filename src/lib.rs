pub mod api;
pub mod async_client;
pub mod client;
pub mod error;
pub mod http;
pub mod operation;
pub mod settings;
pub mod transport;

pub use api::{JobOutcome, Link};
pub use async_client::AsyncClient;
pub use client::Client;
pub use error::{ApiError, Error, ErrorKind, Result};
pub use http::{Payload, Request, RetryPolicy, StreamPayload, Timeout};
pub use operation::{OperationHandle, OperationState, OperationStatus, WaitOptions};
pub use settings::{RequestOptions, Settings};
pub use transport::Backend;
