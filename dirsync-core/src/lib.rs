mod client;
mod connection;
pub mod protocol;
pub mod retry;

pub use client::{ClientError, DEFAULT_MAX_UPLOAD_BYTES, ProtocolClient};
pub use connection::{ConnectionError, ConnectionManager, ServerAddress};
pub use retry::{FailureKind, RetryPolicy, classify_failure};
