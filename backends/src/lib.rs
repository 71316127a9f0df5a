pub mod local;
pub mod registry;
pub mod retry;
pub mod s3;

pub use local::LocalBackend;
pub use registry::{BackendConfig, BackendFactory, BackendRegistry};
pub use retry::{RetryBackend, RetryConfig, Retryable, retry_with_backoff};
pub use s3::S3Backend;
