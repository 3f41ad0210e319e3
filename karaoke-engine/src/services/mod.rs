//! Engine services
//!
//! Leaf components used by the background jobs: retry/backoff policy, the
//! remote separation HTTP client, stem archive extraction, external tool
//! supervision, and the service container lifecycle.

pub mod archive;
pub mod lifecycle;
pub mod process;
pub mod retry;
pub mod separation_client;

pub use archive::{ArchiveError, EXPECTED_STEMS};
pub use lifecycle::ServiceManager;
pub use process::ToolError;
pub use retry::{next_delay, with_retry, RetryError, RetryPolicy};
pub use separation_client::{RemoteSeparationClient, SeparationError};
