//! service-core: Shared infrastructure for the store-credit services.
pub mod error;
pub mod observability;
pub mod retry;
pub mod utils;

pub use async_trait;
pub use axum;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;
pub use validator;
