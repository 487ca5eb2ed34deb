pub mod error;
pub mod http_handler;
pub mod middleware;

/// Re-export commonly used types from adapters
pub use error::ApiError;
pub use http_handler::{AppState, router};
pub use middleware::{Admitted, RequestId};
