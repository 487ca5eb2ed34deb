//! Turnstile - a connection admission gateway.
//!
//! Turnstile puts a hard ceiling on how many requests a downstream service
//! sees at once. Requests beyond the ceiling wait in a FIFO queue until a slot
//! frees up or their timeout passes, at which point they get a `503` carrying
//! the current queue depth.
//!
//! # Quick Example
//! ```no_run
//! use std::time::Duration;
//!
//! use turnstile::{AdmissionController, ClientInfo};
//!
//! # #[tokio::main] async fn main() {
//! let controller = AdmissionController::new(100, Duration::from_secs(30));
//! let client = ClientInfo::new("203.0.113.9", "/proxy/users", "GET", "req-1");
//! match controller.acquire_default(client).await {
//!     Ok(permit) => {
//!         // do the work, then hand the slot back (dropping the permit also works)
//!         permit.release();
//!     }
//!     Err(rejection) => eprintln!("busy, {} queued", rejection.queue_depth),
//! }
//! # }
//! ```
//!
//! # Architecture
//! Admission logic and its bookkeeping live in [`core`] and know nothing
//! about HTTP. [`adapters`] mounts them behind axum. Configuration, logging,
//! metrics export and shutdown handling sit in their own modules.
//!
//! # Concurrency
//! The registry, wait queue and counters are guarded by one mutex, so every
//! admission decision sees a consistent view of all three. The lock is never
//! held across an `.await`.
//!
//! # Error Handling
//! Setup paths return `eyre::Result<T>`. Admission itself returns a typed
//! [`Rejection`].
pub mod config;
pub mod metrics;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{AppState, router},
    core::{
        AdmissionController, AdmissionPermit, ClientInfo, Connection, ConnectionToken,
        MetricsSnapshot, RejectReason, Rejection,
    },
    utils::GracefulShutdown,
};
