pub mod admission;
pub mod connection;
pub mod registry;
pub mod stats;
pub mod wait_queue;

pub use admission::{AdmissionController, AdmissionPermit, RejectReason, Rejection};
pub use connection::{ClientInfo, Connection, ConnectionToken};
pub use registry::ConnectionRegistry;
pub use stats::{MetricsAggregator, MetricsSnapshot};
pub use wait_queue::{WaitQueue, Waiter};
