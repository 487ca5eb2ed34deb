//! Admission data model: tokens, client metadata and connection records.
use std::{
    fmt,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Requests per window a connection starts with. Carried on the record only;
/// nothing in the controller decrements or enforces it.
pub const DEFAULT_RATE_LIMIT: u32 = 100;

/// Opaque identifier correlating an admission grant with its release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionToken(Uuid);

impl ConnectionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Request metadata supplied by the caller of `acquire`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    /// Client identity, usually the remote IP.
    pub identity: String,
    pub endpoint: String,
    pub method: String,
    /// Request correlation id (the `X-Request-ID` value at the HTTP layer).
    pub correlation_id: String,
    /// Auxiliary data, never inspected by the controller.
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn new(
        identity: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            endpoint: endpoint.into(),
            method: method.into(),
            correlation_id: correlation_id.into(),
            user_agent: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// A request currently holding one of the controller's slots.
#[derive(Debug, Clone)]
pub struct Connection {
    pub token: ConnectionToken,
    pub client: ClientInfo,
    pub admitted_at: Instant,
    pub admitted_at_utc: DateTime<Utc>,
    /// Set when the connection went through the wait queue.
    pub enqueued_at: Option<Instant>,
    pub rate_limit_remaining: u32,
}

impl Connection {
    pub(crate) fn admit(token: ConnectionToken, client: ClientInfo) -> Self {
        Self {
            token,
            client,
            admitted_at: Instant::now(),
            admitted_at_utc: Utc::now(),
            enqueued_at: None,
            rate_limit_remaining: DEFAULT_RATE_LIMIT,
        }
    }

    pub(crate) fn promote(token: ConnectionToken, client: ClientInfo, enqueued_at: Instant) -> Self {
        let mut connection = Self::admit(token, client);
        connection.enqueued_at = Some(enqueued_at);
        connection
    }

    /// Time since the slot was granted.
    pub fn age(&self) -> Duration {
        self.admitted_at.elapsed()
    }

    /// Time spent in the wait queue before promotion, zero for direct admissions.
    pub fn queue_wait(&self) -> Duration {
        self.enqueued_at
            .map(|queued| self.admitted_at.saturating_duration_since(queued))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let a = ConnectionToken::new();
        let b = ConnectionToken::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
    }

    #[test]
    fn test_direct_admission_has_no_queue_wait() {
        let client = ClientInfo::new("10.0.0.1", "/proxy/a", "GET", "req-1");
        let conn = Connection::admit(ConnectionToken::new(), client);
        assert_eq!(conn.queue_wait(), Duration::ZERO);
        assert_eq!(conn.rate_limit_remaining, DEFAULT_RATE_LIMIT);
    }

    #[test]
    fn test_promoted_connection_reports_queue_wait() {
        let client = ClientInfo::new("10.0.0.1", "/proxy/a", "GET", "req-1")
            .with_user_agent("curl/8.0");
        let enqueued_at = Instant::now() - Duration::from_millis(250);
        let conn = Connection::promote(ConnectionToken::new(), client, enqueued_at);
        assert!(conn.queue_wait() >= Duration::from_millis(250));
        assert_eq!(conn.client.user_agent.as_deref(), Some("curl/8.0"));
    }
}
