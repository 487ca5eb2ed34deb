//! FIFO of callers waiting for a slot.
//!
//! Each [`Waiter`] owns the sending half of a oneshot channel; the caller
//! blocked in `acquire` holds the receiver. A waiter is claimed by whoever
//! takes it out of the queue first: the releasing side through
//! [`WaitQueue::dequeue_oldest`], or the waiting side through
//! [`WaitQueue::remove`] on timeout or cancellation. Both run under the
//! controller lock, so a removed waiter can never be promoted afterwards.
use std::collections::VecDeque;

use tokio::{sync::oneshot, time::Instant};

use crate::core::connection::{ClientInfo, ConnectionToken};

/// A caller parked until a slot frees up or its deadline passes.
#[derive(Debug)]
pub struct Waiter {
    pub token: ConnectionToken,
    pub client: ClientInfo,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    promote_tx: oneshot::Sender<()>,
}

impl Waiter {
    /// Build a waiter and the receiver its caller should await.
    pub fn new(
        token: ConnectionToken,
        client: ClientInfo,
        deadline: Instant,
    ) -> (Self, oneshot::Receiver<()>) {
        let (promote_tx, promote_rx) = oneshot::channel();
        let waiter = Self {
            token,
            client,
            enqueued_at: Instant::now(),
            deadline,
            promote_tx,
        };
        (waiter, promote_rx)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Wake the caller. Returns `false` if the caller has already gone away.
    pub fn signal(self) -> bool {
        self.promote_tx.send(()).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: VecDeque<Waiter>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, waiter: Waiter) {
        self.waiters.push_back(waiter);
    }

    pub fn dequeue_oldest(&mut self) -> Option<Waiter> {
        self.waiters.pop_front()
    }

    /// Take a specific waiter out of the queue, preserving the order of the rest.
    pub fn remove(&mut self, token: &ConnectionToken) -> Option<Waiter> {
        let index = self.waiters.iter().position(|w| &w.token == token)?;
        self.waiters.remove(index)
    }

    pub fn contains(&self, token: &ConnectionToken) -> bool {
        self.waiters.iter().any(|w| &w.token == token)
    }

    /// Remove every waiter; dropping them wakes their callers with a closed channel.
    pub fn drain(&mut self) -> Vec<Waiter> {
        self.waiters.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn waiter(deadline_in: Duration) -> (Waiter, oneshot::Receiver<()>) {
        Waiter::new(
            ConnectionToken::new(),
            ClientInfo::new("127.0.0.1", "/proxy/q", "GET", "req"),
            Instant::now() + deadline_in,
        )
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo() {
        let mut queue = WaitQueue::new();
        let (first, _rx1) = waiter(Duration::from_secs(5));
        let (second, _rx2) = waiter(Duration::from_secs(5));
        let (first_token, second_token) = (first.token, second.token);

        queue.enqueue(first);
        queue.enqueue(second);

        assert_eq!(queue.dequeue_oldest().map(|w| w.token), Some(first_token));
        assert_eq!(queue.dequeue_oldest().map(|w| w.token), Some(second_token));
        assert!(queue.dequeue_oldest().is_none());
    }

    #[tokio::test]
    async fn test_remove_keeps_order_of_remaining() {
        let mut queue = WaitQueue::new();
        let receivers: Vec<_> = (0..3)
            .map(|_| {
                let (w, rx) = waiter(Duration::from_secs(5));
                let token = w.token;
                queue.enqueue(w);
                (token, rx)
            })
            .collect();

        assert!(queue.remove(&receivers[1].0).is_some());
        assert!(queue.remove(&receivers[1].0).is_none());
        assert!(!queue.contains(&receivers[1].0));
        assert_eq!(queue.dequeue_oldest().map(|w| w.token), Some(receivers[0].0));
        assert_eq!(queue.dequeue_oldest().map(|w| w.token), Some(receivers[2].0));
    }

    #[tokio::test]
    async fn test_signal_wakes_receiver() {
        let (w, rx) = waiter(Duration::from_secs(5));
        assert!(w.signal());
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_signal_fails_once_receiver_dropped() {
        let (w, rx) = waiter(Duration::from_secs(5));
        drop(rx);
        assert!(!w.signal());
    }

    #[tokio::test]
    async fn test_drain_closes_receivers() {
        let mut queue = WaitQueue::new();
        let (w, rx) = waiter(Duration::from_secs(5));
        queue.enqueue(w);

        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert!(queue.is_empty());
        drop(drained);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_expiry() {
        let (w, _rx) = waiter(Duration::from_millis(10));
        assert!(!w.is_expired(Instant::now()));
        assert!(w.is_expired(Instant::now() + Duration::from_millis(20)));
    }
}
