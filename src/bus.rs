//! Completion bus correlating asynchronous job results with waiting callers.
//!
//! A [`Bus`] is a name-keyed signal registry: publishers push a payload under
//! a string key, subscribers either listen persistently or take a one-shot
//! ticket that resolves on the first publish and is then forgotten. The pool
//! registers a one-shot ticket under every [`JobId`](crate::JobId) before
//! dispatching, turning worker-local completion signals into awaitable
//! futures.
//!
//! The bus is an explicitly constructed, dependency-injected instance; there
//! is no process-wide registry.

use crate::JobOutcome;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

/// The bus instance shared by the scheduler, workers, and executors.
pub type CompletionBus = Bus<JobOutcome>;

enum Subscriber<T> {
    Persistent(mpsc::UnboundedSender<T>),
    Once(oneshot::Sender<T>),
}

/// Name-keyed publish/subscribe registry.
///
/// Safe for concurrent publish/subscribe from any number of in-flight jobs;
/// delivery is synchronous with respect to `publish` and never blocks.
pub struct Bus<T: Clone + Send + 'static> {
    channels: DashMap<String, Vec<Subscriber<T>>>,
}

impl<T: Clone + Send + 'static> Bus<T> {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Persistent subscription: receives every payload published under
    /// `name` until the receiver is dropped.
    pub fn subscribe(&self, name: &str) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .entry(name.to_string())
            .or_default()
            .push(Subscriber::Persistent(tx));
        rx
    }

    /// One-shot subscription: resolves with the first payload published
    /// under `name`, then the entry is removed.
    pub fn subscribe_once(&self, name: &str) -> Ticket<T> {
        let (tx, rx) = oneshot::channel();
        self.channels
            .entry(name.to_string())
            .or_default()
            .push(Subscriber::Once(tx));
        Ticket { receiver: rx }
    }

    /// Deliver `payload` to every current subscriber of `name`.
    ///
    /// One-shot subscribers are consumed; persistent subscribers whose
    /// receiver has gone away are pruned. Returns the number of subscribers
    /// reached.
    pub fn publish(&self, name: &str, payload: T) -> usize {
        let mut delivered = 0;
        if let Some(mut entry) = self.channels.get_mut(name) {
            let subscribers = std::mem::take(entry.value_mut());
            for subscriber in subscribers {
                match subscriber {
                    Subscriber::Persistent(tx) => {
                        if tx.send(payload.clone()).is_ok() {
                            delivered += 1;
                            entry.value_mut().push(Subscriber::Persistent(tx));
                        }
                    }
                    Subscriber::Once(tx) => {
                        if tx.send(payload.clone()).is_ok() {
                            delivered += 1;
                        }
                    }
                }
            }
        }
        self.channels.remove_if(name, |_, subs| subs.is_empty());
        delivered
    }

    /// Number of names with at least one live subscriber.
    pub fn subscription_count(&self) -> usize {
        self.channels.len()
    }
}

impl<T: Clone + Send + 'static> Default for Bus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaitable handle for a one-shot subscription.
pub struct Ticket<T> {
    receiver: oneshot::Receiver<T>,
}

impl<T> Ticket<T> {
    /// Wait for the payload. `None` means the bus was dropped without a
    /// publish under this name.
    pub async fn wait(self) -> Option<T> {
        self.receiver.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn once_ticket_resolves_with_first_publish() {
        let bus: Bus<u32> = Bus::new();
        let ticket = bus.subscribe_once("job-1");

        assert_eq!(bus.publish("job-1", 7), 1);
        // Later publishes under the same name reach nobody.
        assert_eq!(bus.publish("job-1", 8), 0);

        assert_eq!(ticket.wait().await, Some(7));
    }

    #[tokio::test]
    async fn persistent_subscription_sees_every_publish() {
        let bus: Bus<&'static str> = Bus::new();
        let mut rx = bus.subscribe("signal");

        bus.publish("signal", "a");
        bus.publish("signal", "b");

        assert_eq!(rx.recv().await, Some("a"));
        assert_eq!(rx.recv().await, Some("b"));
    }

    #[tokio::test]
    async fn publish_to_unknown_name_reaches_nobody() {
        let bus: Bus<u32> = Bus::new();
        assert_eq!(bus.publish("nobody-listens", 1), 0);
    }

    #[tokio::test]
    async fn dropped_persistent_receivers_are_pruned() {
        let bus: Bus<u32> = Bus::new();
        let rx = bus.subscribe("signal");
        drop(rx);

        assert_eq!(bus.publish("signal", 1), 0);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_under_other_names_are_untouched() {
        let bus: Bus<u32> = Bus::new();
        let first = bus.subscribe_once("job-1");
        let second = bus.subscribe_once("job-2");

        bus.publish("job-1", 10);
        bus.publish("job-2", 20);

        assert_eq!(first.wait().await, Some(10));
        assert_eq!(second.wait().await, Some(20));
    }

    #[tokio::test]
    async fn unresolved_ticket_yields_none_when_bus_drops() {
        let bus: Bus<u32> = Bus::new();
        let ticket = bus.subscribe_once("job-1");
        drop(bus);
        assert_eq!(ticket.wait().await, None);
    }
}
