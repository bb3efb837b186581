//! In-process publish/subscribe over structured routing keys.
//!
//! Topic keys are tuples of strings, e.g. `["builds", "42", "finished"]`.
//! Patterns may use `*` as a single-segment wildcard. Delivery is
//! fire-and-forget but synchronous: `publish` does not return until
//! every currently-subscribed consumer has the event queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, mpsc};

pub type RoutingKey = Vec<String>;

/// A subscription pattern. `*` matches exactly one segment; there is
/// no multi-segment wildcard, matching the routing keys used
/// throughout this crate, which are always a fixed arity per entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern(pub Vec<String>);

impl Pattern {
    pub fn new(segments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, key: &[String]) -> bool {
        if self.0.len() != key.len() {
            return false;
        }
        self.0
            .iter()
            .zip(key.iter())
            .all(|(pat, seg)| pat == "*" || pat == seg)
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub seq: u64,
    pub key: RoutingKey,
    pub payload: Value,
}

struct Subscriber {
    pattern: Pattern,
    tx: mpsc::UnboundedSender<Event>,
}

/// A handle returned by `subscribe`/`consume`. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
    bus: Arc<EventBusInner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let bus = self.bus.clone();
        let id = self.id;
        tokio::spawn(async move {
            bus.subscribers.lock().await.retain(|(sid, _)| *sid != id);
        });
    }
}

/// A durable-consume handle requiring an explicit `ack` before the
/// event is considered processed. In a single-process master this is
/// equivalent to `Subscription`; the ack bookkeeping exists so
/// multi-master coordination (out of scope here) has somewhere to
/// hook in without changing the API.
pub struct ConsumeHandle {
    inner: Subscription,
    pending: Option<u64>,
}

impl ConsumeHandle {
    pub async fn recv(&mut self) -> Option<Event> {
        let event = self.inner.rx.recv().await;
        self.pending = event.as_ref().map(|e| e.seq);
        event
    }

    /// Acknowledge the most recently received event. Panics if called
    /// without a pending event -- mirrors a programming error the same
    /// way an unmatched `ack` on a real broker would.
    pub fn ack(&mut self, seq: u64) {
        assert_eq!(self.pending, Some(seq), "ack for an event that wasn't the pending one");
        self.pending = None;
    }
}

struct EventBusInner {
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_sub_id: AtomicU64,
    next_seq: AtomicU64,
}

/// The bus itself. Cheap to clone (it's an `Arc` internally); share one
/// instance across every component of a master.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                subscribers: Mutex::new(Vec::new()),
                next_sub_id: AtomicU64::new(0),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Best-effort, fire-and-forget publish. Returns only after every
    /// currently-subscribed consumer has the event enqueued.
    pub async fn publish(&self, key: RoutingKey, payload: Value) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let event = Event { seq, key, payload };
        let subs = self.inner.subscribers.lock().await;
        for (_, sub) in subs.iter() {
            if sub.pattern.matches(&event.key) {
                // A closed receiver just means the subscriber dropped
                // mid-flight; that's not a publish failure.
                let _ = sub.tx.send(event.clone());
            }
        }
    }

    pub async fn subscribe(&self, pattern: Pattern) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .await
            .push((id, Subscriber { pattern, tx }));
        Subscription {
            id,
            rx,
            bus: self.inner.clone(),
        }
    }

    pub async fn consume(&self, pattern: Pattern) -> ConsumeHandle {
        ConsumeHandle {
            inner: self.subscribe(pattern).await,
            pending: None,
        }
    }

    /// Resolve on the first future event matching `pattern` for which
    /// `predicate` holds. Subscribes before returning so no matching
    /// event published after this call can be missed; callers that
    /// need "already true" semantics should check their own state
    /// before calling this and skip the await entirely.
    pub async fn wait_until<F>(&self, pattern: Pattern, mut predicate: F) -> Event
    where
        F: FnMut(&Event) -> bool + Send,
    {
        let mut sub = self.subscribe(pattern).await;
        loop {
            match sub.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => unreachable!("bus dropped its own sender"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_to_matching_subscribers_only() {
        let bus = EventBus::new();
        let mut builds = bus.subscribe(Pattern::new(["builds", "*", "finished"])).await;
        let mut steps = bus.subscribe(Pattern::new(["steps", "*", "finished"])).await;

        bus.publish(
            vec!["builds".into(), "1".into(), "finished".into()],
            json!({"results": "SUCCESS"}),
        )
        .await;

        let event = builds.recv().await.expect("event delivered");
        assert_eq!(event.key, vec!["builds", "1", "finished"]);

        // Not delivered to the mismatched pattern.
        assert!(steps.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn same_key_preserves_publication_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Pattern::new(["builds", "1", "update"])).await;
        for i in 0..5 {
            bus.publish(
                vec!["builds".into(), "1".into(), "update".into()],
                json!({"n": i}),
            )
            .await;
        }
        for i in 0..5 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.payload["n"], i);
        }
    }

    #[tokio::test]
    async fn wait_until_resolves_on_matching_predicate() {
        let bus = EventBus::new();
        let bus2 = bus.clone();
        let handle = tokio::spawn(async move {
            bus2.wait_until(Pattern::new(["builds", "*", "finished"]), |e| {
                e.payload["results"] == "SUCCESS"
            })
            .await
        });

        // Give the waiter a chance to subscribe.
        tokio::task::yield_now().await;
        bus.publish(
            vec!["builds".into(), "1".into(), "finished".into()],
            json!({"results": "FAILURE"}),
        )
        .await;
        bus.publish(
            vec!["builds".into(), "1".into(), "finished".into()],
            json!({"results": "SUCCESS"}),
        )
        .await;

        let event = handle.await.unwrap();
        assert_eq!(event.payload["results"], "SUCCESS");
    }

    #[tokio::test]
    async fn consume_requires_ack_bookkeeping() {
        let bus = EventBus::new();
        let mut handle = bus.consume(Pattern::new(["control", "*", "stop"])).await;
        bus.publish(
            vec!["control".into(), "1".into(), "stop".into()],
            json!({"reason": "stop it"}),
        )
        .await;
        let event = handle.recv().await.unwrap();
        handle.ack(event.seq);
    }
}
