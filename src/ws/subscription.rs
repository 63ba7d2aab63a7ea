//! Per-event-type handler registry used by [`crate::ws::transport::Transport`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::id::SubscriptionId;
use super::time::Clock;

/// One registered handler plus the id used to remove it again.
struct HandlerEntry<E> {
    id: SubscriptionId,
    handler: Arc<dyn Fn(&E) + Send + Sync>,
}

/// Bookkeeping kept per subscription id, independent of how many event types
/// it spans: when it was created and when a handler under it last ran,
/// so the resource janitor can find subscriptions nothing has touched in a
/// while.
struct Subscription {
    types: Vec<String>,
    created_at: Instant,
    last_event_at: Mutex<Instant>,
}

/// Maps an event-type discriminant to its registered handlers, plus a
/// reverse index from subscription id to the types it was registered under.
///
/// Dispatch clones the `Vec<Arc<HandlerEntry>>` for a type out of the map
/// before invoking anything: handlers never run while holding the map's
/// shard lock, so a handler is free to subscribe or unsubscribe without
/// deadlocking on itself.
pub struct SubscriptionRegistry<E> {
    handlers: DashMap<String, Vec<Arc<HandlerEntry<E>>>>,
    subscriptions: DashMap<SubscriptionId, Subscription>,
    clock: Arc<dyn Clock>,
}

impl<E> SubscriptionRegistry<E> {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            handlers: DashMap::new(),
            subscriptions: DashMap::new(),
            clock,
        }
    }

    /// Registers `handler` under every type in `types`, all sharing one
    /// subscription id. `Unsubscribe` on that id removes exactly the
    /// handlers installed here, regardless of how many types it spans.
    pub fn subscribe<F>(&self, types: impl IntoIterator<Item = impl Into<String>>, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        let handler: Arc<dyn Fn(&E) + Send + Sync> = Arc::new(handler);
        let mut registered = Vec::new();
        for event_type in types {
            let event_type = event_type.into();
            let entry = Arc::new(HandlerEntry {
                id,
                handler: Arc::clone(&handler),
            });
            self.handlers
                .entry(event_type.clone())
                .or_default()
                .push(entry);
            registered.push(event_type);
        }
        let now = self.clock.now();
        self.subscriptions.insert(
            id,
            Subscription {
                types: registered,
                created_at: now,
                last_event_at: Mutex::new(now),
            },
        );
        id
    }

    /// Removes every handler installed by `subscribe` under `id`. Returns
    /// `true` if `id` was a live subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some((_, subscription)) = self.subscriptions.remove(&id) else {
            return false;
        };
        for event_type in subscription.types {
            if let dashmap::mapref::entry::Entry::Occupied(mut entry) =
                self.handlers.entry(event_type)
            {
                entry.get_mut().retain(|e| e.id != id);
                if entry.get().is_empty() {
                    entry.remove();
                }
            }
        }
        true
    }

    /// Invokes every handler registered for `event_type` with a snapshot of
    /// the handler list, not the live one, and marks every touched
    /// subscription id as having just fired.
    pub fn dispatch(&self, event_type: &str, event: &E) {
        let snapshot = self.handlers.get(event_type).map(|v| v.clone());
        let Some(entries) = snapshot else {
            return;
        };
        let now = self.clock.now();
        for entry in &entries {
            if let Some(subscription) = self.subscriptions.get(&entry.id) {
                *subscription
                    .last_event_at
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = now;
            }
        }
        for entry in entries {
            (entry.handler)(event);
        }
    }

    /// Removes every subscription whose last dispatched event (or creation,
    /// if it never fired) is older than `ttl`. Returns the number pruned.
    pub fn prune_idle(&self, ttl: Duration) -> usize {
        let now = self.clock.now();
        let stale: Vec<SubscriptionId> = self
            .subscriptions
            .iter()
            .filter(|entry| {
                let last_event_at = *entry
                    .value()
                    .last_event_at
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                now.saturating_duration_since(last_event_at) >= ttl
            })
            .map(|entry| *entry.key())
            .collect();

        let mut pruned = 0;
        for id in stale {
            if self.unsubscribe(id) {
                pruned += 1;
            }
        }
        pruned
    }

    #[must_use]
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map_or(0, |v| v.len())
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
