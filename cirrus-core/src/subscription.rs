//! Prefix subscriptions for the current pub/sub mechanism.
//!
//! A subscription pairs a name prefix with a handler. Matching is plain
//! byte-prefix matching; an incoming event fans out to *every* matching
//! subscription, in registration order — there is no first-match exit.

use smallvec::SmallVec;
use std::sync::Arc;

use crate::event::Event;

/// Subscription handler; runs on the application context, once per
/// matching inbound event.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync + 'static>;

/// A subscription entry with its name prefix.
#[derive(Clone)]
pub struct Subscription {
    prefix: String,
    callback: EventCallback,
}

impl Subscription {
    pub fn new(prefix: impl Into<String>, callback: EventCallback) -> Self {
        Self {
            prefix: prefix.into(),
            callback,
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether this subscription matches an event name.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        name.as_bytes().len() >= self.prefix.len()
            && name.as_bytes()[..self.prefix.len()] == *self.prefix.as_bytes()
    }

    #[must_use]
    pub fn callback(&self) -> &EventCallback {
        &self.callback
    }
}

/// Ordered table of prefix subscriptions.
///
/// Insertion order is match-check order. Growth is unbounded; removal is
/// all-or-nothing via `clear`.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subs: Vec<Subscription>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self { subs: Vec::new() }
    }

    pub fn add(&mut self, sub: Subscription) {
        self.subs.push(sub);
    }

    /// Roll back the most recent `add` (used when wire-handler registration
    /// fails after the append).
    pub fn remove_last(&mut self) {
        self.subs.pop();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn clear(&mut self) {
        self.subs.clear();
    }

    /// Every matching subscription, in registration order.
    #[must_use]
    pub fn matches(&self, name: &str) -> SmallVec<[Subscription; 4]> {
        self.subs
            .iter()
            .filter(|s| s.matches(name))
            .cloned()
            .collect()
    }
}
