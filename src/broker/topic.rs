//! Subscription registry.
//!
//! Maps topic filters to subscribers and the QoS each subscription asked
//! for. Entries live in a `DashMap` so subscriptions on unrelated filters
//! never contend. Matching implements the standard MQTT `+`/`#` wildcard
//! rules; the rest of the broker treats the predicate as opaque.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::protocol::Qos;

pub type SubscriberId = String;

/// True when an MQTT topic filter matches a physical topic.
///
/// `+` spans exactly one level; `#` must be last and spans the remainder
/// (including zero levels, so `a/#` matches `a`).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    filters: DashMap<String, HashMap<SubscriberId, Qos>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            filters: DashMap::new(),
        }
    }

    /// Add or refresh a subscription. Re-subscribing updates the QoS.
    pub fn subscribe(&self, filter: &str, subscriber: SubscriberId, qos: Qos) {
        self.filters
            .entry(filter.to_string())
            .or_insert_with(HashMap::new)
            .insert(subscriber, qos);
    }

    pub fn unsubscribe(&self, filter: &str, subscriber: &str) {
        if let Some(mut subs) = self.filters.get_mut(filter) {
            subs.remove(subscriber);
        }
        self.filters.remove_if(filter, |_, subs| subs.is_empty());
    }

    /// Remove every subscription a client holds.
    pub fn remove_client(&self, subscriber: &str) {
        for mut entry in self.filters.iter_mut() {
            entry.value_mut().remove(subscriber);
        }
        self.filters.retain(|_, subs| !subs.is_empty());
    }

    /// Subscribers whose filter matches the published topic. A client
    /// matching through several filters appears once, at the strongest
    /// requested QoS.
    pub fn matching(&self, topic: &str) -> Vec<(SubscriberId, Qos)> {
        let mut matched: HashMap<SubscriberId, Qos> = HashMap::new();
        for entry in self.filters.iter() {
            if !topic_matches(entry.key(), topic) {
                continue;
            }
            for (subscriber, qos) in entry.value() {
                matched
                    .entry(subscriber.clone())
                    .and_modify(|existing| {
                        if *qos > *existing {
                            *existing = *qos;
                        }
                    })
                    .or_insert(*qos);
            }
        }
        matched.into_iter().collect()
    }
}
