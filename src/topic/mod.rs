//! Subscription index and topic matching.
//!
//! The index is an ordered set of `(client, filter, options)` tuples stored
//! in a level trie. Shared subscriptions (`$share/{group}/{filter}`) are
//! stored under their match filter with the group kept on the entry; at
//! delivery time each group receives exactly one copy, handed to the member
//! whose last delivery for that group is oldest.

mod trie;
pub mod validation;

pub use validation::{
    parse_shared_filter, topic_matches_filter, validate_topic_filter, validate_topic_name,
};

use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::protocol::SubscriptionOptions;
use trie::FilterTrie;

/// One subscription index entry.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub client_id: Arc<str>,
    /// Filter exactly as subscribed, `$share/` prefix included.
    pub filter: Arc<str>,
    pub options: SubscriptionOptions,
    pub subscription_id: Option<u32>,
    pub share_group: Option<Arc<str>>,
}

impl Subscription {
    /// The filter used for matching: the subscribed filter with any
    /// `$share/{group}/` prefix stripped.
    pub fn match_filter(&self) -> &str {
        match parse_shared_filter(&self.filter) {
            Ok(Some((_, rest))) => rest,
            _ => &self.filter,
        }
    }
}

/// Process-wide subscription index.
pub struct SubscriptionStore {
    trie: RwLock<FilterTrie>,
    /// Last delivery instant per share group member, for fair rotation.
    share_rotation: Mutex<AHashMap<Arc<str>, AHashMap<Arc<str>, Instant>>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(FilterTrie::default()),
            share_rotation: Mutex::new(AHashMap::new()),
        }
    }

    /// Insert or replace the `(client, filter)` entry.
    /// Returns true when an existing entry was replaced.
    pub fn insert(&self, sub: Subscription) -> bool {
        let match_filter = sub.match_filter().to_string();
        self.trie.write().insert(&match_filter, sub)
    }

    /// Delete the `(client, filter)` entry. Returns true when it existed.
    pub fn remove(&self, client_id: &str, filter: &str) -> bool {
        let match_filter = match parse_shared_filter(filter) {
            Ok(Some((_, rest))) => rest,
            _ => filter,
        };
        self.trie.write().remove(match_filter, client_id, filter)
    }

    /// Drop every entry for `client_id` (clean-start replacement, session
    /// eviction).
    pub fn remove_client(&self, client_id: &str) {
        self.trie.write().remove_client(client_id);
    }

    /// Every subscription whose filter matches `topic`, shared entries
    /// included, no group selection applied.
    pub fn matches_all(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let mut out = SmallVec::new();
        self.trie.read().matches(topic, |sub| out.push(sub.clone()));
        out
    }

    /// Matching subscriptions ready for delivery: non-shared entries pass
    /// through, and each share group is collapsed to the single member with
    /// the oldest last-delivery instant (never-delivered members first,
    /// client id breaking ties). The chosen member's timestamp advances.
    pub fn matches_for_delivery(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let mut out: SmallVec<[Subscription; 16]> = SmallVec::new();
        let mut shared: AHashMap<Arc<str>, SmallVec<[Subscription; 4]>> = AHashMap::new();

        self.trie.read().matches(topic, |sub| {
            if let Some(ref group) = sub.share_group {
                shared.entry(group.clone()).or_default().push(sub.clone());
            } else {
                out.push(sub.clone());
            }
        });

        if !shared.is_empty() {
            let now = Instant::now();
            let mut rotation = self.share_rotation.lock();
            for (group, members) in shared {
                let stamps = rotation.entry(group).or_default();
                let chosen = members.into_iter().min_by(|a, b| {
                    let a_key = (stamps.get(&a.client_id).copied(), a.client_id.as_ref());
                    let b_key = (stamps.get(&b.client_id).copied(), b.client_id.as_ref());
                    a_key.cmp(&b_key)
                });
                if let Some(chosen) = chosen {
                    stamps.insert(chosen.client_id.clone(), now);
                    out.push(chosen);
                }
            }
        }

        out
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
