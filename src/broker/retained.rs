//! Retained message store.
//!
//! Exactly one retained publish per topic name, remembered together with
//! the publishing client id (for no-local filtering at subscribe time).
//! A retain publish with an empty payload deletes the record. Entries with
//! a message-expiry interval are swept on lookup and by the housekeeper,
//! and the interval is decremented by the time spent retained before the
//! message is forwarded.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::protocol::Publish;

#[derive(Debug, Clone)]
struct RetainedEntry {
    publish: Publish,
    origin: Arc<str>,
    stored_at: Instant,
}

impl RetainedEntry {
    fn is_expired(&self) -> bool {
        match self.publish.properties.message_expiry_interval {
            Some(expiry) => self.stored_at.elapsed().as_secs() as u32 >= expiry,
            None => false,
        }
    }

    /// The stored publish with its expiry decremented by retention time.
    fn to_live(&self) -> Option<(Publish, Arc<str>)> {
        let mut publish = self.publish.clone();
        if let Some(expiry) = publish.properties.message_expiry_interval {
            let elapsed = self.stored_at.elapsed().as_secs() as u32;
            if elapsed >= expiry {
                return None;
            }
            publish.properties.message_expiry_interval = Some(expiry - elapsed);
        }
        Some((publish, self.origin.clone()))
    }
}

pub struct RetainedStore {
    entries: DashMap<String, RetainedEntry>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Store or delete the retained record for `publish.topic`.
    /// An empty payload removes the record.
    pub fn set(&self, publish: &Publish, origin: Arc<str>) {
        let topic = publish.topic.to_string();
        if publish.payload.is_empty() {
            self.entries.remove(&topic);
            return;
        }

        let mut stored = publish.clone();
        stored.retain = true;
        stored.dup = false;
        stored.packet_id = None;
        self.entries.insert(
            topic,
            RetainedEntry {
                publish: stored,
                origin,
                stored_at: Instant::now(),
            },
        );
    }

    /// All live retained records whose topic matches `filter`, with message
    /// expiry decremented by retention time. Expired records found along
    /// the way are removed.
    pub fn matching(&self, filter: &str) -> Vec<(Publish, Arc<str>)> {
        let mut expired = Vec::new();
        let mut out = Vec::new();

        for entry in self.entries.iter() {
            if entry.is_expired() {
                expired.push(entry.key().clone());
                continue;
            }
            if crate::topic::topic_matches_filter(entry.key(), filter) {
                if let Some(live) = entry.to_live() {
                    out.push(live);
                }
            }
        }

        for topic in expired {
            self.entries.remove(&topic);
        }
        out
    }

    /// Drop every record whose message expiry elapsed.
    pub fn sweep_expired(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RetainedStore {
    fn default() -> Self {
        Self::new()
    }
}
