//! Subscription trie keyed by filter levels.
//!
//! Each node stores the subscriptions whose filter terminates there, plus a
//! `+` child and the subscriptions attached through a trailing `#`. Lookup
//! cost is O(depth * matches) rather than a scan of every filter.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

use super::Subscription;

#[derive(Debug, Default)]
struct Node {
    /// Subscriptions whose filter ends exactly at this node
    entries: Vec<Subscription>,
    /// Subscriptions whose filter ends with `#` at this level
    hash_entries: Vec<Subscription>,
    children: AHashMap<CompactString, Node>,
    plus: Option<Box<Node>>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.hash_entries.is_empty()
            && self.children.is_empty()
            && self.plus.is_none()
    }
}

/// Trie over match filters (share prefixes already stripped).
#[derive(Debug, Default)]
pub(crate) struct FilterTrie {
    root: Node,
}

/// Entries are keyed by `(client_id, original filter)`; the original filter
/// keeps its `$share/` prefix, so the same match filter subscribed plainly
/// and through a share group are distinct entries.
fn same_entry(a: &Subscription, client_id: &str, filter: &str) -> bool {
    a.client_id.as_ref() == client_id && a.filter.as_ref() == filter
}

impl FilterTrie {
    /// Insert or replace. Returns true when an existing `(client, filter)`
    /// entry was replaced.
    pub fn insert(&mut self, match_filter: &str, sub: Subscription) -> bool {
        let slot = Self::slot_mut(&mut self.root, match_filter);
        let replaced = if let Some(pos) = slot
            .iter()
            .position(|s| same_entry(s, &sub.client_id, &sub.filter))
        {
            slot.remove(pos);
            true
        } else {
            false
        };
        slot.push(sub);
        replaced
    }

    /// Remove the `(client, filter)` entry. Returns true when removed.
    pub fn remove(&mut self, match_filter: &str, client_id: &str, filter: &str) -> bool {
        let levels: SmallVec<[&str; 8]> = match_filter.split('/').collect();
        Self::remove_at(&mut self.root, &levels, client_id, filter).0
    }

    /// Drop every entry belonging to `client_id`.
    pub fn remove_client(&mut self, client_id: &str) {
        Self::remove_client_at(&mut self.root, client_id);
    }

    /// Invoke `visit` for every subscription matching `topic`.
    pub fn matches<F>(&self, topic: &str, mut visit: F)
    where
        F: FnMut(&Subscription),
    {
        let shielded = topic.starts_with('$');
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_at(&self.root, &levels, 0, shielded, &mut visit);
    }

    fn slot_mut<'a>(node: &'a mut Node, match_filter: &str) -> &'a mut Vec<Subscription> {
        let mut node = node;
        let mut levels = match_filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return &mut node.hash_entries;
            }
            node = if level == "+" {
                node.plus.get_or_insert_with(Box::default)
            } else {
                node.children.entry(CompactString::new(level)).or_default()
            };
            if levels.peek().is_none() {
                return &mut node.entries;
            }
        }

        // Reached only by the empty filter, which validation rejects.
        &mut node.entries
    }

    /// Returns (removed, node now empty).
    fn remove_at(node: &mut Node, levels: &[&str], client_id: &str, filter: &str) -> (bool, bool) {
        let Some((level, rest)) = levels.split_first() else {
            return (false, node.is_empty());
        };

        let removed = if *level == "#" {
            retain_entry(&mut node.hash_entries, client_id, filter)
        } else if *level == "+" {
            match node.plus.as_mut() {
                Some(child) => {
                    let removed = if rest.is_empty() {
                        retain_entry(&mut child.entries, client_id, filter)
                    } else {
                        Self::remove_at(child, rest, client_id, filter).0
                    };
                    if child.is_empty() {
                        node.plus = None;
                    }
                    removed
                }
                None => false,
            }
        } else {
            match node.children.get_mut(*level) {
                Some(child) => {
                    let removed = if rest.is_empty() {
                        retain_entry(&mut child.entries, client_id, filter)
                    } else {
                        Self::remove_at(child, rest, client_id, filter).0
                    };
                    if child.is_empty() {
                        node.children.remove(*level);
                    }
                    removed
                }
                None => false,
            }
        };

        (removed, node.is_empty())
    }

    fn remove_client_at(node: &mut Node, client_id: &str) {
        node.entries.retain(|s| s.client_id.as_ref() != client_id);
        node.hash_entries
            .retain(|s| s.client_id.as_ref() != client_id);

        if let Some(child) = node.plus.as_mut() {
            Self::remove_client_at(child, client_id);
            if child.is_empty() {
                node.plus = None;
            }
        }
        node.children.retain(|_, child| {
            Self::remove_client_at(child, client_id);
            !child.is_empty()
        });
    }

    fn matches_at<F>(node: &Node, levels: &[&str], index: usize, shielded: bool, visit: &mut F)
    where
        F: FnMut(&Subscription),
    {
        // A trailing `#` matches zero or more remaining levels, but a
        // root-level wildcard never matches a `$`-topic.
        if !(shielded && index == 0) {
            for sub in &node.hash_entries {
                visit(sub);
            }
        }

        if index >= levels.len() {
            for sub in &node.entries {
                visit(sub);
            }
            return;
        }

        if !(shielded && index == 0) {
            if let Some(child) = &node.plus {
                Self::matches_at(child, levels, index + 1, shielded, visit);
            }
        }
        if let Some(child) = node.children.get(levels[index]) {
            Self::matches_at(child, levels, index + 1, shielded, visit);
        }
    }
}

fn retain_entry(entries: &mut Vec<Subscription>, client_id: &str, filter: &str) -> bool {
    match entries.iter().position(|s| same_entry(s, client_id, filter)) {
        Some(pos) => {
            entries.remove(pos);
            true
        }
        None => false,
    }
}
