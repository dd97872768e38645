//! Topic match tree
//!
//! One node per topic level. Subscription filters and retained topic names
//! share the same tree: a filter's `+` and `#` levels are stored as
//! ordinary children named "+" and "#", which topic names can never use.
//! Nodes that carry no subscribers, no retained message and no children are
//! pruned as soon as the last of those goes away.

use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::message::Message;
use crate::protocol::QoS;

/// One subscriber that should receive a published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub client_id: Arc<str>,
    /// QoS to deliver with
    pub qos: QoS,
}

pub type Deliveries = SmallVec<[Delivery; 16]>;

#[derive(Debug, Default)]
struct Node {
    children: AHashMap<CompactString, Node>,
    subscribers: AHashMap<Arc<str>, QoS>,
    retained: Option<Message>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subscribers.is_empty() && self.retained.is_none()
    }

    fn child_mut(&mut self, path: &[&str]) -> &mut Node {
        let mut node = self;
        for level in path {
            node = node.children.entry(CompactString::new(level)).or_default();
        }
        node
    }

    /// Apply `f` to the node at `path`, then prune every emptied node on the way back
    fn update_and_prune<R>(&mut self, path: &[&str], f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        let Some((first, rest)) = path.split_first() else {
            return Some(f(self));
        };
        let child = self.children.get_mut(*first)?;
        let result = child.update_and_prune(rest, f);
        if child.is_empty() {
            self.children.remove(*first);
        }
        result
    }

    fn remove_client(&mut self, client_id: &str) -> usize {
        let mut removed = usize::from(self.subscribers.remove(client_id).is_some());
        self.children.retain(|_, child| {
            removed += child.remove_client(client_id);
            !child.is_empty()
        });
        removed
    }

    fn collect_subscribers(
        &self,
        levels: &[&str],
        depth: usize,
        system_topic: bool,
        out: &mut AHashMap<Arc<str>, QoS>,
    ) {
        let wildcards_allowed = !(system_topic && depth == 0);

        // "a/#" also matches "a"
        if wildcards_allowed {
            if let Some(hash) = self.children.get("#") {
                merge_max(out, &hash.subscribers);
            }
        }

        let Some((level, rest)) = levels.split_first() else {
            merge_max(out, &self.subscribers);
            return;
        };

        if wildcards_allowed {
            if let Some(plus) = self.children.get("+") {
                plus.collect_subscribers(rest, depth + 1, system_topic, out);
            }
        }
        if let Some(child) = self.children.get(*level) {
            child.collect_subscribers(rest, depth + 1, system_topic, out);
        }
    }

    fn collect_retained(&self, levels: &[&str], depth: usize, out: &mut Vec<Message>) {
        let Some((level, rest)) = levels.split_first() else {
            out.extend(self.retained.iter().cloned());
            return;
        };

        match *level {
            "#" => self.collect_all_retained(depth, out),
            "+" => {
                for (name, child) in &self.children {
                    if is_wildcard(name) || (depth == 0 && name.starts_with('$')) {
                        continue;
                    }
                    child.collect_retained(rest, depth + 1, out);
                }
            }
            literal => {
                if let Some(child) = self.children.get(literal) {
                    child.collect_retained(rest, depth + 1, out);
                }
            }
        }
    }

    fn collect_all_retained(&self, depth: usize, out: &mut Vec<Message>) {
        out.extend(self.retained.iter().cloned());
        for (name, child) in &self.children {
            if is_wildcard(name) || (depth == 0 && name.starts_with('$')) {
                continue;
            }
            child.collect_all_retained(depth + 1, out);
        }
    }

    fn collect_subscriptions(
        &self,
        client_id: &str,
        path: &mut Vec<CompactString>,
        out: &mut Vec<(String, QoS)>,
    ) {
        if let Some(qos) = self.subscribers.get(client_id) {
            out.push((path.join("/"), *qos));
        }
        for (name, child) in &self.children {
            path.push(name.clone());
            child.collect_subscriptions(client_id, path, out);
            path.pop();
        }
    }

    fn count(&self) -> (usize, usize) {
        self.children
            .values()
            .map(Node::count)
            .fold((1, self.subscribers.len()), |(n, s), (cn, cs)| {
                (n + cn, s + cs)
            })
    }
}

fn is_wildcard(level: &str) -> bool {
    level == "+" || level == "#"
}

fn merge_max(out: &mut AHashMap<Arc<str>, QoS>, subscribers: &AHashMap<Arc<str>, QoS>) {
    for (client_id, qos) in subscribers {
        out.entry(client_id.clone())
            .and_modify(|q| *q = (*q).max(*qos))
            .or_insert(*qos);
    }
}

fn split(topic: &str) -> SmallVec<[&str; 8]> {
    topic.split('/').collect()
}

/// Thread-safe topic match tree
///
/// Every operation holds the tree mutex for the duration of one map walk
/// and never performs I/O while holding it.
#[derive(Debug)]
pub struct TopicTree {
    root: Mutex<Node>,
    upgrade_outgoing_qos: bool,
}

impl TopicTree {
    pub fn new(upgrade_outgoing_qos: bool) -> Self {
        Self {
            root: Mutex::new(Node::default()),
            upgrade_outgoing_qos,
        }
    }

    /// Add or replace the subscription of `client_id` on `filter`
    ///
    /// Returns true when the client was not yet subscribed to this filter.
    pub fn subscribe(&self, client_id: &Arc<str>, filter: &str, qos: QoS) -> bool {
        let levels = split(filter);
        let mut root = self.root.lock();
        root.child_mut(&levels)
            .subscribers
            .insert(client_id.clone(), qos)
            .is_none()
    }

    /// Remove the subscription of `client_id` on `filter`; a missing path is a no-op
    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        let levels = split(filter);
        let mut root = self.root.lock();
        root.update_and_prune(&levels, |node| node.subscribers.remove(client_id).is_some())
            .unwrap_or(false)
    }

    /// Remove every subscription held by `client_id`, returning how many were removed
    pub fn unsubscribe_all(&self, client_id: &str) -> usize {
        self.root.lock().remove_client(client_id)
    }

    /// Route a message, returning the subscribers it must be delivered to
    ///
    /// When the message carries the retain flag, the retained copy at the
    /// topic node is replaced, or cleared when the payload is empty.
    pub fn publish(&self, message: &Message) -> Deliveries {
        let levels = split(&message.topic);
        let system_topic = message.topic.starts_with('$');
        let mut matched = AHashMap::new();

        {
            let mut root = self.root.lock();
            if message.retain {
                if message.payload.is_empty() {
                    root.update_and_prune(&levels, |node| node.retained = None);
                } else {
                    let mut retained = message.clone();
                    retained.dup = false;
                    retained.packet_id = None;
                    root.child_mut(&levels).retained = Some(retained);
                }
            }
            root.collect_subscribers(&levels, 0, system_topic, &mut matched);
        }

        matched
            .into_iter()
            .map(|(client_id, sub_qos)| Delivery {
                client_id,
                qos: if self.upgrade_outgoing_qos {
                    sub_qos
                } else {
                    sub_qos.min(message.qos)
                },
            })
            .collect()
    }

    /// Store or clear a retained message without routing it
    pub fn set_retained(&self, message: Message) {
        let topic = message.topic.clone();
        let levels = split(&topic);
        let mut root = self.root.lock();
        if message.payload.is_empty() {
            root.update_and_prune(&levels, |node| node.retained = None);
        } else {
            root.child_mut(&levels).retained = Some(message);
        }
    }

    /// Retained messages whose topic matches `filter`
    pub fn retained_for(&self, filter: &str) -> Vec<Message> {
        let levels = split(filter);
        let mut out = Vec::new();
        self.root.lock().collect_retained(&levels, 0, &mut out);
        out
    }

    /// All filters `client_id` is subscribed to, with their QoS
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<(String, QoS)> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        let root = self.root.lock();
        for (name, child) in &root.children {
            path.push(name.clone());
            child.collect_subscriptions(client_id, &mut path, &mut out);
            path.pop();
        }
        out
    }

    /// Number of nodes below the root
    pub fn node_count(&self) -> usize {
        self.root.lock().count().0 - 1
    }

    /// Total number of (client, filter) subscription entries
    pub fn subscription_count(&self) -> usize {
        self.root.lock().count().1
    }

    pub fn is_empty(&self) -> bool {
        self.root.lock().is_empty()
    }
}

impl Default for TopicTree {
    fn default() -> Self {
        Self::new(false)
    }
}
