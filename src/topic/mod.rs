//! Topic matching and subscription management
//!
//! Validation of topic names and filters, the shared match tree holding
//! subscriptions and retained messages, and the mount point rewrite applied
//! to every client-supplied topic.

mod tree;
pub mod validation;

pub use tree::{Deliveries, Delivery, TopicTree};
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::borrow::Cow;

/// Prefix a client topic or filter with the mount point
pub fn apply_mount_point<'a>(mount_point: &str, topic: &'a str) -> Cow<'a, str> {
    if mount_point.is_empty() {
        Cow::Borrowed(topic)
    } else {
        Cow::Owned(format!("{}{}", mount_point, topic))
    }
}

/// Remove the mount point from a routed topic before it goes back to a client
///
/// Topics outside the mount point are returned unchanged.
pub fn strip_mount_point<'a>(mount_point: &str, topic: &'a str) -> &'a str {
    topic.strip_prefix(mount_point).unwrap_or(topic)
}
