//! ACL (Access Control List) rules
//!
//! Topic-based authorization with support for:
//! - MQTT wildcards (# and +)
//! - Variable substitution (%c = client_id, %u = username)
//! - Role-based permissions, falling back to default permissions
//!
//! `Read` checks use the subscribe patterns and apply both to SUBSCRIBE
//! filters and to messages about to be delivered; `Write` checks use the
//! publish patterns.

use std::collections::HashMap;

use crate::config::AclConfig;

#[cfg(test)]
mod tests;

/// Direction of a topic access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclAction {
    /// Subscribe to a filter or receive a message
    Read,
    /// Publish to a topic
    Write,
}

/// Compiled ACL rules
#[derive(Debug, Clone, Default)]
pub struct AclRules {
    /// Whether ACL is enforced
    enabled: bool,
    /// Role definitions (name -> role)
    roles: HashMap<String, RolePatterns>,
    /// Permissions for users without explicit role (including anonymous)
    default: RolePatterns,
}

#[derive(Debug, Clone, Default)]
struct RolePatterns {
    publish: Vec<String>,
    subscribe: Vec<String>,
}

impl RolePatterns {
    fn for_action(&self, action: AclAction) -> &[String] {
        match action {
            AclAction::Read => &self.subscribe,
            AclAction::Write => &self.publish,
        }
    }
}

impl AclRules {
    pub fn new(config: &AclConfig) -> Self {
        let roles = config
            .roles
            .iter()
            .map(|role| {
                (
                    role.name.clone(),
                    RolePatterns {
                        publish: role.publish.clone(),
                        subscribe: role.subscribe.clone(),
                    },
                )
            })
            .collect();

        Self {
            enabled: config.enabled,
            roles,
            default: RolePatterns {
                publish: config.default.publish.clone(),
                subscribe: config.default.subscribe.clone(),
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `client_id` (with `username` holding `role`) may access `topic`
    pub fn allows(
        &self,
        client_id: &str,
        username: Option<&str>,
        role: Option<&str>,
        topic: &str,
        action: AclAction,
    ) -> bool {
        if !self.enabled {
            return true;
        }

        let role_patterns = role.and_then(|r| self.roles.get(r));
        role_patterns
            .into_iter()
            .chain(std::iter::once(&self.default))
            .any(|patterns| {
                patterns
                    .for_action(action)
                    .iter()
                    .any(|p| matches_pattern(p, topic, client_id, username))
            })
    }
}

/// Check if topic matches pattern with variable substitution
fn matches_pattern(pattern: &str, topic: &str, client_id: &str, username: Option<&str>) -> bool {
    if !pattern.contains('%') {
        return pattern_match(pattern, topic);
    }
    let pattern = pattern
        .replace("%c", client_id)
        .replace("%u", username.unwrap_or(""));
    pattern_match(&pattern, topic)
}

/// MQTT pattern matching with wildcards
///
/// Unlike delivery matching, `$` topics get no special treatment: an ACL
/// pattern of `#` grants everything.
fn pattern_match(pattern: &str, topic: &str) -> bool {
    let mut topic_parts = topic.split('/');
    for p in pattern.split('/') {
        if p == "#" {
            return true;
        }
        match topic_parts.next() {
            Some(_) if p == "+" => {}
            Some(t) if t == p => {}
            _ => return false,
        }
    }
    topic_parts.next().is_none()
}
