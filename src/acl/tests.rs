//! ACL rule tests

use super::*;
use crate::config::{AclPermissions, AclRole};

fn make_test_acl_config() -> AclConfig {
    AclConfig {
        enabled: true,
        roles: vec![
            AclRole {
                name: "admin".to_string(),
                publish: vec!["#".to_string()],
                subscribe: vec!["#".to_string()],
            },
            AclRole {
                name: "device".to_string(),
                publish: vec!["sensors/%c/#".to_string()],
                subscribe: vec!["commands/%c/#".to_string()],
            },
            AclRole {
                name: "reader".to_string(),
                publish: vec![],
                subscribe: vec!["sensors/#".to_string(), "users/%u/inbox".to_string()],
            },
        ],
        default: AclPermissions {
            publish: vec![],
            subscribe: vec!["public/+".to_string()],
        },
    }
}

#[test]
fn test_disabled_allows_all() {
    let rules = AclRules::new(&AclConfig::default());
    assert!(!rules.is_enabled());
    assert!(rules.allows("c", None, None, "any/topic", AclAction::Write));
}

#[test]
fn test_admin_can_publish_anywhere() {
    let rules = AclRules::new(&make_test_acl_config());
    assert!(rules.allows("c", Some("root"), Some("admin"), "any/topic/here", AclAction::Write));
    assert!(rules.allows("c", Some("root"), Some("admin"), "$SYS/x", AclAction::Read));
}

#[test]
fn test_device_limited_to_own_topics() {
    let rules = AclRules::new(&make_test_acl_config());
    let role = Some("device");
    assert!(rules.allows("s1", None, role, "sensors/s1/temp", AclAction::Write));
    assert!(!rules.allows("s1", None, role, "sensors/s2/temp", AclAction::Write));
    assert!(rules.allows("s1", None, role, "commands/s1/reboot", AclAction::Read));
    assert!(!rules.allows("s1", None, role, "sensors/s1/temp", AclAction::Read));
}

#[test]
fn test_username_substitution() {
    let rules = AclRules::new(&make_test_acl_config());
    let role = Some("reader");
    assert!(rules.allows("c", Some("bob"), role, "users/bob/inbox", AclAction::Read));
    assert!(!rules.allows("c", Some("bob"), role, "users/alice/inbox", AclAction::Read));
    // Anonymous readers never match a %u pattern for a real user
    assert!(!rules.allows("c", None, role, "users/bob/inbox", AclAction::Read));
}

#[test]
fn test_default_permissions_apply_to_everyone() {
    let rules = AclRules::new(&make_test_acl_config());
    assert!(rules.allows("c", None, None, "public/news", AclAction::Read));
    assert!(rules.allows("c", Some("x"), Some("device"), "public/news", AclAction::Read));
    assert!(!rules.allows("c", None, None, "public/news", AclAction::Write));
}

#[test]
fn test_unknown_role_uses_defaults() {
    let rules = AclRules::new(&make_test_acl_config());
    assert!(!rules.allows("c", None, Some("ghost"), "sensors/a", AclAction::Read));
    assert!(rules.allows("c", None, Some("ghost"), "public/a", AclAction::Read));
}

#[test]
fn test_pattern_matching() {
    assert!(pattern_match("foo/bar", "foo/bar"));
    assert!(!pattern_match("foo/bar", "foo/baz"));
    assert!(pattern_match("foo/+/bar", "foo/xxx/bar"));
    assert!(!pattern_match("foo/+", "foo/bar/baz"));
    assert!(pattern_match("foo/#", "foo"));
    assert!(pattern_match("foo/#", "foo/bar/baz"));
    assert!(pattern_match("#", "foo/bar/baz"));
    // Subscription filters are matched level by level
    assert!(pattern_match("sensors/#", "sensors/+/temp"));
    assert!(!pattern_match("sensors/a", "sensors/+"));
}
