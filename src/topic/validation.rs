//! Topic name and filter validation
//!
//! - Topic names (PUBLISH) must not contain wildcards
//! - `+` must occupy a whole level, `#` must occupy the last level
//! - Topics starting with `$` are not matched by a leading `+` or `#`

/// Validate a topic name (used in PUBLISH)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    check_common(filter)?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" if levels.peek().is_some() => {
                return Err("multi-level wildcard must be last level");
            }
            "#" | "+" => {}
            _ if level.contains('#') => {
                return Err("multi-level wildcard must occupy entire level");
            }
            _ if level.contains('+') => {
                return Err("single-level wildcard must occupy entire level");
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_common(s: &str) -> Result<(), &'static str> {
    if s.is_empty() {
        return Err("topic cannot be empty");
    }
    if s.len() > u16::MAX as usize {
        return Err("topic exceeds maximum length");
    }
    if s.contains('\0') {
        return Err("topic cannot contain null character");
    }
    Ok(())
}

/// Check if a topic filter matches a topic name
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(_) if filter_level == "+" => {}
            Some(level) if level == filter_level => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("test" ; "single level")]
    #[test_case("test/topic" ; "two levels")]
    #[test_case("/test/topic" ; "leading slash")]
    #[test_case("test/topic/" ; "trailing slash")]
    #[test_case("$SYS/uptime" ; "dollar topic")]
    fn test_valid_topic_names(topic: &str) {
        assert!(validate_topic_name(topic).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("test+topic" ; "embedded plus")]
    #[test_case("test/+/topic" ; "plus level")]
    #[test_case("test/#" ; "hash level")]
    #[test_case("a\0b" ; "nul")]
    fn test_invalid_topic_names(topic: &str) {
        assert!(validate_topic_name(topic).is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        for ok in ["test", "+", "#", "test/+", "test/#", "+/+/+", "a/+/c/#", "/"] {
            assert!(validate_topic_filter(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "test+", "test#", "test/#/more", "+test", "a/b#"] {
            assert!(validate_topic_filter(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches_filter("test/topic", "test/topic"));
        assert!(!topic_matches_filter("test", "test/topic"));
        assert!(!topic_matches_filter("test/topic", "test"));

        assert!(topic_matches_filter("a/b/c", "a/+/c"));
        assert!(!topic_matches_filter("a/b/b/c", "a/+/c"));
        assert!(!topic_matches_filter("test", "+/+"));

        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("a/b", "a/#"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(!topic_matches_filter("other/topic", "a/#"));

        assert!(!topic_matches_filter("$SYS/test", "+/test"));
        assert!(!topic_matches_filter("$SYS/test", "#"));
        assert!(topic_matches_filter("$SYS/test", "$SYS/#"));
    }
}
