//! Topic name and filter validation.
//!
//! Topic names carry no wildcards. Filters split on `/`: a `+` level matches
//! any single level, a trailing `#` level matches the rest. Topics starting
//! with `$` are shielded from filters whose first level is a wildcard.
//! `$share/{group}/{rest}` is a shared subscription; the prefix is stripped
//! before matching.

/// Validate a topic name as used in PUBLISH and retained storage.
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }
    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Split a shared subscription filter into `(group, rest)`.
///
/// Returns `Ok(None)` for ordinary filters and an error when the `$share/`
/// form is malformed (empty group, wildcard in group, empty rest).
pub fn parse_shared_filter(filter: &str) -> Result<Option<(&str, &str)>, &'static str> {
    let Some(tail) = filter.strip_prefix("$share/") else {
        return Ok(None);
    };

    let Some(slash) = tail.find('/') else {
        return Err("shared subscription missing topic filter");
    };
    let group = &tail[..slash];
    let rest = &tail[slash + 1..];

    if group.is_empty() {
        return Err("shared subscription group cannot be empty");
    }
    if group.contains('+') || group.contains('#') {
        return Err("shared subscription group cannot contain wildcards");
    }
    if rest.is_empty() {
        return Err("shared subscription filter cannot be empty");
    }

    Ok(Some((group, rest)))
}

/// Validate a topic filter as used in SUBSCRIBE and UNSUBSCRIBE, including
/// the `$share/{group}/{rest}` form.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }
    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }
    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let match_filter = match parse_shared_filter(filter)? {
        Some((_, rest)) => rest,
        None => filter,
    };

    let levels: Vec<&str> = match_filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if i != levels.len() - 1 {
                return Err("multi-level wildcard must be last level");
            }
        }
        if level.contains('+') && *level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Test a topic name against a (non-shared) topic filter.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    // `$`-topics never match filters whose first level is a wildcard.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some(f), Some(t)) if f == "+" || f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_name_rules() {
        assert!(validate_topic_name("sensor").is_ok());
        assert!(validate_topic_name("sensor/1/temp").is_ok());
        assert!(validate_topic_name("/leading").is_ok());
        assert!(validate_topic_name("trailing/").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a+b").is_err());
        assert!(validate_topic_name("a/#").is_err());
        assert!(validate_topic_name("nul\0byte").is_err());
    }

    #[test]
    fn topic_filter_rules() {
        assert!(validate_topic_filter("sensor/+/temp").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("sensor/#").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("sensor#").is_err());
        assert!(validate_topic_filter("sensor/#/more").is_err());
        assert!(validate_topic_filter("se+nsor").is_err());
    }

    #[test]
    fn shared_filter_parsing() {
        assert_eq!(
            parse_shared_filter("$share/g/t/+").unwrap(),
            Some(("g", "t/+"))
        );
        assert_eq!(parse_shared_filter("t/+").unwrap(), None);

        assert!(parse_shared_filter("$share//t").is_err());
        assert!(parse_shared_filter("$share/g").is_err());
        assert!(parse_shared_filter("$share/g/").is_err());
        assert!(validate_topic_filter("$share/g+/t").is_err());
    }

    #[test]
    fn matching() {
        assert!(topic_matches_filter("a/b", "a/b"));
        assert!(topic_matches_filter("a/b", "a/+"));
        assert!(topic_matches_filter("a/b", "+/+"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("a/b/c", "#"));

        assert!(!topic_matches_filter("a/b", "a"));
        assert!(!topic_matches_filter("a", "a/b"));
        assert!(!topic_matches_filter("a/b/c", "a/+"));

        assert!(!topic_matches_filter("$SYS/x", "#"));
        assert!(!topic_matches_filter("$SYS/x", "+/x"));
        assert!(topic_matches_filter("$SYS/x", "$SYS/+"));
    }
}
