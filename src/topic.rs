//! Topic filter validation and matching
//!
//! Rules follow the MQTT topic filter grammar:
//! - `/` separates levels
//! - `+` matches exactly one level and must occupy the whole level
//! - `#` matches any remaining levels and must be the last level
//! - `$share/{group}/{filter}` is accepted as a shared subscription
//!
//! Anything else, `*` included, is a literal level.

/// Validate a topic filter used in SUBSCRIBE
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

    let actual_filter = match filter.strip_prefix("$share/") {
        Some(rest) => {
            let (group, actual) = rest
                .split_once('/')
                .ok_or("invalid shared subscription format")?;
            if group.is_empty() {
                return Err("shared subscription group name cannot be empty");
            }
            if group.contains('+') || group.contains('#') {
                return Err("shared subscription group name cannot contain wildcards");
            }
            if actual.is_empty() {
                return Err("shared subscription filter cannot be empty");
            }
            actual
        }
        None => filter,
    };

    let levels: Vec<&str> = actual_filter.split('/').collect();
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

/// Check if a topic name matches a topic filter
///
/// `$`-prefixed topics never match filters starting with a wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(level) if filter_level == "+" || filter_level == level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}
