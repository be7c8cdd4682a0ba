//! Topic matching and topic namespace helpers
//!
//! Topics are `/`-delimited segment sequences. Subscription patterns may use
//! `+` (exactly one segment) and `#` (all remaining segments, final segment
//! only). Route patterns used for client-side event routing may contain
//! `:name` captures instead.

use crate::{Error, Result};
use std::collections::HashMap;

/// Single-level wildcard segment
pub const SINGLE_LEVEL: &str = "+";

/// Multi-level wildcard segment
pub const MULTI_LEVEL: &str = "#";

/// Check if a topic matches a subscription pattern
///
/// `#` matches zero or more trailing segments, so `a/b/#` matches `a/b`.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some(MULTI_LEVEL), _) => return true,
            (Some(SINGLE_LEVEL), Some(_)) => continue,
            (Some(part), Some(segment)) => {
                if part != segment {
                    return false;
                }
            }
            (None, None) => return true,
            // Topic exhausted first; a trailing `#` was handled above
            (Some(_), None) => return false,
            (None, Some(_)) => return false,
        }
    }
}

/// Validate a subscription pattern
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::invalid_topic_pattern(pattern));
    }

    let segments: Vec<&str> = pattern.split('/').collect();
    for (idx, segment) in segments.iter().enumerate() {
        let has_wildcard = segment.contains('+') || segment.contains('#');
        if has_wildcard && *segment != SINGLE_LEVEL && *segment != MULTI_LEVEL {
            return Err(Error::invalid_topic_pattern(pattern));
        }
        if *segment == MULTI_LEVEL && idx != segments.len() - 1 {
            return Err(Error::invalid_topic_pattern(pattern));
        }
    }

    Ok(())
}

fn is_name_byte(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

/// Match a parameterized route against a concrete path
///
/// `:name` captures the run of path characters up to the next literal
/// delimiter in the route, a `/`, or the end of the path. A route ending in
/// `/` matches any longer path sharing that prefix. Empty captures never
/// match.
pub fn match_route(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
    let pat = pattern.as_bytes();
    let p = path.as_bytes();
    let mut captures = HashMap::new();
    let (mut i, mut j) = (0usize, 0usize);

    while i < pat.len() {
        if pat[i] == b':' {
            let name_len = pat[i + 1..]
                .iter()
                .position(|&c| !is_name_byte(c))
                .unwrap_or(pat.len() - i - 1);

            if name_len > 0 {
                let name_end = i + 1 + name_len;
                let delimiter = pat.get(name_end).copied();
                let value_len = p[j..]
                    .iter()
                    .position(|&c| c == b'/' || Some(c) == delimiter)
                    .unwrap_or(p.len() - j);

                if value_len == 0 {
                    return None;
                }

                captures.insert(
                    pattern[i + 1..name_end].to_string(),
                    path[j..j + value_len].to_string(),
                );
                i = name_end;
                j += value_len;
                continue;
            }
        }

        if j >= p.len() || p[j] != pat[i] {
            return None;
        }
        i += 1;
        j += 1;
    }

    if j == p.len() || pattern.ends_with('/') {
        Some(captures)
    } else {
        None
    }
}

/// Convert a route into the widest subscription pattern that covers it
///
/// Segments holding a capture become `+`; a trailing `/` becomes `/#`.
pub fn route_to_pattern(route: &str) -> String {
    let trimmed = route.strip_suffix('/');
    let body = trimmed.unwrap_or(route);

    let mut segments: Vec<&str> = body
        .split('/')
        .map(|segment| {
            if segment.contains(':') {
                SINGLE_LEVEL
            } else {
                segment
            }
        })
        .collect();

    if trimmed.is_some() {
        segments.push(MULTI_LEVEL);
    }

    segments.join("/")
}

/// Topic where correlated responses for `topic` are published
pub fn reply_topic(topic: &str) -> String {
    format!("{topic}/reply")
}

/// Topic carrying the notification `name` emitted by the service on `topic`
pub fn event_topic(topic: &str, name: &str) -> String {
    format!("{topic}/event/{name}")
}

/// Topic carrying the one-time capability announcement for `topic`
pub fn announce_topic(topic: &str) -> String {
    event_topic(topic, crate::message::ANNOUNCE_EVENT)
}

/// Split an event topic into `(service topic, event name)`
pub fn split_event_topic(topic: &str) -> Option<(&str, &str)> {
    let (service, name) = topic.rsplit_once("/event/")?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some((service, name))
}

/// Module endpoint: `$node/{serial}/driver/{driver_id}`
pub fn node_driver_topic(serial: &str, driver_id: &str) -> String {
    format!("$node/{serial}/driver/{driver_id}")
}

/// Device announce topic: `$device/{guid}`
pub fn device_topic(guid: &str) -> String {
    format!("$device/{guid}")
}

/// Channel endpoint: `$device/{guid}/channel/{channel_id}/{protocol}`
pub fn channel_topic(guid: &str, channel_id: &str, protocol: &str) -> String {
    format!("$device/{guid}/channel/{channel_id}/{protocol}")
}
