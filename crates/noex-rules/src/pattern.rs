//! Wildcard pattern matching over topics, fact keys, and timer names.
//!
//! Topics use `.` as the segment separator; fact keys and timer names use
//! `:`. Within a pattern, `*` matches exactly one segment and `**` matches
//! any number of segments. A pattern without wildcards is an exact match.

use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;

/// Segment separator for event topics.
pub const TOPIC_SEPARATOR: char = '.';

/// Segment separator for fact keys and timer names.
pub const FACT_SEPARATOR: char = ':';

/// Whether a pattern contains any wildcard segment.
pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains('*')
}

/// Compile a wildcard pattern to an anchored regular expression source.
///
/// `*` compiles to one non-separator segment, `**` to any remainder.
/// Literal segments are escaped, so patterns may contain regex
/// metacharacters safely.
pub fn compile_pattern(pattern: &str, separator: char) -> String {
    let sep = regex::escape(&separator.to_string());
    let mut out = String::from("^");

    for (i, segment) in pattern.split(separator).enumerate() {
        if i > 0 {
            out.push_str(&sep);
        }
        match segment {
            "**" => out.push_str(".*"),
            "*" => {
                out.push_str("[^");
                out.push_str(&sep);
                out.push_str("]+");
            }
            literal => out.push_str(&regex::escape(literal)),
        }
    }

    out.push('$');
    out
}

/// Match a concrete value against a wildcard pattern.
///
/// Exact patterns compare by equality; a trailing `**` is matched by
/// prefix; a trailing `*` by prefix plus a single-segment check. Patterns
/// with interior wildcards fall back to the compiled regex.
pub fn matches_pattern(value: &str, pattern: &str, separator: char) -> bool {
    if !has_wildcard(pattern) {
        return value == pattern;
    }

    if pattern == "**" {
        return true;
    }

    // Fast paths for trailing wildcards, the common index shapes.
    if let Some(prefix) = pattern.strip_suffix("**") {
        if !has_wildcard(prefix) && prefix.ends_with(separator) {
            return value.len() > prefix.len() && value.starts_with(prefix);
        }
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        if !has_wildcard(prefix) && prefix.ends_with(separator) {
            if let Some(rest) = value.strip_prefix(prefix) {
                return !rest.is_empty() && !rest.contains(separator);
            }
            return false;
        }
    }

    match Regex::new(&compile_pattern(pattern, separator)) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

/// Match an event topic against a pattern (`.` separator).
pub fn matches_topic(topic: &str, pattern: &str) -> bool {
    matches_pattern(topic, pattern, TOPIC_SEPARATOR)
}

/// Match a fact key or timer name against a pattern (`:` separator).
pub fn matches_key(key: &str, pattern: &str) -> bool {
    matches_pattern(key, pattern, FACT_SEPARATOR)
}

/// Cache of compiled pattern regexes, keyed by `(pattern, separator)`.
pub struct PatternCache {
    compiled: DashMap<(String, char), Arc<Regex>>,
}

impl Default for PatternCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self {
            compiled: DashMap::new(),
        }
    }

    /// Match a value against a pattern, compiling and caching as needed.
    pub fn matches(&self, value: &str, pattern: &str, separator: char) -> bool {
        if !has_wildcard(pattern) {
            return value == pattern;
        }

        let key = (pattern.to_string(), separator);
        if let Some(re) = self.compiled.get(&key) {
            return re.is_match(value);
        }

        match Regex::new(&compile_pattern(pattern, separator)) {
            Ok(re) => {
                let re = Arc::new(re);
                self.compiled.insert(key, Arc::clone(&re));
                re.is_match(value)
            }
            Err(_) => false,
        }
    }

    /// Number of cached compilations.
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    /// Drop all cached compilations.
    pub fn purge(&self) {
        self.compiled.clear();
    }
}
