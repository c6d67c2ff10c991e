//! Topic exchange pattern matching.
//!
//! Routing keys and binding patterns are dot-separated words. In a pattern,
//! `*` matches exactly one word and `#` matches zero or more words. The
//! in-memory broker routes with this function, and ladder tests use it to
//! check layer bindings without a broker.

/// Returns whether `routing_key` matches the topic binding `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            matches_words(rest, key) || (!key.is_empty() && matches_words(pattern, &key[1..]))
        },
        Some((word, rest)) => match key.split_first() {
            Some((segment, key_rest)) => {
                (*word == "*" || word == segment) && matches_words(rest, key_rest)
            },
            None => false,
        },
    }
}
