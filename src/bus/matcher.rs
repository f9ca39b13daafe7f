//! Matching strategies deciding whether a subscription pattern matches an
//! emitted event name.

/// Pluggable pattern-vs-event predicate.
pub trait EventMatcher: Send + Sync {
    fn matches(&self, pattern: &str, event: &str) -> bool;
}

/// Exact string equality. The default strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatcher;

impl EventMatcher for ExactMatcher {
    fn matches(&self, pattern: &str, event: &str) -> bool {
        pattern == event
    }
}

/// Dot-separated hierarchical matching.
///
/// Matching rules:
/// - "#" matches all events
/// - Exact match: "orders" matches "orders"
/// - Hierarchical: "orders" matches "orders.created" (prefix match with dot separator)
#[derive(Debug, Clone, Copy, Default)]
pub struct HierarchicalMatcher;

/// Wildcard pattern accepted by [`HierarchicalMatcher`].
pub const MATCH_ALL: &str = "#";

impl EventMatcher for HierarchicalMatcher {
    fn matches(&self, pattern: &str, event: &str) -> bool {
        if pattern == MATCH_ALL || pattern == event {
            return true;
        }
        event.starts_with(pattern) && event[pattern.len()..].starts_with('.')
    }
}
