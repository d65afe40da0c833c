//! Topics and subscription filters.
//!
//! A topic is a slash-separated routing key. A filter entry matches a topic
//! iff its components are a prefix of the topic's components: `/x` matches
//! `/x/y` but not `/xy`.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Path separator between topic components.
pub const SEPARATOR: char = '/';

/// Suffix of the reserved topic masters listen on.
const MASTER_SUFFIX: &str = "/data/master";

/// Suffix of the reserved topic clones listen on.
const CLONE_SUFFIX: &str = "/data/clone";

/// A slash-separated routing key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates the non-empty path components.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR).filter(|c| !c.is_empty())
    }

    /// Component-wise prefix test: `self` is a routing prefix of `topic`.
    pub fn is_prefix_of(&self, topic: &Topic) -> bool {
        let mut mine = self.components();
        let mut theirs = topic.components();
        loop {
            match (mine.next(), theirs.next()) {
                (None, _) => return true,
                (Some(_), None) => return false,
                (Some(a), Some(b)) if a == b => {}
                _ => return false,
            }
        }
    }

    /// The reserved topic on which the master of `store` receives commands.
    pub fn store_master(store: &str) -> Topic {
        Topic(format!("{store}{MASTER_SUFFIX}"))
    }

    /// The reserved topic on which clones of `store` receive the command
    /// stream.
    pub fn store_clone(store: &str) -> Topic {
        Topic(format!("{store}{CLONE_SUFFIX}"))
    }

    /// Returns the store name if this is a reserved store topic.
    pub fn store_name(&self) -> Option<&str> {
        self.master_store_name().or_else(|| self.clone_store_name())
    }

    /// Returns the store name if this is a reserved master topic.
    pub fn master_store_name(&self) -> Option<&str> {
        self.0.strip_suffix(MASTER_SUFFIX)
    }

    /// Returns the store name if this is a reserved clone topic.
    pub fn clone_store_name(&self) -> Option<&str> {
        self.0.strip_suffix(CLONE_SUFFIX)
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Topic(s.to_string())
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Topic(s)
    }
}

/// A set of topic prefixes expressing interest.
pub type Filter = Vec<Topic>;

/// True if any entry of `filter` is a prefix of `topic`.
pub fn filter_matches(filter: &[Topic], topic: &Topic) -> bool {
    filter.iter().any(|f| f.is_prefix_of(topic))
}

/// Extends `filter` with `more`, dropping duplicates and keeping the result
/// sorted so two filters compare structurally.
pub fn filter_extend(filter: &mut Filter, more: impl IntoIterator<Item = Topic>) {
    filter.extend(more);
    filter.sort();
    filter.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matches_whole_components_only() {
        let filter = Topic::from("/x");
        assert!(filter.is_prefix_of(&Topic::from("/x/y")));
        assert!(filter.is_prefix_of(&Topic::from("/x")));
        assert!(!filter.is_prefix_of(&Topic::from("/xy")));
        assert!(!filter.is_prefix_of(&Topic::from("/")));
    }

    #[test]
    fn empty_filter_entry_matches_everything() {
        let root = Topic::from("/");
        assert!(root.is_prefix_of(&Topic::from("/a/b/c")));
        assert!(root.is_prefix_of(&Topic::from("x")));
    }

    #[test]
    fn longer_filter_does_not_match_shorter_topic() {
        let filter = Topic::from("/a/b/c");
        assert!(!filter.is_prefix_of(&Topic::from("/a/b")));
    }

    #[test]
    fn separator_placement_is_irrelevant() {
        // "a/b" and "/a/b/" have the same components.
        assert!(Topic::from("a/b").is_prefix_of(&Topic::from("/a/b/")));
        assert!(Topic::from("/a/b/").is_prefix_of(&Topic::from("a/b/c")));
    }

    #[test]
    fn store_topics_round_trip() {
        let master = Topic::store_master("prefs");
        let clone = Topic::store_clone("prefs");
        assert_eq!(master.as_str(), "prefs/data/master");
        assert_eq!(clone.as_str(), "prefs/data/clone");
        assert_eq!(master.store_name(), Some("prefs"));
        assert_eq!(clone.store_name(), Some("prefs"));
        assert_eq!(Topic::from("prefs/data").store_name(), None);
    }

    #[test]
    fn filter_helpers() {
        let mut filter = vec![Topic::from("/b")];
        filter_extend(&mut filter, [Topic::from("/a"), Topic::from("/b")]);
        assert_eq!(filter, vec![Topic::from("/a"), Topic::from("/b")]);

        assert!(filter_matches(&filter, &Topic::from("/a/1")));
        assert!(!filter_matches(&filter, &Topic::from("/c")));
    }
}
