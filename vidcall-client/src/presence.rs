use std::collections::BTreeSet;

/// Remote endpoints currently announced as reachable by the relay.
///
/// Replaced wholesale on every `user-list`, never patched incrementally. The local identity is
/// never part of the roster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceRoster {
    ids: BTreeSet<String>,
}

impl PresenceRoster {
    pub fn replace(&mut self, ids: impl IntoIterator<Item = String>, local_id: &str) {
        self.ids = ids
            .into_iter()
            .filter(|id| !id.is_empty() && id != local_id)
            .collect();
    }

    pub fn is_reachable(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn excludes_local_identity() {
        let mut roster = PresenceRoster::default();
        roster.replace(ids(&["alice", "bob", "carol"]), "alice");

        assert_eq!(roster.ids().collect::<Vec<_>>(), vec!["bob", "carol"]);
        assert!(!roster.is_reachable("alice"));
        assert!(roster.is_reachable("bob"));
    }

    #[test]
    fn replaces_wholesale() {
        let mut roster = PresenceRoster::default();
        roster.replace(ids(&["bob", "carol"]), "alice");
        roster.replace(ids(&["dave"]), "alice");

        assert_eq!(roster.len(), 1);
        assert!(!roster.is_reachable("bob"));
        assert!(roster.is_reachable("dave"));
    }

    #[test]
    fn duplicates_and_empty_ids_are_dropped() {
        let mut roster = PresenceRoster::default();
        roster.replace(ids(&["bob", "bob", ""]), "alice");

        assert_eq!(roster.len(), 1);
        roster.replace(Vec::new(), "alice");
        assert!(roster.is_empty());
    }
}
