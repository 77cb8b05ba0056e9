//! Group membership registry.
//!
//! Two indices kept mutually consistent under one lock: group name → member
//! ids, and peer id → joined group names. A peer is in a group's set iff the
//! group name is in the peer's set. Groups are created lazily on first join
//! and deleted once empty.

use std::collections::{HashMap, HashSet};

use crosswire_core::PeerId;
use parking_lot::Mutex;

#[derive(Default)]
struct Inner {
    groups: HashMap<String, HashSet<PeerId>>,
    by_peer: HashMap<PeerId, HashSet<String>>,
}

/// Bidirectional group ↔ peer mapping.
///
/// Liveness of peer ids is the hub's concern; the registry itself only
/// keeps the two indices consistent.
#[derive(Default)]
pub struct GroupRegistry {
    inner: Mutex<Inner>,
}

impl GroupRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `peer` to `group`. Idempotent; joining twice is a no-op.
    pub fn join(&self, group: &str, peer: &PeerId) {
        let mut inner = self.inner.lock();
        let _ = inner
            .groups
            .entry(group.to_owned())
            .or_default()
            .insert(peer.clone());
        let _ = inner
            .by_peer
            .entry(peer.clone())
            .or_default()
            .insert(group.to_owned());
    }

    /// Remove `peer` from `group`. Idempotent; the group is deleted once it
    /// becomes empty.
    pub fn leave(&self, group: &str, peer: &PeerId) {
        let mut inner = self.inner.lock();
        if let Some(members) = inner.groups.get_mut(group) {
            let _ = members.remove(peer);
            if members.is_empty() {
                let _ = inner.groups.remove(group);
            }
        }
        if let Some(names) = inner.by_peer.get_mut(peer) {
            let _ = names.remove(group);
            if names.is_empty() {
                let _ = inner.by_peer.remove(peer);
            }
        }
    }

    /// De-duplicated union of members across the named groups, in sorted
    /// order. Unknown group names contribute no members.
    #[must_use]
    pub fn members_of<S: AsRef<str>>(&self, groups: &[S]) -> Vec<PeerId> {
        let inner = self.inner.lock();
        let mut members: Vec<PeerId> = groups
            .iter()
            .filter_map(|g| inner.groups.get(g.as_ref()))
            .flatten()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        members.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        members
    }

    /// Groups the peer currently belongs to, in sorted order.
    #[must_use]
    pub fn groups_of(&self, peer: &PeerId) -> Vec<String> {
        let inner = self.inner.lock();
        let mut names: Vec<String> = inner
            .by_peer
            .get(peer)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Remove `peer` from every group it belongs to (teardown path).
    pub fn drop_peer(&self, peer: &PeerId) {
        let mut inner = self.inner.lock();
        let Some(names) = inner.by_peer.remove(peer) else {
            return;
        };
        for name in names {
            if let Some(members) = inner.groups.get_mut(&name) {
                let _ = members.remove(peer);
                if members.is_empty() {
                    let _ = inner.groups.remove(&name);
                }
            }
        }
    }

    /// Whether the group currently exists (has at least one member).
    #[must_use]
    pub fn contains_group(&self, group: &str) -> bool {
        self.inner.lock().groups.contains_key(group)
    }

    /// Number of live (non-empty) groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.inner.lock().groups.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn p(id: &str) -> PeerId {
        PeerId::from(id)
    }

    #[test]
    fn join_creates_group_lazily() {
        let reg = GroupRegistry::new();
        assert!(!reg.contains_group("g"));
        reg.join("g", &p("a"));
        assert!(reg.contains_group("g"));
        assert_eq!(reg.members_of(&["g"]), vec![p("a")]);
        assert_eq!(reg.groups_of(&p("a")), vec!["g".to_owned()]);
    }

    #[test]
    fn join_is_idempotent() {
        let reg = GroupRegistry::new();
        reg.join("g", &p("a"));
        reg.join("g", &p("a"));
        assert_eq!(reg.members_of(&["g"]).len(), 1);
    }

    #[test]
    fn leave_deletes_empty_group() {
        let reg = GroupRegistry::new();
        reg.join("g", &p("a"));
        reg.leave("g", &p("a"));
        assert!(!reg.contains_group("g"));
        assert!(reg.groups_of(&p("a")).is_empty());
    }

    #[test]
    fn leave_is_idempotent() {
        let reg = GroupRegistry::new();
        reg.leave("g", &p("a"));
        reg.join("g", &p("a"));
        reg.leave("g", &p("a"));
        reg.leave("g", &p("a"));
        assert_eq!(reg.group_count(), 0);
    }

    #[test]
    fn leave_keeps_group_with_remaining_members() {
        let reg = GroupRegistry::new();
        reg.join("g", &p("a"));
        reg.join("g", &p("b"));
        reg.leave("g", &p("a"));
        assert!(reg.contains_group("g"));
        assert_eq!(reg.members_of(&["g"]), vec![p("b")]);
    }

    #[test]
    fn members_union_is_order_independent() {
        let reg = GroupRegistry::new();
        reg.join("g", &p("p1"));
        reg.join("g", &p("p2"));
        let members = reg.members_of(&["g"]);
        assert_eq!(members, vec![p("p1"), p("p2")]);

        let reg2 = GroupRegistry::new();
        reg2.join("g", &p("p2"));
        reg2.join("g", &p("p1"));
        assert_eq!(reg2.members_of(&["g"]), members);
    }

    #[test]
    fn members_of_multiple_groups_deduplicates() {
        let reg = GroupRegistry::new();
        reg.join("g1", &p("a"));
        reg.join("g1", &p("b"));
        reg.join("g2", &p("b"));
        reg.join("g2", &p("c"));
        let members = reg.members_of(&["g1", "g2"]);
        assert_eq!(members, vec![p("a"), p("b"), p("c")]);
    }

    #[test]
    fn unknown_groups_contribute_nothing() {
        let reg = GroupRegistry::new();
        reg.join("known", &p("a"));
        let members = reg.members_of(&["known", "unknown"]);
        assert_eq!(members, vec![p("a")]);
        assert!(reg.members_of(&["unknown"]).is_empty());
    }

    #[test]
    fn drop_peer_removes_from_all_groups() {
        let reg = GroupRegistry::new();
        reg.join("g1", &p("a"));
        reg.join("g2", &p("a"));
        reg.join("g2", &p("b"));
        reg.drop_peer(&p("a"));

        assert!(!reg.contains_group("g1"), "g1 became empty");
        assert_eq!(reg.members_of(&["g2"]), vec![p("b")]);
        assert!(reg.groups_of(&p("a")).is_empty());
    }

    #[test]
    fn drop_unknown_peer_is_noop() {
        let reg = GroupRegistry::new();
        reg.join("g", &p("a"));
        reg.drop_peer(&p("ghost"));
        assert_eq!(reg.members_of(&["g"]), vec![p("a")]);
    }

    #[test]
    fn indices_stay_consistent() {
        let reg = GroupRegistry::new();
        reg.join("g1", &p("a"));
        reg.join("g2", &p("a"));
        reg.leave("g1", &p("a"));
        assert_eq!(reg.groups_of(&p("a")), vec!["g2".to_owned()]);
        assert!(reg.members_of(&["g1"]).is_empty());
        assert_eq!(reg.members_of(&["g2"]), vec![p("a")]);
    }
}
