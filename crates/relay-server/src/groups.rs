use std::collections::HashSet;

use dashmap::DashMap;

use relay_core::ids::{ConnectionId, ConversationId};

/// A logical broadcast group. Membership is explicit and changes only at the
/// routing engine's enumerated points (register joins, accept joins, transfer
/// adds, disconnect leaves).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum GroupId {
    Conversation(ConversationId),
    Operators,
}

/// Group id → member connection set.
#[derive(Default)]
pub struct Groups {
    members: DashMap<GroupId, HashSet<ConnectionId>>,
}

impl Groups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, group: GroupId, connection: ConnectionId) {
        self.members.entry(group).or_default().insert(connection);
    }

    pub fn leave(&self, group: &GroupId, connection: &ConnectionId) {
        let now_empty = match self.members.get_mut(group) {
            Some(mut set) => {
                set.remove(connection);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.members.remove_if(group, |_, set| set.is_empty());
        }
    }

    /// Remove a connection from every group it belongs to, dropping groups
    /// that end up empty.
    pub fn leave_all(&self, connection: &ConnectionId) {
        self.members.retain(|_, set| {
            set.remove(connection);
            !set.is_empty()
        });
    }

    /// Drop a group and its membership entirely.
    pub fn remove(&self, group: &GroupId) {
        self.members.remove(group);
    }

    pub fn members(&self, group: &GroupId) -> Vec<ConnectionId> {
        self.members
            .get(group)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, group: &GroupId, connection: &ConnectionId) -> bool {
        self.members
            .get(group)
            .map(|set| set.contains(connection))
            .unwrap_or(false)
    }

    pub fn member_count(&self, group: &GroupId) -> usize {
        self.members.get(group).map(|set| set.len()).unwrap_or(0)
    }

    /// Number of groups currently tracked.
    pub fn group_count(&self) -> usize {
        self.members.len()
    }

    /// Deduplicated union of several groups' members.
    pub fn union(&self, groups: &[GroupId]) -> HashSet<ConnectionId> {
        let mut result = HashSet::new();
        for group in groups {
            if let Some(set) = self.members.get(group) {
                result.extend(set.iter().cloned());
            }
        }
        result
    }
}
