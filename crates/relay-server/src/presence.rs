use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use relay_core::ids::{ConnectionId, ConversationId, OperatorId, VisitorId};
use relay_core::{OnlineOperator, OperatorProfile, OperatorStatus};

use crate::routing::Inbound;

/// Presence record for a connected operator.
#[derive(Clone, Debug)]
pub struct OperatorPresence {
    pub profile: OperatorProfile,
    pub status: OperatorStatus,
    pub connection: ConnectionId,
    pub assigned: HashSet<ConversationId>,
}

/// Tracks who is online right now, operator workload, and the visitor grace
/// timers that debounce transient disconnects.
pub struct PresenceTracker {
    operators: DashMap<OperatorId, OperatorPresence>,
    visitors: DashMap<VisitorId, ConnectionId>,
    grace_timers: DashMap<VisitorId, JoinHandle<()>>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            operators: DashMap::new(),
            visitors: DashMap::new(),
            grace_timers: DashMap::new(),
        }
    }

    /// Mark an operator online. On reconnect the assignment set carries over
    /// so an operator who dropped mid-conversation picks their chats back up.
    /// Returns the previous presence, if any.
    pub fn operator_online(
        &self,
        profile: OperatorProfile,
        connection: ConnectionId,
    ) -> Option<OperatorPresence> {
        let id = profile.id.clone();
        let mut previous = None;
        self.operators
            .entry(id)
            .and_modify(|presence| {
                previous = Some(presence.clone());
                presence.profile = profile.clone();
                presence.connection = connection.clone();
                presence.status = OperatorStatus::Available;
            })
            .or_insert_with(|| OperatorPresence {
                profile,
                status: OperatorStatus::Available,
                connection,
                assigned: HashSet::new(),
            });
        previous
    }

    /// Remove an operator, but only if the given connection is still theirs.
    /// Returns the removed presence.
    pub fn operator_offline(
        &self,
        id: &OperatorId,
        connection: &ConnectionId,
    ) -> Option<OperatorPresence> {
        self.operators
            .remove_if(id, |_, presence| presence.connection == *connection)
            .map(|(_, presence)| presence)
    }

    pub fn is_operator_online(&self, id: &OperatorId) -> bool {
        self.operators.contains_key(id)
    }

    pub fn operator(&self, id: &OperatorId) -> Option<OperatorPresence> {
        self.operators.get(id).map(|p| p.clone())
    }

    pub fn operator_connection(&self, id: &OperatorId) -> Option<ConnectionId> {
        self.operators.get(id).map(|p| p.connection.clone())
    }

    pub fn set_status(&self, id: &OperatorId, status: OperatorStatus) -> bool {
        match self.operators.get_mut(id) {
            Some(mut presence) => {
                presence.status = status;
                true
            }
            None => false,
        }
    }

    pub fn assign(&self, id: &OperatorId, conversation: ConversationId) {
        if let Some(mut presence) = self.operators.get_mut(id) {
            presence.assigned.insert(conversation);
        }
    }

    pub fn unassign(&self, id: &OperatorId, conversation: &ConversationId) {
        if let Some(mut presence) = self.operators.get_mut(id) {
            presence.assigned.remove(conversation);
        }
    }

    pub fn assigned_count(&self, id: &OperatorId) -> usize {
        self.operators.get(id).map(|p| p.assigned.len()).unwrap_or(0)
    }

    pub fn assigned(&self, id: &OperatorId) -> Vec<ConversationId> {
        self.operators
            .get(id)
            .map(|p| p.assigned.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn online_operators(&self) -> Vec<OnlineOperator> {
        self.operators
            .iter()
            .map(|entry| OnlineOperator {
                id: entry.key().clone(),
                name: entry.value().profile.name.clone(),
                status: entry.value().status,
            })
            .collect()
    }

    /// Mark a visitor online on the given connection, cancelling any pending
    /// grace timer.
    pub fn visitor_online(&self, visitor: VisitorId, connection: ConnectionId) {
        self.cancel_grace(&visitor);
        self.visitors.insert(visitor, connection);
    }

    /// Remove a visitor's presence, but only if the given connection is still
    /// the one on record. A stale disconnect after a reconnect is a no-op.
    pub fn visitor_offline_if(&self, visitor: &VisitorId, connection: &ConnectionId) -> bool {
        self.visitors
            .remove_if(visitor, |_, current| current == connection)
            .is_some()
    }

    pub fn visitor_connection(&self, visitor: &VisitorId) -> Option<ConnectionId> {
        self.visitors.get(visitor).map(|c| c.clone())
    }

    /// Start (or restart) the grace countdown for a disconnected visitor.
    /// When it elapses a `GraceExpired` is posted to the routing loop, which
    /// re-checks presence before telling anyone the visitor left.
    pub fn schedule_grace(
        &self,
        visitor: VisitorId,
        delay: Duration,
        inbound_tx: mpsc::Sender<Inbound>,
    ) {
        let timer_visitor = visitor.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbound_tx
                .send(Inbound::GraceExpired {
                    visitor: timer_visitor,
                })
                .await;
        });
        if let Some(old) = self.grace_timers.insert(visitor, handle) {
            old.abort();
        }
    }

    /// Cancel a pending grace timer. Returns true if one was armed.
    pub fn cancel_grace(&self, visitor: &VisitorId) -> bool {
        match self.grace_timers.remove(visitor) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Consume the grace timer entry on expiry. Returns false when the timer
    /// was cancelled in the window between firing and being handled.
    pub fn claim_grace(&self, visitor: &VisitorId) -> bool {
        self.grace_timers.remove(visitor).is_some()
    }

    /// (online operators, online visitors).
    pub fn counts(&self) -> (usize, usize) {
        (self.operators.len(), self.visitors.len())
    }
}
