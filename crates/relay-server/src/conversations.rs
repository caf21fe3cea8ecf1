use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use relay_core::ids::{ConversationId, MessageId, VisitorId};
use relay_core::{
    Conversation, ConversationSnapshot, ConversationStatus, DeliveryStatus, Message,
    OperatorProfile, Role, RoutingError, VisitorProfile,
};

/// Lifecycle transition applied through `transition`. Actor authorization is
/// checked by the routing engine before the transition is attempted.
#[derive(Clone, Debug)]
pub enum TransitionEvent {
    Accept { operator: OperatorProfile },
    Close { reason: Option<String> },
    Transfer { to: OperatorProfile },
}

/// Result of a successful transition.
#[derive(Debug)]
pub struct TransitionOutcome {
    pub conversation: Conversation,
    pub previous_operator: Option<OperatorProfile>,
}

/// In-memory authoritative conversation table, plus the open-conversation
/// index that enforces at most one non-closed conversation per visitor.
///
/// Lock order: the visitor index entry is always taken before any
/// conversation entry; paths holding a conversation guard release it before
/// touching the index.
pub struct ConversationStore {
    conversations: DashMap<ConversationId, Conversation>,
    open_by_visitor: DashMap<VisitorId, ConversationId>,
    preview_chars: usize,
}

impl ConversationStore {
    pub fn new(preview_chars: usize) -> Self {
        Self {
            conversations: DashMap::new(),
            open_by_visitor: DashMap::new(),
            preview_chars,
        }
    }

    /// Populate from the durable mirror at startup.
    pub fn seed(&self, conversations: Vec<Conversation>) {
        for mut conversation in conversations {
            if let Some(last) = conversation.messages.last() {
                conversation.last_message = Some(relay_core::LastMessageSummary {
                    preview: last.preview(self.preview_chars),
                    sender: last.sender.role,
                    timestamp: last.created_at,
                });
            }
            if !conversation.is_closed() {
                self.open_by_visitor
                    .insert(conversation.visitor.id.clone(), conversation.id.clone());
            }
            self.conversations.insert(conversation.id.clone(), conversation);
        }
    }

    /// Return the visitor's open conversation, creating a fresh pending one
    /// if none exists. Name/metadata amendments are applied on reuse; the
    /// returned bool is true when a conversation was created.
    pub fn get_or_create_for_visitor(&self, visitor: VisitorProfile) -> (Conversation, bool) {
        loop {
            match self.open_by_visitor.entry(visitor.id.clone()) {
                Entry::Occupied(occupied) => {
                    let conversation_id = occupied.get().clone();
                    if let Some(mut conversation) = self.conversations.get_mut(&conversation_id) {
                        if conversation.is_closed() {
                            // Stale index entry; closed is terminal, start over.
                            drop(conversation);
                            occupied.remove();
                            continue;
                        }
                        if visitor.name != "Visitor" {
                            conversation.visitor.name = visitor.name.clone();
                        }
                        if let Some(metadata) = visitor.metadata.clone() {
                            conversation.visitor.metadata = Some(metadata);
                        }
                        return (conversation.clone(), false);
                    }
                    occupied.remove();
                    continue;
                }
                Entry::Vacant(vacant) => {
                    let conversation = Conversation::new(visitor);
                    vacant.insert(conversation.id.clone());
                    self.conversations
                        .insert(conversation.id.clone(), conversation.clone());
                    return (conversation, true);
                }
            }
        }
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.conversations.contains_key(id)
    }

    /// Run a closure under the conversation's entry guard. This is the
    /// per-key serialization point for every mutation.
    pub fn with_mut<T>(
        &self,
        id: &ConversationId,
        f: impl FnOnce(&mut Conversation) -> Result<T, RoutingError>,
    ) -> Result<T, RoutingError> {
        match self.conversations.get_mut(id) {
            Some(mut conversation) => f(&mut conversation),
            None => Err(RoutingError::ConversationNotFound),
        }
    }

    pub fn with_read<T>(
        &self,
        id: &ConversationId,
        f: impl FnOnce(&Conversation) -> Result<T, RoutingError>,
    ) -> Result<T, RoutingError> {
        match self.conversations.get(id) {
            Some(conversation) => f(&conversation),
            None => Err(RoutingError::ConversationNotFound),
        }
    }

    pub fn snapshot(&self, id: &ConversationId, window: usize) -> Option<ConversationSnapshot> {
        self.conversations.get(id).map(|c| c.snapshot(window))
    }

    pub fn open_conversation_for(&self, visitor: &VisitorId) -> Option<ConversationId> {
        self.open_by_visitor.get(visitor).map(|id| id.clone())
    }

    /// Append a message, rejecting sends into closed or unknown
    /// conversations. The summary update happens atomically with the append.
    pub fn append_message(
        &self,
        id: &ConversationId,
        message: Message,
    ) -> Result<ConversationStatus, RoutingError> {
        let preview_chars = self.preview_chars;
        self.with_mut(id, |conversation| {
            if conversation.is_closed() {
                return Err(RoutingError::ConversationClosed);
            }
            conversation.push_message(message, preview_chars);
            Ok(conversation.status)
        })
    }

    /// Apply the lifecycle state machine. `accept` on anything but pending
    /// fails with AlreadyAssigned; nothing leaves closed; transfer requires
    /// an active conversation.
    pub fn transition(
        &self,
        id: &ConversationId,
        event: TransitionEvent,
    ) -> Result<TransitionOutcome, RoutingError> {
        let outcome = self.with_mut(id, |conversation| {
            let now = Utc::now();
            let previous_operator = conversation.operator.clone();
            match event {
                TransitionEvent::Accept { operator } => {
                    if conversation.status != ConversationStatus::Pending {
                        return Err(RoutingError::AlreadyAssigned);
                    }
                    conversation.operator = Some(operator);
                    conversation.status = ConversationStatus::Active;
                    conversation.accepted_at = Some(now);
                }
                TransitionEvent::Close { reason } => {
                    if conversation.is_closed() {
                        return Err(RoutingError::InvalidTransition(
                            "conversation already closed".into(),
                        ));
                    }
                    conversation.status = ConversationStatus::Closed;
                    conversation.closed_at = Some(now);
                    conversation.close_reason = reason;
                    conversation.typing = Default::default();
                }
                TransitionEvent::Transfer { to } => {
                    if conversation.status != ConversationStatus::Active {
                        return Err(RoutingError::InvalidTransition(
                            "transfer requires an active conversation".into(),
                        ));
                    }
                    conversation.operator = Some(to);
                }
            }
            conversation.last_activity_at = now;
            Ok(TransitionOutcome {
                conversation: conversation.clone(),
                previous_operator,
            })
        })?;

        // Guard released above; safe to touch the index now.
        if outcome.conversation.is_closed() {
            self.open_by_visitor
                .remove_if(&outcome.conversation.visitor.id, |_, open_id| open_id == id);
        }
        Ok(outcome)
    }

    /// Advance the targeted messages to `read`, skipping the requester's own
    /// messages and anything that may not legally advance. Returns the ids
    /// that actually changed.
    pub fn mark_read(
        &self,
        id: &ConversationId,
        requester_id: &str,
        message_ids: &[MessageId],
        read_at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, RoutingError> {
        self.with_mut(id, |conversation| {
            let mut advanced = Vec::new();
            for message in conversation.messages.iter_mut() {
                if !message_ids.contains(&message.id) || message.sender.id == requester_id {
                    continue;
                }
                if message.advance_status(DeliveryStatus::Read, read_at) {
                    advanced.push(message.id.clone());
                }
            }
            Ok(advanced)
        })
    }

    /// Update the transient typing flag. Returns false when the conversation
    /// is closed (nothing to broadcast).
    pub fn set_typing(
        &self,
        id: &ConversationId,
        role: Role,
        is_typing: bool,
    ) -> Result<bool, RoutingError> {
        self.with_mut(id, |conversation| {
            if conversation.is_closed() {
                return Ok(false);
            }
            match role {
                Role::Visitor => conversation.typing.visitor = is_typing,
                Role::Operator => conversation.typing.operator = is_typing,
                Role::System => {}
            }
            Ok(true)
        })
    }

    /// Pending conversations, oldest first (fair operator pickup order).
    pub fn list_pending(&self, window: usize) -> Vec<ConversationSnapshot> {
        let mut pending: Vec<ConversationSnapshot> = self
            .conversations
            .iter()
            .filter(|entry| entry.value().status == ConversationStatus::Pending)
            .map(|entry| entry.value().snapshot(window))
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// An operator's active conversations, most recently active first.
    pub fn list_for_operator(
        &self,
        operator_id: &relay_core::ids::OperatorId,
        window: usize,
    ) -> Vec<ConversationSnapshot> {
        let mut active: Vec<ConversationSnapshot> = self
            .conversations
            .iter()
            .filter(|entry| {
                let c = entry.value();
                c.status == ConversationStatus::Active
                    && c.operator.as_ref().map(|o| &o.id) == Some(operator_id)
            })
            .map(|entry| entry.value().snapshot(window))
            .collect();
        active.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        active
    }

    /// (pending, active) counts.
    pub fn counts(&self) -> (usize, usize) {
        let mut pending = 0;
        let mut active = 0;
        for entry in self.conversations.iter() {
            match entry.value().status {
                ConversationStatus::Pending => pending += 1,
                ConversationStatus::Active => active += 1,
                ConversationStatus::Closed => {}
            }
        }
        (pending, active)
    }
}
