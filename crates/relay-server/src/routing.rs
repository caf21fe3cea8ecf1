use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use relay_core::events::{
    AcceptPayload, ChatAcceptedPayload, ChatAssignedPayload, ChatClosedPayload,
    ChatJoinedPayload, ChatNewPayload, ChatTransferredPayload, ChatUpdatePayload, ClientEvent,
    ClosePayload, MarkReadPayload, MessageReceivePayload, MessageSentPayload,
    MessageStatusPayload, OperatorOfflinePayload, OperatorOnlinePayload, OperatorRegistration,
    OperatorStatusChangePayload, RegisterPayload, RegistrationSnapshot, SendMessagePayload,
    ServerEvent, SetStatusPayload, TransferPayload, TypingBroadcastPayload, TypingPayload,
    VisitorOfflinePayload, VisitorRegistration,
};
use relay_core::ids::{ConnectionId, OperatorId, VisitorId};
use relay_core::{
    DeliveryStatus, LastMessageSummary, Message, MessageContent, OperatorProfile, Role,
    RoutingError, Sender, VisitorProfile,
};
use relay_store::StoreOp;

use crate::config::RoutingConfig;
use crate::connection::{ConnectionRegistry, Identity};
use crate::conversations::{ConversationStore, TransitionEvent};
use crate::groups::{GroupId, Groups};
use crate::presence::PresenceTracker;

/// Everything the routing loop consumes. Text frames and disconnects come
/// from connection tasks, grace expiries from presence timers. Processing is
/// single-consumer, so per-event handling needs no cross-event locking.
#[derive(Debug)]
pub enum Inbound {
    Text {
        connection: ConnectionId,
        raw: String,
    },
    Closed {
        connection: ConnectionId,
    },
    GraceExpired {
        visitor: VisitorId,
    },
}

/// Seam for the external auth collaborator that vouches for operator
/// identities. The engine never decides operator authenticity itself.
pub trait OperatorVerifier: Send + Sync {
    fn verify(&self, user_id: &str, user_data: Option<&Value>)
        -> Result<OperatorProfile, RoutingError>;
}

/// Default verifier: trusts the presented id and lifts name/avatar out of the
/// registration payload. Deployments fronted by an auth proxy use this.
pub struct TrustedVerifier;

impl OperatorVerifier for TrustedVerifier {
    fn verify(
        &self,
        user_id: &str,
        user_data: Option<&Value>,
    ) -> Result<OperatorProfile, RoutingError> {
        let name = user_data
            .and_then(|d| d.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("Operator")
            .to_string();
        let avatar = user_data
            .and_then(|d| d.get("avatar"))
            .and_then(Value::as_str)
            .map(String::from);
        Ok(OperatorProfile {
            id: OperatorId::from_raw(user_id),
            name,
            avatar,
        })
    }
}

/// Counters exposed on the stats endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingStats {
    pub connections: usize,
    pub visitor_connections: usize,
    pub operator_connections: usize,
    pub pending_conversations: usize,
    pub active_conversations: usize,
    pub online_operators: usize,
    pub online_visitors: usize,
}

/// The single-consumer routing core. Every inbound event resolves the sender
/// identity, validates, mutates exactly one conversation (or presence), then
/// fans out. Errors ack to the sender only; fan-out never blocks the loop.
pub struct RoutingEngine {
    registry: Arc<ConnectionRegistry>,
    store: ConversationStore,
    presence: PresenceTracker,
    groups: Groups,
    config: RoutingConfig,
    verifier: Box<dyn OperatorVerifier>,
    mirror: Option<mpsc::UnboundedSender<StoreOp>>,
    inbound_tx: mpsc::Sender<Inbound>,
}

impl RoutingEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        config: RoutingConfig,
        verifier: Box<dyn OperatorVerifier>,
        mirror: Option<mpsc::UnboundedSender<StoreOp>>,
        inbound_tx: mpsc::Sender<Inbound>,
    ) -> Self {
        let store = ConversationStore::new(config.preview_chars);
        Self {
            registry,
            store,
            presence: PresenceTracker::new(),
            groups: Groups::new(),
            config,
            verifier,
            mirror,
            inbound_tx,
        }
    }

    /// Restore in-memory state from the durable mirror at startup.
    pub fn seed(&self, conversations: Vec<relay_core::Conversation>) {
        let count = conversations.len();
        self.store.seed(conversations);
        if count > 0 {
            tracing::info!(count, "restored open conversations");
        }
    }

    /// Consume the inbound queue until all producers hang up.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Inbound>) {
        while let Some(inbound) = rx.recv().await {
            self.handle(inbound);
        }
        tracing::debug!("routing loop stopped");
    }

    pub fn handle(&self, inbound: Inbound) {
        match inbound {
            Inbound::Text { connection, raw } => self.handle_text(&connection, &raw),
            Inbound::Closed { connection } => self.handle_closed(&connection),
            Inbound::GraceExpired { visitor } => self.handle_grace_expired(&visitor),
        }
    }

    pub fn stats(&self) -> RoutingStats {
        let (visitor_connections, operator_connections) = self.registry.counts_by_role();
        let (pending_conversations, active_conversations) = self.store.counts();
        let (online_operators, online_visitors) = self.presence.counts();
        RoutingStats {
            connections: self.registry.count(),
            visitor_connections,
            operator_connections,
            pending_conversations,
            active_conversations,
            online_operators,
            online_visitors,
        }
    }

    fn handle_text(&self, connection: &ConnectionId, raw: &str) {
        let event = match serde_json::from_str::<ClientEvent>(raw) {
            Ok(event) => event,
            Err(error) => {
                tracing::debug!(connection_id = %connection, %error, "malformed event");
                self.send(
                    connection,
                    &ServerEvent::error_from(&RoutingError::Validation(
                        "malformed event".to_string(),
                    )),
                );
                return;
            }
        };

        let name = event.name();
        let result = match event {
            ClientEvent::Register(payload) => self.handle_register(connection, payload),
            ClientEvent::SendMessage(payload) => self.handle_send(connection, payload),
            ClientEvent::Typing(payload) => self.handle_typing(connection, payload),
            ClientEvent::MarkRead(payload) => self.handle_mark_read(connection, payload),
            ClientEvent::Accept(payload) => self.handle_accept(connection, payload),
            ClientEvent::Close(payload) => self.handle_close(connection, payload),
            ClientEvent::Transfer(payload) => self.handle_transfer(connection, payload),
            ClientEvent::SetStatus(payload) => self.handle_set_status(connection, payload),
        };

        if let Err(error) = result {
            tracing::debug!(connection_id = %connection, event = name, code = error.code(), "rejected");
            self.send(connection, &ServerEvent::error_from(&error));
        }
    }

    fn handle_register(
        &self,
        connection: &ConnectionId,
        payload: RegisterPayload,
    ) -> Result<(), RoutingError> {
        match payload.role.parse::<Role>() {
            Ok(Role::Visitor) => self.register_visitor(connection, payload),
            Ok(Role::Operator) => self.register_operator(connection, payload),
            _ => Err(RoutingError::InvalidRole(payload.role)),
        }
    }

    fn register_visitor(
        &self,
        connection: &ConnectionId,
        payload: RegisterPayload,
    ) -> Result<(), RoutingError> {
        // A rebinding attempt keeps the original identity; an operator
        // connection cannot re-register as a visitor.
        let visitor_id = match self.registry.resolve(connection) {
            Some(Identity::Visitor(existing)) => existing,
            Some(Identity::Operator(_)) => {
                return Err(RoutingError::Validation(
                    "connection already registered as operator".to_string(),
                ))
            }
            None => match payload.user_id {
                Some(raw) => VisitorId::from_raw(raw),
                None => VisitorId::new(),
            },
        };

        let name = payload
            .user_data
            .as_ref()
            .and_then(|d| d.get("name"))
            .and_then(Value::as_str)
            .map(String::from);
        let profile = VisitorProfile::new(visitor_id.clone(), name, payload.user_data);

        let (conversation, created) = self.store.get_or_create_for_visitor(profile);
        self.registry
            .bind(connection, Identity::Visitor(visitor_id.clone()))
            .ok_or(RoutingError::Unauthorized)?;
        self.presence
            .visitor_online(visitor_id.clone(), connection.clone());
        self.groups.join(
            GroupId::Conversation(conversation.id.clone()),
            connection.clone(),
        );

        let snapshot = conversation.snapshot(self.config.snapshot_window);
        self.send(
            connection,
            &ServerEvent::Registered(RegistrationSnapshot::Visitor(VisitorRegistration {
                visitor_id: visitor_id.clone(),
                conversation: snapshot,
            })),
        );

        if created {
            tracing::info!(
                conversation_id = %conversation.id,
                visitor_id = %visitor_id,
                "new conversation"
            );
            self.broadcast(
                &GroupId::Operators,
                None,
                &ServerEvent::ChatNew(ChatNewPayload {
                    conversation_id: conversation.id.clone(),
                    visitor: conversation.visitor.clone(),
                    created_at: conversation.created_at,
                }),
            );
        }

        self.mirror(StoreOp::UpsertConversation(Box::new(conversation)));
        Ok(())
    }

    fn register_operator(
        &self,
        connection: &ConnectionId,
        payload: RegisterPayload,
    ) -> Result<(), RoutingError> {
        let existing = self.registry.resolve(connection);
        if let Some(Identity::Visitor(_)) = existing {
            return Err(RoutingError::Validation(
                "connection already registered as visitor".to_string(),
            ));
        }
        let user_id = payload
            .user_id
            .ok_or_else(|| RoutingError::Validation("userId is required".to_string()))?;
        let profile = self.verifier.verify(&user_id, payload.user_data.as_ref())?;
        let operator_id = profile.id.clone();

        // The registry binding is sticky, so a re-register under a different
        // operator id must be rejected here; writing presence for the new id
        // would leave it orphaned when this connection closes.
        if let Some(Identity::Operator(bound)) = &existing {
            if *bound != operator_id {
                return Err(RoutingError::Validation(
                    "connection already registered as a different operator".to_string(),
                ));
            }
        }

        self.registry
            .bind(connection, Identity::Operator(operator_id.clone()))
            .ok_or(RoutingError::Unauthorized)?;
        let fresh = self
            .presence
            .operator_online(profile.clone(), connection.clone())
            .is_none();

        // A reconnecting operator rejoins the fan-out groups of every
        // conversation still assigned to them.
        for conversation_id in self.presence.assigned(&operator_id) {
            self.groups
                .join(GroupId::Conversation(conversation_id), connection.clone());
        }
        self.groups.join(GroupId::Operators, connection.clone());

        self.send(
            connection,
            &ServerEvent::Registered(RegistrationSnapshot::Operator(OperatorRegistration {
                operator_id: operator_id.clone(),
                pending_chats: self.store.list_pending(self.config.snapshot_window),
                active_chats: self
                    .store
                    .list_for_operator(&operator_id, self.config.snapshot_window),
                online_operators: self.presence.online_operators(),
            })),
        );

        // Peers are only told about a presence transition; a reconnect or a
        // repeated register on a live presence stays silent.
        if fresh {
            tracing::info!(operator_id = %operator_id, "operator online");
            self.broadcast(
                &GroupId::Operators,
                Some(connection),
                &ServerEvent::OperatorOnline(OperatorOnlinePayload { operator: profile }),
            );
        }
        Ok(())
    }

    fn handle_send(
        &self,
        connection: &ConnectionId,
        payload: SendMessagePayload,
    ) -> Result<(), RoutingError> {
        let identity = self
            .registry
            .resolve(connection)
            .ok_or(RoutingError::Unauthorized)?;

        let content = MessageContent::from_wire(&payload.content_type, &payload.content)
            .ok_or_else(|| {
                RoutingError::Validation(format!(
                    "unsupported message content: {}",
                    payload.content_type
                ))
            })?;
        if content.is_empty_text() {
            return Err(RoutingError::Validation("message text is empty".to_string()));
        }
        if content.payload_chars() > self.config.max_message_chars {
            return Err(RoutingError::Validation(format!(
                "message exceeds {} characters",
                self.config.max_message_chars
            )));
        }

        let operator_name = match &identity {
            Identity::Operator(id) => self.presence.operator(id).map(|p| p.profile.name),
            Identity::Visitor(_) => None,
        };
        let conversation_id = payload.conversation_id.clone();
        let preview_chars = self.config.preview_chars;

        let (message, status) = self.store.with_mut(&conversation_id, |conversation| {
            if conversation.is_closed() {
                return Err(RoutingError::ConversationClosed);
            }
            let name = match &identity {
                Identity::Visitor(id) => {
                    if conversation.visitor.id != *id {
                        return Err(RoutingError::Unauthorized);
                    }
                    conversation.visitor.name.clone()
                }
                Identity::Operator(id) => {
                    if conversation.operator.as_ref().map(|o| &o.id) != Some(id) {
                        return Err(RoutingError::Unauthorized);
                    }
                    operator_name.unwrap_or_else(|| "Operator".to_string())
                }
            };
            let message = Message::new(
                conversation_id.clone(),
                Sender {
                    role: identity.role(),
                    id: identity.id_str().to_string(),
                    name,
                },
                content,
                payload.reply_to,
            );
            conversation.push_message(message.clone(), preview_chars);
            Ok((message, conversation.status))
        })?;

        self.send(
            connection,
            &ServerEvent::MessageSent(MessageSentPayload {
                message_id: message.id.clone(),
                status: message.status,
                timestamp: message.created_at,
            }),
        );
        self.broadcast(
            &GroupId::Conversation(payload.conversation_id.clone()),
            Some(connection),
            &ServerEvent::MessageReceive(MessageReceivePayload {
                message: message.clone(),
            }),
        );

        // Unaccepted conversations have no operator in the group yet, so the
        // whole operator pool sees the summary refresh instead.
        if status == relay_core::ConversationStatus::Pending {
            self.broadcast(
                &GroupId::Operators,
                None,
                &ServerEvent::ChatUpdate(ChatUpdatePayload {
                    conversation_id: payload.conversation_id,
                    last_message: LastMessageSummary {
                        preview: message.preview(preview_chars),
                        sender: message.sender.role,
                        timestamp: message.created_at,
                    },
                }),
            );
        }

        self.mirror(StoreOp::AppendMessage(Box::new(message)));
        Ok(())
    }

    fn handle_accept(
        &self,
        connection: &ConnectionId,
        payload: AcceptPayload,
    ) -> Result<(), RoutingError> {
        let Some(Identity::Operator(operator_id)) = self.registry.resolve(connection) else {
            return Err(RoutingError::Unauthorized);
        };
        let presence = self
            .presence
            .operator(&operator_id)
            .ok_or(RoutingError::Unauthorized)?;
        let cap = self.config.max_operator_conversations;
        if cap > 0 && presence.assigned.len() >= cap {
            return Err(RoutingError::Validation("operator at capacity".to_string()));
        }

        let conversation_id = payload.conversation_id;
        let outcome = self.store.transition(
            &conversation_id,
            TransitionEvent::Accept {
                operator: presence.profile.clone(),
            },
        )?;

        let system = Message::system(
            conversation_id.clone(),
            format!("{} joined the conversation", presence.profile.name),
        );
        self.store
            .append_message(&conversation_id, system.clone())?;

        self.presence.assign(&operator_id, conversation_id.clone());
        self.groups.join(
            GroupId::Conversation(conversation_id.clone()),
            connection.clone(),
        );

        tracing::info!(
            conversation_id = %conversation_id,
            operator_id = %operator_id,
            "conversation accepted"
        );

        self.broadcast(
            &GroupId::Conversation(conversation_id.clone()),
            Some(connection),
            &ServerEvent::ChatAccepted(ChatAcceptedPayload {
                conversation_id: conversation_id.clone(),
                operator: presence.profile.clone(),
                system_message: system.clone(),
            }),
        );

        let snapshot = self
            .store
            .snapshot(&conversation_id, self.config.snapshot_window)
            .ok_or(RoutingError::ConversationNotFound)?;
        self.send(
            connection,
            &ServerEvent::ChatJoined(ChatJoinedPayload {
                conversation_id: conversation_id.clone(),
                conversation: snapshot,
            }),
        );

        self.broadcast(
            &GroupId::Operators,
            Some(connection),
            &ServerEvent::ChatAssigned(ChatAssignedPayload {
                conversation_id: conversation_id.clone(),
                operator_id,
            }),
        );

        self.mirror(StoreOp::UpsertConversation(Box::new(outcome.conversation)));
        self.mirror(StoreOp::AppendMessage(Box::new(system)));
        Ok(())
    }

    fn handle_close(
        &self,
        connection: &ConnectionId,
        payload: ClosePayload,
    ) -> Result<(), RoutingError> {
        let identity = self
            .registry
            .resolve(connection)
            .ok_or(RoutingError::Unauthorized)?;
        let conversation_id = payload.conversation_id;

        // Visitors may only close their own conversation; any operator may
        // close any conversation.
        let closer_name = self.store.with_read(&conversation_id, |conversation| {
            match &identity {
                Identity::Visitor(id) => {
                    if conversation.visitor.id != *id {
                        return Err(RoutingError::Unauthorized);
                    }
                    Ok(conversation.visitor.name.clone())
                }
                Identity::Operator(id) => Ok(self
                    .presence
                    .operator(id)
                    .map(|p| p.profile.name)
                    .unwrap_or_else(|| "Operator".to_string())),
            }
        })?;

        let outcome = self.store.transition(
            &conversation_id,
            TransitionEvent::Close {
                reason: payload.reason.clone(),
            },
        )?;

        // The transcript records the close even though the conversation is
        // already terminal, so this append bypasses the closed check.
        let system = Message::system(
            conversation_id.clone(),
            format!("{closer_name} closed the conversation"),
        );
        let preview_chars = self.config.preview_chars;
        self.store.with_mut(&conversation_id, |conversation| {
            conversation.push_message(system.clone(), preview_chars);
            Ok(())
        })?;

        if let Some(operator) = &outcome.conversation.operator {
            self.presence.unassign(&operator.id, &conversation_id);
        }

        tracing::info!(
            conversation_id = %conversation_id,
            closed_by = %identity.role(),
            "conversation closed"
        );

        let targets = self.groups.union(&[
            GroupId::Conversation(conversation_id.clone()),
            GroupId::Operators,
        ]);
        self.broadcast_to(
            targets,
            None,
            &ServerEvent::ChatClosed(ChatClosedPayload {
                conversation_id: conversation_id.clone(),
                closed_by: identity.role(),
                reason: payload.reason,
                system_message: system.clone(),
            }),
        );

        // Closed is terminal, so the fan-out group has no further use.
        self.groups
            .remove(&GroupId::Conversation(conversation_id.clone()));

        let closed = self
            .store
            .with_read(&conversation_id, |c| Ok(c.clone()))?;
        self.mirror(StoreOp::UpsertConversation(Box::new(closed)));
        self.mirror(StoreOp::AppendMessage(Box::new(system)));
        Ok(())
    }

    fn handle_transfer(
        &self,
        connection: &ConnectionId,
        payload: TransferPayload,
    ) -> Result<(), RoutingError> {
        let Some(Identity::Operator(from_operator)) = self.registry.resolve(connection) else {
            return Err(RoutingError::Unauthorized);
        };
        let target = self
            .presence
            .operator(&payload.target_operator_id)
            .ok_or(RoutingError::OperatorUnavailable)?;
        let cap = self.config.max_operator_conversations;
        if cap > 0 && target.assigned.len() >= cap {
            return Err(RoutingError::OperatorUnavailable);
        }

        let conversation_id = payload.conversation_id;
        let outcome = self.store.transition(
            &conversation_id,
            TransitionEvent::Transfer {
                to: target.profile.clone(),
            },
        )?;

        let system = Message::system(
            conversation_id.clone(),
            format!("Transferred to {}", target.profile.name),
        );
        self.store
            .append_message(&conversation_id, system.clone())?;

        // The new operator joins the fan-out group; the previous operator
        // stays in it to observe the handoff.
        self.groups.join(
            GroupId::Conversation(conversation_id.clone()),
            target.connection.clone(),
        );
        if let Some(previous) = &outcome.previous_operator {
            self.presence.unassign(&previous.id, &conversation_id);
        }
        self.presence
            .assign(&target.profile.id, conversation_id.clone());

        tracing::info!(
            conversation_id = %conversation_id,
            from = %from_operator,
            to = %target.profile.id,
            "conversation transferred"
        );

        let targets = self.groups.union(&[
            GroupId::Conversation(conversation_id.clone()),
            GroupId::Operators,
        ]);
        self.broadcast_to(
            targets,
            None,
            &ServerEvent::ChatTransferred(ChatTransferredPayload {
                conversation_id: conversation_id.clone(),
                from_operator_id: outcome.previous_operator.map(|p| p.id),
                to_operator: target.profile,
                system_message: system.clone(),
            }),
        );

        let transferred = self
            .store
            .with_read(&conversation_id, |c| Ok(c.clone()))?;
        self.mirror(StoreOp::UpsertConversation(Box::new(transferred)));
        self.mirror(StoreOp::AppendMessage(Box::new(system)));
        Ok(())
    }

    fn handle_mark_read(
        &self,
        connection: &ConnectionId,
        payload: MarkReadPayload,
    ) -> Result<(), RoutingError> {
        let identity = self
            .registry
            .resolve(connection)
            .ok_or(RoutingError::Unauthorized)?;
        let conversation_id = payload.conversation_id;

        self.store
            .with_read(&conversation_id, |conversation| {
                Self::check_participant(conversation, &identity)
            })?;

        let read_at = Utc::now();
        let advanced = self.store.mark_read(
            &conversation_id,
            identity.id_str(),
            &payload.message_ids,
            read_at,
        )?;
        if advanced.is_empty() {
            return Ok(());
        }

        self.broadcast(
            &GroupId::Conversation(conversation_id.clone()),
            Some(connection),
            &ServerEvent::MessageStatus(MessageStatusPayload {
                conversation_id: conversation_id.clone(),
                message_ids: advanced.clone(),
                status: DeliveryStatus::Read,
                read_at,
            }),
        );

        self.mirror(StoreOp::MessagesRead {
            conversation_id,
            message_ids: advanced,
            read_at,
        });
        Ok(())
    }

    fn handle_typing(
        &self,
        connection: &ConnectionId,
        payload: TypingPayload,
    ) -> Result<(), RoutingError> {
        let identity = self
            .registry
            .resolve(connection)
            .ok_or(RoutingError::Unauthorized)?;
        let conversation_id = payload.conversation_id;

        self.store
            .with_read(&conversation_id, |conversation| {
                Self::check_participant(conversation, &identity)
            })?;

        let live = self
            .store
            .set_typing(&conversation_id, identity.role(), payload.is_typing)?;
        if !live {
            return Ok(());
        }

        self.broadcast(
            &GroupId::Conversation(conversation_id.clone()),
            Some(connection),
            &ServerEvent::Typing(TypingBroadcastPayload {
                conversation_id,
                user_id: identity.id_str().to_string(),
                user_type: identity.role(),
                is_typing: payload.is_typing,
            }),
        );
        Ok(())
    }

    fn handle_set_status(
        &self,
        connection: &ConnectionId,
        payload: SetStatusPayload,
    ) -> Result<(), RoutingError> {
        let Some(Identity::Operator(operator_id)) = self.registry.resolve(connection) else {
            return Err(RoutingError::Unauthorized);
        };
        if !self.presence.set_status(&operator_id, payload.status) {
            return Err(RoutingError::Unauthorized);
        }

        self.broadcast(
            &GroupId::Operators,
            Some(connection),
            &ServerEvent::OperatorStatusChange(OperatorStatusChangePayload {
                operator_id,
                status: payload.status,
            }),
        );
        Ok(())
    }

    /// Disconnect observation. This is the only place connections are
    /// unregistered, so the identity is still resolvable here; a duplicate
    /// `Closed` for the same connection resolves to nothing and falls through.
    fn handle_closed(&self, connection: &ConnectionId) {
        match self.registry.resolve(connection) {
            Some(Identity::Operator(operator_id)) => {
                if self.presence.operator_offline(&operator_id, connection).is_some() {
                    tracing::info!(operator_id = %operator_id, "operator offline");
                    self.broadcast(
                        &GroupId::Operators,
                        Some(connection),
                        &ServerEvent::OperatorOffline(OperatorOfflinePayload { operator_id }),
                    );
                }
            }
            Some(Identity::Visitor(visitor_id)) => {
                if self.presence.visitor_offline_if(&visitor_id, connection) {
                    tracing::debug!(visitor_id = %visitor_id, "visitor disconnected, grace armed");
                    self.presence.schedule_grace(
                        visitor_id,
                        self.config.visitor_grace,
                        self.inbound_tx.clone(),
                    );
                }
            }
            None => {}
        }
        self.groups.leave_all(connection);
        self.registry.unregister(connection);
    }

    /// A grace timer elapsed. Re-validate before announcing: the timer entry
    /// must still be armed and the visitor must not have reconnected.
    fn handle_grace_expired(&self, visitor: &VisitorId) {
        if !self.presence.claim_grace(visitor) {
            return;
        }
        if self.presence.visitor_connection(visitor).is_some() {
            return;
        }
        let Some(conversation_id) = self.store.open_conversation_for(visitor) else {
            return;
        };
        tracing::info!(visitor_id = %visitor, conversation_id = %conversation_id, "visitor offline");
        self.broadcast(
            &GroupId::Conversation(conversation_id.clone()),
            None,
            &ServerEvent::VisitorOffline(VisitorOfflinePayload {
                visitor_id: visitor.clone(),
                conversation_id,
            }),
        );
    }

    fn check_participant(
        conversation: &relay_core::Conversation,
        identity: &Identity,
    ) -> Result<(), RoutingError> {
        match identity {
            Identity::Visitor(id) if conversation.visitor.id == *id => Ok(()),
            Identity::Operator(id)
                if conversation.operator.as_ref().map(|o| &o.id) == Some(id) =>
            {
                Ok(())
            }
            _ => Err(RoutingError::Unauthorized),
        }
    }

    fn mirror(&self, op: StoreOp) {
        if let Some(tx) = &self.mirror {
            let _ = tx.send(op);
        }
    }

    fn serialize(event: &ServerEvent) -> Option<Arc<String>> {
        match serde_json::to_string(event) {
            Ok(json) => Some(Arc::new(json)),
            Err(error) => {
                tracing::error!(%error, event = event.name(), "failed to serialize event");
                None
            }
        }
    }

    fn send(&self, connection: &ConnectionId, event: &ServerEvent) {
        if let Some(payload) = Self::serialize(event) {
            self.registry.send_to(connection, payload);
        }
    }

    fn broadcast(&self, group: &GroupId, exclude: Option<&ConnectionId>, event: &ServerEvent) {
        self.broadcast_to(self.groups.members(group), exclude, event);
    }

    /// Serialize once, then best-effort delivery per recipient. A slow or
    /// gone recipient never affects the others.
    fn broadcast_to(
        &self,
        targets: impl IntoIterator<Item = ConnectionId>,
        exclude: Option<&ConnectionId>,
        event: &ServerEvent,
    ) {
        let Some(payload) = Self::serialize(event) else {
            return;
        };
        for target in targets {
            if Some(&target) == exclude {
                continue;
            }
            self.registry.send_to(&target, Arc::clone(&payload));
        }
    }
}
