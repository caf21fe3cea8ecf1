use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::{ConversationSnapshot, LastMessageSummary};
use crate::errors::RoutingError;
use crate::identity::{OnlineOperator, OperatorProfile, OperatorStatus, Role, VisitorProfile};
use crate::ids::{ConversationId, MessageId, OperatorId, VisitorId};
use crate::message::{DeliveryStatus, Message};

/// Inbound wire events. Framed as `{"event": ..., "data": ...}`; the sender
/// connection is implicit (carried by the transport, resolved by the
/// registry).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "register")]
    Register(RegisterPayload),
    #[serde(rename = "message:send")]
    SendMessage(SendMessagePayload),
    #[serde(rename = "message:typing")]
    Typing(TypingPayload),
    #[serde(rename = "message:read")]
    MarkRead(MarkReadPayload),
    #[serde(rename = "chat:accept")]
    Accept(AcceptPayload),
    #[serde(rename = "chat:close")]
    Close(ClosePayload),
    #[serde(rename = "chat:transfer")]
    Transfer(TransferPayload),
    #[serde(rename = "operator:status")]
    SetStatus(SetStatusPayload),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::SendMessage(_) => "message:send",
            Self::Typing(_) => "message:typing",
            Self::MarkRead(_) => "message:read",
            Self::Accept(_) => "chat:accept",
            Self::Close(_) => "chat:close",
            Self::Transfer(_) => "chat:transfer",
            Self::SetStatus(_) => "operator:status",
        }
    }
}

/// Role arrives as a raw string so an unknown role parses and is answered
/// with an `invalid_role` error instead of a generic parse failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub conversation_id: ConversationId,
    pub content: Value,
    #[serde(rename = "type", default = "default_content_type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

fn default_content_type() -> String {
    "text".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: ConversationId,
    pub is_typing: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadPayload {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptPayload {
    pub conversation_id: ConversationId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePayload {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPayload {
    pub conversation_id: ConversationId,
    pub target_operator_id: OperatorId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetStatusPayload {
    pub status: OperatorStatus,
}

/// Outbound wire events, same `{"event", "data"}` framing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "registered")]
    Registered(RegistrationSnapshot),
    #[serde(rename = "chat:new")]
    ChatNew(ChatNewPayload),
    #[serde(rename = "chat:update")]
    ChatUpdate(ChatUpdatePayload),
    #[serde(rename = "chat:assigned")]
    ChatAssigned(ChatAssignedPayload),
    #[serde(rename = "chat:accepted")]
    ChatAccepted(ChatAcceptedPayload),
    #[serde(rename = "chat:joined")]
    ChatJoined(ChatJoinedPayload),
    #[serde(rename = "chat:transferred")]
    ChatTransferred(ChatTransferredPayload),
    #[serde(rename = "chat:closed")]
    ChatClosed(ChatClosedPayload),
    #[serde(rename = "message:receive")]
    MessageReceive(MessageReceivePayload),
    #[serde(rename = "message:sent")]
    MessageSent(MessageSentPayload),
    #[serde(rename = "message:status")]
    MessageStatus(MessageStatusPayload),
    #[serde(rename = "typing")]
    Typing(TypingBroadcastPayload),
    #[serde(rename = "visitor:offline")]
    VisitorOffline(VisitorOfflinePayload),
    #[serde(rename = "operator:online")]
    OperatorOnline(OperatorOnlinePayload),
    #[serde(rename = "operator:offline")]
    OperatorOffline(OperatorOfflinePayload),
    #[serde(rename = "operator:statusChange")]
    OperatorStatusChange(OperatorStatusChangePayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Registered(_) => "registered",
            Self::ChatNew(_) => "chat:new",
            Self::ChatUpdate(_) => "chat:update",
            Self::ChatAssigned(_) => "chat:assigned",
            Self::ChatAccepted(_) => "chat:accepted",
            Self::ChatJoined(_) => "chat:joined",
            Self::ChatTransferred(_) => "chat:transferred",
            Self::ChatClosed(_) => "chat:closed",
            Self::MessageReceive(_) => "message:receive",
            Self::MessageSent(_) => "message:sent",
            Self::MessageStatus(_) => "message:status",
            Self::Typing(_) => "typing",
            Self::VisitorOffline(_) => "visitor:offline",
            Self::OperatorOnline(_) => "operator:online",
            Self::OperatorOffline(_) => "operator:offline",
            Self::OperatorStatusChange(_) => "operator:statusChange",
            Self::Error(_) => "error",
        }
    }

    pub fn error_from(err: &RoutingError) -> Self {
        Self::Error(ErrorPayload {
            code: err.code().to_string(),
            message: err.to_string(),
        })
    }
}

/// Reply to `register`; shape depends on the registering role.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegistrationSnapshot {
    Visitor(VisitorRegistration),
    Operator(OperatorRegistration),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorRegistration {
    pub visitor_id: VisitorId,
    pub conversation: ConversationSnapshot,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorRegistration {
    pub operator_id: OperatorId,
    pub pending_chats: Vec<ConversationSnapshot>,
    pub active_chats: Vec<ConversationSnapshot>,
    pub online_operators: Vec<OnlineOperator>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatNewPayload {
    pub conversation_id: ConversationId,
    pub visitor: VisitorProfile,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUpdatePayload {
    pub conversation_id: ConversationId,
    pub last_message: LastMessageSummary,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAssignedPayload {
    pub conversation_id: ConversationId,
    pub operator_id: OperatorId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAcceptedPayload {
    pub conversation_id: ConversationId,
    pub operator: OperatorProfile,
    pub system_message: Message,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatJoinedPayload {
    pub conversation_id: ConversationId,
    pub conversation: ConversationSnapshot,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTransferredPayload {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_operator_id: Option<OperatorId>,
    pub to_operator: OperatorProfile,
    pub system_message: Message,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatClosedPayload {
    pub conversation_id: ConversationId,
    pub closed_by: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub system_message: Message,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceivePayload {
    pub message: Message,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSentPayload {
    pub message_id: MessageId,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatusPayload {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
    pub status: DeliveryStatus,
    pub read_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingBroadcastPayload {
    pub conversation_id: ConversationId,
    pub user_id: String,
    pub user_type: Role,
    pub is_typing: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorOfflinePayload {
    pub visitor_id: VisitorId,
    pub conversation_id: ConversationId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorOnlinePayload {
    pub operator: OperatorProfile,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorOfflinePayload {
    pub operator_id: OperatorId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorStatusChangePayload {
    pub operator_id: OperatorId,
    pub status: OperatorStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}
