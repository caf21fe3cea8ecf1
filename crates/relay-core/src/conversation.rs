use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{OperatorProfile, Role, VisitorProfile};
use crate::ids::ConversationId;
use crate::message::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Pending,
    Active,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

/// Transient per-role typing flags. Never persisted, meaningless once closed.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TypingState {
    pub visitor: bool,
    pub operator: bool,
}

/// Derived cache of the last appended message, kept for conversation list
/// previews. Always recomputed inside `push_message`, never set directly.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessageSummary {
    pub preview: String,
    pub sender: Role,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub visitor: VisitorProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<OperatorProfile>,
    pub status: ConversationStatus,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessageSummary>,
    #[serde(skip)]
    pub typing: TypingState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
}

impl Conversation {
    pub fn new(visitor: VisitorProfile) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            visitor,
            operator: None,
            status: ConversationStatus::Pending,
            messages: Vec::new(),
            last_message: None,
            typing: TypingState::default(),
            created_at: now,
            last_activity_at: now,
            accepted_at: None,
            closed_at: None,
            close_reason: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == ConversationStatus::Closed
    }

    /// Append a message, recomputing the last-message summary and activity
    /// timestamp in the same mutation. This is the only append point, so no
    /// reader can observe the message without the summary or vice versa.
    pub fn push_message(&mut self, message: Message, preview_chars: usize) {
        self.last_message = Some(LastMessageSummary {
            preview: message.preview(preview_chars),
            sender: message.sender.role,
            timestamp: message.created_at,
        });
        self.last_activity_at = message.created_at;
        self.messages.push(message);
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Wire-ready projection with the transcript truncated to the most recent
    /// `window` messages. The authoritative record is never truncated.
    pub fn snapshot(&self, window: usize) -> ConversationSnapshot {
        let skip = self.messages.len().saturating_sub(window);
        ConversationSnapshot {
            id: self.id.clone(),
            visitor: self.visitor.clone(),
            operator: self.operator.clone(),
            status: self.status,
            messages: self.messages[skip..].to_vec(),
            last_message: self.last_message.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            closed_at: self.closed_at,
            close_reason: self.close_reason.clone(),
        }
    }
}

/// Bounded-window view of a conversation as sent to clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub id: ConversationId,
    pub visitor: VisitorProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<OperatorProfile>,
    pub status: ConversationStatus,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessageSummary>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::VisitorId;
    use crate::message::{MessageContent, Sender};

    fn conversation() -> Conversation {
        Conversation::new(VisitorProfile::new(VisitorId::from_raw("vis_1"), None, None))
    }

    fn text(conv: &Conversation, text: &str) -> Message {
        Message::new(
            conv.id.clone(),
            Sender { role: Role::Visitor, id: "vis_1".into(), name: "Visitor".into() },
            MessageContent::Text { text: text.into() },
            None,
        )
    }

    #[test]
    fn new_conversation_is_pending_and_unassigned() {
        let conv = conversation();
        assert_eq!(conv.status, ConversationStatus::Pending);
        assert!(conv.operator.is_none());
        assert!(conv.messages.is_empty());
        assert!(conv.last_message.is_none());
    }

    #[test]
    fn push_updates_summary_and_activity_together() {
        let mut conv = conversation();
        let msg = text(&conv, "hello there");
        let created = msg.created_at;
        conv.push_message(msg, 100);

        let summary = conv.last_message.as_ref().unwrap();
        assert_eq!(summary.preview, "hello there");
        assert_eq!(summary.sender, Role::Visitor);
        assert_eq!(summary.timestamp, created);
        assert_eq!(conv.last_activity_at, created);
    }

    #[test]
    fn summary_tracks_latest_append() {
        let mut conv = conversation();
        let first = text(&conv, "first");
        let second = text(&conv, "second");
        conv.push_message(first, 100);
        conv.push_message(second, 100);
        assert_eq!(conv.last_message.as_ref().unwrap().preview, "second");
        assert_eq!(conv.messages.len(), 2);
    }

    #[test]
    fn summary_preview_is_bounded() {
        let mut conv = conversation();
        let long = "x".repeat(500);
        let msg = text(&conv, &long);
        conv.push_message(msg, 100);
        assert_eq!(conv.last_message.as_ref().unwrap().preview.len(), 100);
    }

    #[test]
    fn snapshot_truncates_to_window() {
        let mut conv = conversation();
        for i in 0..60 {
            let msg = text(&conv, &format!("m{i}"));
            conv.push_message(msg, 100);
        }
        let snap = conv.snapshot(50);
        assert_eq!(snap.messages.len(), 50);
        // Most recent window, oldest entries dropped.
        assert!(matches!(
            &snap.messages[0].content,
            MessageContent::Text { text } if text == "m10"
        ));
        // Authoritative record untouched.
        assert_eq!(conv.messages.len(), 60);
    }

    #[test]
    fn snapshot_of_short_transcript_is_complete() {
        let mut conv = conversation();
        let msg = text(&conv, "only");
        conv.push_message(msg, 100);
        assert_eq!(conv.snapshot(50).messages.len(), 1);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let conv = conversation();
        let json = serde_json::to_string(&conv.snapshot(50)).unwrap();
        assert!(json.contains("\"lastActivityAt\""), "got: {json}");
        assert!(!json.contains("\"operator\""), "absent operator serialized: {json}");
    }
}
