use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::Role;
use crate::ids::{ConversationId, MessageId};

/// Per-message delivery lifecycle. Advances monotonically along
/// sending → sent → delivered → read; `failed` is terminal from any state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Sending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Failed => 4,
        }
    }

    /// Whether `to` is a legal next state from `self`.
    pub fn can_advance_to(&self, to: DeliveryStatus) -> bool {
        match (self, to) {
            (Self::Failed, _) => false,
            (_, Self::Failed) => true,
            _ => to.rank() > self.rank(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// Typed message payload. `SystemAction` is server-minted only; the other
/// variants arrive from clients via `MessageContent::from_wire`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Media {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
    SystemAction {
        action: String,
    },
}

impl MessageContent {
    /// Build content from the wire representation: a `type` discriminator
    /// alongside an untyped `content` value. Returns `None` for unknown kinds
    /// or a payload that does not match the kind.
    pub fn from_wire(kind: &str, content: &Value) -> Option<Self> {
        match kind {
            "text" => content.as_str().map(|text| Self::Text { text: text.to_string() }),
            "media" => {
                let obj = content.as_object()?;
                let url = obj.get("url")?.as_str()?.to_string();
                Some(Self::Media {
                    url,
                    mime: obj.get("mime").and_then(Value::as_str).map(String::from),
                    caption: obj.get("caption").and_then(Value::as_str).map(String::from),
                })
            }
            "location" => {
                let obj = content.as_object()?;
                Some(Self::Location {
                    latitude: obj.get("latitude")?.as_f64()?,
                    longitude: obj.get("longitude")?.as_f64()?,
                })
            }
            _ => None,
        }
    }

    /// Char-bounded preview for conversation list summaries.
    pub fn preview(&self, max_chars: usize) -> String {
        let source = match self {
            Self::Text { text } => text.as_str(),
            Self::Media { caption: Some(c), .. } => c.as_str(),
            Self::Media { .. } => "[media]",
            Self::Location { .. } => "[location]",
            Self::SystemAction { action } => action.as_str(),
        };
        source.chars().take(max_chars).collect()
    }

    /// Client-supplied chars counted against the message length cap. Media
    /// counts its url and caption so an oversized payload cannot hide in a
    /// non-text field.
    pub fn payload_chars(&self) -> usize {
        match self {
            Self::Text { text } => text.chars().count(),
            Self::Media { url, mime, caption } => {
                url.chars().count()
                    + mime.as_ref().map_or(0, |m| m.chars().count())
                    + caption.as_ref().map_or(0, |c| c.chars().count())
            }
            Self::Location { .. } => 0,
            Self::SystemAction { action } => action.chars().count(),
        }
    }

    pub fn is_empty_text(&self) -> bool {
        matches!(self, Self::Text { text } if text.trim().is_empty())
    }
}

/// Display-name snapshot of the sender at send time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub role: Role,
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: Sender,
    pub content: MessageContent,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(
        conversation_id: ConversationId,
        sender: Sender,
        content: MessageContent,
        reply_to: Option<MessageId>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender,
            content,
            status: DeliveryStatus::Sent,
            reply_to,
            created_at: Utc::now(),
            read_at: None,
        }
    }

    /// Server-minted system message recording a lifecycle event (join, close,
    /// transfer) inside the conversation transcript.
    pub fn system(conversation_id: ConversationId, action: impl Into<String>) -> Self {
        let action = action.into();
        Self {
            id: MessageId::new(),
            conversation_id,
            sender: Sender {
                role: Role::System,
                id: "system".to_string(),
                name: "System".to_string(),
            },
            content: MessageContent::SystemAction { action },
            status: DeliveryStatus::Sent,
            reply_to: None,
            created_at: Utc::now(),
            read_at: None,
        }
    }

    /// Apply a delivery-status advance if legal. Returns whether the status
    /// changed; illegal transitions (including any regression) leave the
    /// message untouched.
    pub fn advance_status(&mut self, to: DeliveryStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_advance_to(to) {
            return false;
        }
        self.status = to;
        if to == DeliveryStatus::Read {
            self.read_at = Some(at);
        }
        true
    }

    pub fn preview(&self, max_chars: usize) -> String {
        self.content.preview(max_chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_message(text: &str) -> Message {
        Message::new(
            ConversationId::new(),
            Sender {
                role: Role::Visitor,
                id: "vis_1".into(),
                name: "Visitor".into(),
            },
            MessageContent::Text { text: text.into() },
            None,
        )
    }

    #[test]
    fn status_advances_forward_only() {
        let mut msg = text_message("hello");
        assert_eq!(msg.status, DeliveryStatus::Sent);
        assert!(msg.advance_status(DeliveryStatus::Delivered, Utc::now()));
        assert!(msg.advance_status(DeliveryStatus::Read, Utc::now()));
        assert!(msg.read_at.is_some());

        // Read never regresses.
        assert!(!msg.advance_status(DeliveryStatus::Delivered, Utc::now()));
        assert!(!msg.advance_status(DeliveryStatus::Sent, Utc::now()));
        assert_eq!(msg.status, DeliveryStatus::Read);
    }

    #[test]
    fn status_can_skip_intermediate_states() {
        let mut msg = text_message("hi");
        assert!(msg.advance_status(DeliveryStatus::Read, Utc::now()));
        assert_eq!(msg.status, DeliveryStatus::Read);
    }

    #[test]
    fn failed_is_terminal() {
        let mut msg = text_message("hi");
        assert!(msg.advance_status(DeliveryStatus::Failed, Utc::now()));
        assert!(!msg.advance_status(DeliveryStatus::Read, Utc::now()));
        assert!(!msg.advance_status(DeliveryStatus::Sent, Utc::now()));
        assert_eq!(msg.status, DeliveryStatus::Failed);
    }

    #[test]
    fn failed_reachable_from_any_state() {
        assert!(DeliveryStatus::Sending.can_advance_to(DeliveryStatus::Failed));
        assert!(DeliveryStatus::Read.can_advance_to(DeliveryStatus::Failed));
    }

    #[test]
    fn from_wire_text() {
        let content = MessageContent::from_wire("text", &serde_json::json!("hello")).unwrap();
        assert!(matches!(content, MessageContent::Text { ref text } if text == "hello"));
    }

    #[test]
    fn from_wire_media_requires_url() {
        assert!(MessageContent::from_wire("media", &serde_json::json!({"caption": "x"})).is_none());
        let content =
            MessageContent::from_wire("media", &serde_json::json!({"url": "https://x/y.png"}))
                .unwrap();
        assert!(matches!(content, MessageContent::Media { .. }));
    }

    #[test]
    fn from_wire_rejects_unknown_kind() {
        assert!(MessageContent::from_wire("sticker", &serde_json::json!("x")).is_none());
    }

    #[test]
    fn from_wire_location() {
        let content = MessageContent::from_wire(
            "location",
            &serde_json::json!({"latitude": 51.5, "longitude": -0.12}),
        )
        .unwrap();
        assert!(matches!(content, MessageContent::Location { .. }));
    }

    #[test]
    fn payload_chars_counts_media_fields() {
        let text = MessageContent::Text { text: "héllo".into() };
        assert_eq!(text.payload_chars(), 5);

        let media = MessageContent::Media {
            url: "1234".into(),
            mime: Some("a/b".into()),
            caption: Some("56".into()),
        };
        assert_eq!(media.payload_chars(), 9);

        let loc = MessageContent::Location { latitude: 0.0, longitude: 0.0 };
        assert_eq!(loc.payload_chars(), 0);
    }

    #[test]
    fn preview_truncates_by_chars() {
        let msg = text_message("héllo wörld, this is a long message");
        assert_eq!(msg.preview(5), "héllo");
    }

    #[test]
    fn preview_for_non_text_content() {
        let media = MessageContent::Media { url: "u".into(), mime: None, caption: None };
        assert_eq!(media.preview(100), "[media]");
        let loc = MessageContent::Location { latitude: 0.0, longitude: 0.0 };
        assert_eq!(loc.preview(100), "[location]");
    }

    #[test]
    fn system_message_shape() {
        let conv = ConversationId::new();
        let msg = Message::system(conv.clone(), "Operator Jo joined the conversation");
        assert_eq!(msg.sender.role, Role::System);
        assert_eq!(msg.conversation_id, conv);
        assert!(matches!(msg.content, MessageContent::SystemAction { .. }));
    }

    #[test]
    fn message_serializes_camel_case() {
        let msg = text_message("hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"conversationId\""), "got: {json}");
        assert!(json.contains("\"createdAt\""), "got: {json}");
        assert!(!json.contains("\"replyTo\""), "absent option serialized: {json}");
    }
}
