use chrono::{DateTime, Utc};
use tracing::instrument;

use relay_core::ids::{ConversationId, MessageId, OperatorId, VisitorId};
use relay_core::{
    Conversation, DeliveryStatus, Message, MessageContent, OperatorProfile, Sender, TypingState,
    VisitorProfile,
};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const CONVERSATION_COLUMNS: &str =
    "id, visitor_id, visitor_name, visitor_metadata, operator_id, operator_name,
     status, close_reason, created_at, last_activity_at, accepted_at, closed_at";

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_role, sender_id, sender_name, content, status,
     reply_to, created_at, read_at";

/// Repository for the durable conversation/message mirror.
pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or update a conversation record. Messages are written separately
    /// through `insert_message`.
    #[instrument(skip(self, conversation), fields(conversation_id = %conversation.id))]
    pub fn upsert(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let metadata = conversation
            .visitor
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations
                    (id, visitor_id, visitor_name, visitor_metadata, operator_id, operator_name,
                     status, close_reason, created_at, last_activity_at, accepted_at, closed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                    visitor_name = excluded.visitor_name,
                    visitor_metadata = excluded.visitor_metadata,
                    operator_id = excluded.operator_id,
                    operator_name = excluded.operator_name,
                    status = excluded.status,
                    close_reason = excluded.close_reason,
                    last_activity_at = excluded.last_activity_at,
                    accepted_at = excluded.accepted_at,
                    closed_at = excluded.closed_at",
                rusqlite::params![
                    conversation.id.as_str(),
                    conversation.visitor.id.as_str(),
                    conversation.visitor.name,
                    metadata,
                    conversation.operator.as_ref().map(|o| o.id.as_str().to_string()),
                    conversation.operator.as_ref().map(|o| o.name.clone()),
                    conversation.status.to_string(),
                    conversation.close_reason,
                    conversation.created_at.to_rfc3339(),
                    conversation.last_activity_at.to_rfc3339(),
                    conversation.accepted_at.map(|t| t.to_rfc3339()),
                    conversation.closed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    /// Get a conversation with its full message history.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: &ConversationId) -> Result<Conversation, StoreError> {
        let mut conversation = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_conversation(row),
                None => Err(StoreError::NotFound(format!("conversation {id}"))),
            }
        })?;
        conversation.messages = self.messages_for(id)?;
        Ok(conversation)
    }

    /// Load all non-closed conversations, message histories included.
    /// Used to seed the in-memory store at startup.
    #[instrument(skip(self))]
    pub fn load_open(&self) -> Result<Vec<Conversation>, StoreError> {
        let mut conversations = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE status != 'closed' ORDER BY created_at ASC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_conversation(row)?);
            }
            Ok(results)
        })?;

        for conversation in &mut conversations {
            conversation.messages = self.messages_for(&conversation.id)?;
        }
        Ok(conversations)
    }

    /// Append a message and bump the owning conversation's activity timestamp.
    #[instrument(skip(self, message), fields(conversation_id = %message.conversation_id, message_id = %message.id))]
    pub fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let content = serde_json::to_string(&message.content)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO messages
                    (id, conversation_id, sender_role, sender_id, sender_name, content,
                     status, reply_to, created_at, read_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    message.id.as_str(),
                    message.conversation_id.as_str(),
                    message.sender.role.to_string(),
                    message.sender.id,
                    message.sender.name,
                    content,
                    message.status.to_string(),
                    message.reply_to.as_ref().map(|r| r.as_str().to_string()),
                    message.created_at.to_rfc3339(),
                    message.read_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            conn.execute(
                "UPDATE conversations SET last_activity_at = ?1 WHERE id = ?2",
                rusqlite::params![
                    message.created_at.to_rfc3339(),
                    message.conversation_id.as_str()
                ],
            )?;
            Ok(())
        })
    }

    /// Advance delivery status for a batch of messages.
    #[instrument(skip(self, message_ids), fields(count = message_ids.len(), status = %status))]
    pub fn update_message_status(
        &self,
        message_ids: &[MessageId],
        status: DeliveryStatus,
        read_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            for id in message_ids {
                conn.execute(
                    "UPDATE messages SET status = ?1, read_at = COALESCE(?2, read_at) WHERE id = ?3",
                    rusqlite::params![
                        status.to_string(),
                        read_at.map(|t| t.to_rfc3339()),
                        id.as_str()
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// All messages of a conversation, oldest first.
    pub fn messages_for(&self, id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 ORDER BY created_at ASC, id ASC"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<Conversation, StoreError> {
    let status_str: String = row_helpers::get(row, 6, "conversations", "status")?;
    let metadata = row_helpers::get_opt::<String>(row, 3, "conversations", "visitor_metadata")?
        .map(|raw| row_helpers::parse_json(&raw, "conversations", "visitor_metadata"))
        .transpose()?;

    let operator_id = row_helpers::get_opt::<String>(row, 4, "conversations", "operator_id")?;
    let operator = match operator_id {
        Some(id) => Some(OperatorProfile {
            id: OperatorId::from_raw(id),
            name: row_helpers::get_opt::<String>(row, 5, "conversations", "operator_name")?
                .unwrap_or_default(),
            avatar: None,
        }),
        None => None,
    };

    let created_at_str: String = row_helpers::get(row, 8, "conversations", "created_at")?;
    let activity_str: String = row_helpers::get(row, 9, "conversations", "last_activity_at")?;

    Ok(Conversation {
        id: ConversationId::from_raw(row_helpers::get::<String>(row, 0, "conversations", "id")?),
        visitor: VisitorProfile {
            id: VisitorId::from_raw(row_helpers::get::<String>(row, 1, "conversations", "visitor_id")?),
            name: row_helpers::get(row, 2, "conversations", "visitor_name")?,
            metadata,
        },
        operator,
        status: row_helpers::parse_enum(&status_str, "conversations", "status")?,
        messages: Vec::new(),
        last_message: None,
        typing: TypingState::default(),
        created_at: row_helpers::parse_timestamp(&created_at_str, "conversations", "created_at")?,
        last_activity_at: row_helpers::parse_timestamp(&activity_str, "conversations", "last_activity_at")?,
        accepted_at: row_helpers::get_opt::<String>(row, 10, "conversations", "accepted_at")?
            .map(|raw| row_helpers::parse_timestamp(&raw, "conversations", "accepted_at"))
            .transpose()?,
        closed_at: row_helpers::get_opt::<String>(row, 11, "conversations", "closed_at")?
            .map(|raw| row_helpers::parse_timestamp(&raw, "conversations", "closed_at"))
            .transpose()?,
        close_reason: row_helpers::get_opt(row, 7, "conversations", "close_reason")?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let role_str: String = row_helpers::get(row, 2, "messages", "sender_role")?;
    let content_raw: String = row_helpers::get(row, 5, "messages", "content")?;
    let status_str: String = row_helpers::get(row, 6, "messages", "status")?;
    let created_at_str: String = row_helpers::get(row, 8, "messages", "created_at")?;

    let content: MessageContent = row_helpers::parse_json(&content_raw, "messages", "content")?;

    Ok(Message {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(
            row, 1, "messages", "conversation_id",
        )?),
        sender: Sender {
            role: row_helpers::parse_enum(&role_str, "messages", "sender_role")?,
            id: row_helpers::get(row, 3, "messages", "sender_id")?,
            name: row_helpers::get(row, 4, "messages", "sender_name")?,
        },
        content,
        status: row_helpers::parse_enum(&status_str, "messages", "status")?,
        reply_to: row_helpers::get_opt::<String>(row, 7, "messages", "reply_to")?
            .map(MessageId::from_raw),
        created_at: row_helpers::parse_timestamp(&created_at_str, "messages", "created_at")?,
        read_at: row_helpers::get_opt::<String>(row, 9, "messages", "read_at")?
            .map(|raw| row_helpers::parse_timestamp(&raw, "messages", "read_at"))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::Role;

    fn setup() -> (ConversationRepo, Conversation) {
        let db = Database::in_memory().unwrap();
        let repo = ConversationRepo::new(db);
        let conversation = Conversation::new(VisitorProfile::new(
            VisitorId::from_raw("vis_test"),
            Some("Ada".into()),
            Some(serde_json::json!({"page": "/pricing"})),
        ));
        (repo, conversation)
    }

    fn visitor_message(conversation: &Conversation, text: &str) -> Message {
        Message::new(
            conversation.id.clone(),
            Sender { role: Role::Visitor, id: "vis_test".into(), name: "Ada".into() },
            MessageContent::Text { text: text.into() },
            None,
        )
    }

    #[test]
    fn upsert_and_get_roundtrip() {
        let (repo, conversation) = setup();
        repo.upsert(&conversation).unwrap();

        let fetched = repo.get(&conversation.id).unwrap();
        assert_eq!(fetched.id, conversation.id);
        assert_eq!(fetched.visitor.name, "Ada");
        assert_eq!(fetched.status, conversation.status);
        assert_eq!(
            fetched.visitor.metadata.unwrap()["page"],
            serde_json::json!("/pricing")
        );
    }

    #[test]
    fn get_missing_conversation_fails() {
        let (repo, _) = setup();
        let result = repo.get(&ConversationId::from_raw("conv_missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn upsert_twice_updates_in_place() {
        let (repo, mut conversation) = setup();
        repo.upsert(&conversation).unwrap();

        conversation.visitor.name = "Ada L.".into();
        conversation.status = relay_core::ConversationStatus::Active;
        conversation.operator = Some(OperatorProfile {
            id: OperatorId::from_raw("op_1"),
            name: "Jo".into(),
            avatar: None,
        });
        repo.upsert(&conversation).unwrap();

        let fetched = repo.get(&conversation.id).unwrap();
        assert_eq!(fetched.visitor.name, "Ada L.");
        assert_eq!(fetched.status, relay_core::ConversationStatus::Active);
        assert_eq!(fetched.operator.unwrap().id.as_str(), "op_1");
    }

    #[test]
    fn insert_message_and_read_back() {
        let (repo, conversation) = setup();
        repo.upsert(&conversation).unwrap();

        let msg = visitor_message(&conversation, "hello");
        repo.insert_message(&msg).unwrap();

        let messages = repo.messages_for(&conversation.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, msg.id);
        assert!(matches!(&messages[0].content, MessageContent::Text { text } if text == "hello"));
        assert_eq!(messages[0].status, DeliveryStatus::Sent);
    }

    #[test]
    fn insert_message_bumps_activity() {
        let (repo, conversation) = setup();
        repo.upsert(&conversation).unwrap();

        let msg = visitor_message(&conversation, "ping");
        repo.insert_message(&msg).unwrap();

        let fetched = repo.get(&conversation.id).unwrap();
        assert_eq!(fetched.last_activity_at, msg.created_at);
    }

    #[test]
    fn messages_ordered_by_creation() {
        let (repo, conversation) = setup();
        repo.upsert(&conversation).unwrap();

        for text in ["one", "two", "three"] {
            repo.insert_message(&visitor_message(&conversation, text)).unwrap();
        }

        let messages = repo.messages_for(&conversation.id).unwrap();
        let texts: Vec<_> = messages
            .iter()
            .map(|m| match &m.content {
                MessageContent::Text { text } => text.clone(),
                _ => panic!("unexpected content"),
            })
            .collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn update_message_status_sets_read() {
        let (repo, conversation) = setup();
        repo.upsert(&conversation).unwrap();

        let msg = visitor_message(&conversation, "read me");
        repo.insert_message(&msg).unwrap();

        let read_at = Utc::now();
        repo.update_message_status(&[msg.id.clone()], DeliveryStatus::Read, Some(read_at))
            .unwrap();

        let messages = repo.messages_for(&conversation.id).unwrap();
        assert_eq!(messages[0].status, DeliveryStatus::Read);
        assert!(messages[0].read_at.is_some());
    }

    #[test]
    fn load_open_skips_closed() {
        let (repo, conversation) = setup();
        repo.upsert(&conversation).unwrap();

        let mut closed = Conversation::new(VisitorProfile::new(
            VisitorId::from_raw("vis_other"),
            None,
            None,
        ));
        closed.status = relay_core::ConversationStatus::Closed;
        closed.closed_at = Some(Utc::now());
        repo.upsert(&closed).unwrap();

        let open = repo.load_open().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, conversation.id);
    }

    #[test]
    fn load_open_includes_messages() {
        let (repo, conversation) = setup();
        repo.upsert(&conversation).unwrap();
        repo.insert_message(&visitor_message(&conversation, "persisted")).unwrap();

        let open = repo.load_open().unwrap();
        assert_eq!(open[0].messages.len(), 1);
    }

    #[test]
    fn system_message_roundtrip() {
        let (repo, conversation) = setup();
        repo.upsert(&conversation).unwrap();

        let msg = Message::system(conversation.id.clone(), "Operator Jo joined the conversation");
        repo.insert_message(&msg).unwrap();

        let messages = repo.messages_for(&conversation.id).unwrap();
        assert_eq!(messages[0].sender.role, Role::System);
        assert!(matches!(
            &messages[0].content,
            MessageContent::SystemAction { action } if action.contains("joined")
        ));
    }
}
