use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use relay_core::ids::{ConversationId, MessageId};
use relay_core::{Conversation, DeliveryStatus, Message};

use crate::conversations::ConversationRepo;

/// A write destined for the durable mirror. Produced by the routing engine
/// after a successful in-memory mutation.
#[derive(Debug)]
pub enum StoreOp {
    UpsertConversation(Box<Conversation>),
    AppendMessage(Box<Message>),
    MessagesRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
        read_at: DateTime<Utc>,
    },
}

/// Spawn the background task that applies store ops best-effort. A failed
/// write is logged and skipped; routing never waits on or observes the
/// mirror.
pub fn spawn_mirror(repo: ConversationRepo, mut rx: mpsc::UnboundedReceiver<StoreOp>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some(op) = rx.blocking_recv() {
            apply(&repo, op);
        }
        debug!("mirror channel closed, task exiting");
    })
}

fn apply(repo: &ConversationRepo, op: StoreOp) {
    match op {
        StoreOp::UpsertConversation(conversation) => {
            if let Err(e) = repo.upsert(&conversation) {
                warn!(conversation_id = %conversation.id, error = %e, "mirror upsert failed");
            }
        }
        StoreOp::AppendMessage(message) => {
            if let Err(e) = repo.insert_message(&message) {
                warn!(conversation_id = %message.conversation_id, error = %e, "mirror append failed");
            }
        }
        StoreOp::MessagesRead { conversation_id, message_ids, read_at } => {
            if let Err(e) = repo.update_message_status(&message_ids, DeliveryStatus::Read, Some(read_at)) {
                warn!(conversation_id = %conversation_id, error = %e, "mirror read-status update failed");
            }
        }
    }
}
