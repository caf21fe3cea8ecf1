pub mod conversation;
pub mod errors;
pub mod events;
pub mod identity;
pub mod ids;
pub mod message;

pub use conversation::{Conversation, ConversationSnapshot, ConversationStatus, LastMessageSummary, TypingState};
pub use errors::RoutingError;
pub use events::{ClientEvent, RegistrationSnapshot, ServerEvent};
pub use identity::{OnlineOperator, OperatorProfile, OperatorStatus, Role, VisitorProfile};
pub use ids::{ConnectionId, ConversationId, MessageId, OperatorId, VisitorId};
pub use message::{DeliveryStatus, Message, MessageContent, Sender};
