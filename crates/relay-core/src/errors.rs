/// Typed error taxonomy for routing operations. Every variant is recoverable
/// and local: it becomes an `error` event to the originating connection and
/// never touches shared state (validation happens before any mutation).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("not registered or wrong role for this action")]
    Unauthorized,
    #[error("unknown role: {0}")]
    InvalidRole(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("conversation already assigned")]
    AlreadyAssigned,
    #[error("conversation is closed")]
    ConversationClosed,
    #[error("conversation not found")]
    ConversationNotFound,
    #[error("target operator has no live connection")]
    OperatorUnavailable,
    #[error("validation failed: {0}")]
    Validation(String),
}

impl RoutingError {
    /// Stable string code carried in the outbound `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::InvalidRole(_) => "invalid_role",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::AlreadyAssigned => "already_assigned",
            Self::ConversationClosed => "conversation_closed",
            Self::ConversationNotFound => "conversation_not_found",
            Self::OperatorUnavailable => "operator_unavailable",
            Self::Validation(_) => "validation_error",
        }
    }
}
