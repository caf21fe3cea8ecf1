pub mod conversations;
pub mod database;
pub mod error;
pub mod mirror;
pub mod row_helpers;
pub mod schema;

pub use conversations::ConversationRepo;
pub use database::Database;
pub use error::StoreError;
pub use mirror::{spawn_mirror, StoreOp};
