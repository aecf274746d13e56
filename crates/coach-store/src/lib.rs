pub mod conversations;
pub mod credits;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod shadow;
pub mod stores;
pub mod traces;

pub use conversations::ConversationRepo;
pub use credits::CreditRepo;
pub use database::Database;
pub use error::StoreError;
pub use shadow::ShadowRepo;
pub use stores::{ConversationStore, CreditsRpc, ShadowStore, TraceStore};
pub use traces::TraceRepo;
