pub mod conversations;
pub mod in_memory;
pub mod schema;
pub mod sqlite;

pub use conversations::{ConversationStore, ConversationSummary};
pub use in_memory::InMemoryDatastore;
pub use schema::Schemas;
pub use sqlite::SqliteDatastore;
