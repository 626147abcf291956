pub mod conversation_service;
pub mod memory_store;
pub mod persistence_consumer;

pub use conversation_service::{MembershipStore, MessageStore, PgConversationStore};
pub use memory_store::MemoryConversationStore;
pub use persistence_consumer::PersistenceConsumer;
