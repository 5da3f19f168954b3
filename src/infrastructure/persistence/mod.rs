pub mod memory;
pub mod mongo;

pub use memory::InMemoryChatStore;
pub use mongo::MongoChatStore;
