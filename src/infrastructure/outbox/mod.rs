pub mod memory;
pub mod mongo;

pub use memory::InMemoryOutbox;
pub use mongo::MongoOutbox;
