pub mod external;
pub mod messaging;
pub mod outbox;
pub mod persistence;
