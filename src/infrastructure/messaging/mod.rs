pub mod local_hub;
pub mod redis_publisher;

pub use local_hub::LocalRealtimeHub;
pub use redis_publisher::RedisRealtimePublisher;
