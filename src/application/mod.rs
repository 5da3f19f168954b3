pub mod actions;
pub mod commands;
pub mod handlers;
pub mod queries;

pub use actions::{ActionDispatcher, ActionRequest, ActionResponse, ClientAction};
pub use handlers::{ChatCommandHandler, ChatQueryHandler};
