pub mod bots;
pub mod chat;
pub mod config;
pub mod errors;
pub mod github;
pub mod models;
pub mod pipeline;
pub mod publisher;
pub mod store;
