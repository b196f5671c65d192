pub mod api;
pub mod app;
pub mod cache;
pub mod client;
pub mod config;
pub mod content;
mod http;
pub mod mailbox;
pub mod models;
pub mod output;
pub mod sync;
