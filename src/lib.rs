pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod host;
pub mod model;
pub mod moderation;
pub mod reconcile;
pub mod retry;
pub mod security;
pub mod staleness;
pub mod stream;
