//! HTTP server: JSON API, reasoning and chat endpoints, WebSocket
//! notifications and the preview proxy.

pub mod api;
pub mod app;
pub mod auth;
pub mod db;
pub mod models;
pub mod preview;
pub mod reasoning_api;
pub mod ws;

pub use app::{ServerConfig, build_router, start_server};
