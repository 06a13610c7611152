pub mod config;
pub mod container;
pub mod errors;
pub mod reasoning;
pub mod server;
pub mod workspace;
