pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
pub mod fabric;
pub mod proxy;
pub mod server;
pub mod state;
pub mod transport;
