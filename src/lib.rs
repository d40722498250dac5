// Core modules
pub mod advisor;
pub mod config;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod market;
pub mod models;
pub mod monitor;
pub mod ratelimit;
pub mod scheduler;
pub mod server;
pub mod state;

pub use error::BotError;

pub type Result<T> = std::result::Result<T, BotError>;
