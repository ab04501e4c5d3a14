// antigravity-relay: multi-account reverse proxy for the Antigravity
// generateContent upstream, exposing OpenAI, Anthropic and Gemini surfaces.

pub mod account;
pub mod common;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod logger;
pub mod mappers;
pub mod middleware;
pub mod oauth;
pub mod pool;
pub mod server;
pub mod signature_cache;
pub mod storage;
pub mod token_service;
pub mod upstream;

pub use config::RelayConfig;
pub use dispatcher::Dispatcher;
pub use error::{RelayError, RelayResult};
pub use server::{AppState, RelayServer};
