pub mod auth;
pub mod codec;
pub mod config;
pub mod error;
pub mod event_router;
pub mod host_link;
pub mod http;
pub mod multiplexer;
pub mod registry;
pub mod state;
pub mod subscriptions;
pub mod temperature;

pub use state::AppState;
