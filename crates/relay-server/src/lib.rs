pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod hub;
pub mod notify;
pub mod pump;
pub mod router;
pub mod server;
pub mod sessions;

pub use config::{load_config, RelayConfig, ServerSettings};
pub use connection::Connection;
pub use error::ChatError;
pub use hub::Hub;
pub use notify::{notifier_from_settings, Notifier};
pub use server::{build_router, start, AppState, PersistedLogs, ServerHandle};
pub use sessions::ChatService;
