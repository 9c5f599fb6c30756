pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod presenter;
pub mod session;
pub mod store;
pub mod token;
pub mod typing;

pub use api::{ChatApi, HistorySource};
pub use config::ChatConfig;
pub use connection::{Connection, ConnectionState, RoomSubscription, SubscriptionEvent};
pub use error::{ChatError, Result};
pub use session::{ChatSession, Identity, SessionUpdate};
