//! Port definitions (traits for collaborators)
//!
//! The engine talks to the outside world exclusively through these traits:
//! cloud RPC, the transfer engine, the app callback surface, and the client
//! waiter. Adapters live elsewhere; tests substitute in-memory fakes.

pub mod app_events;
pub mod cloud_client;
pub mod transfer;
pub mod waiter;

pub use app_events::AppEventSink;
pub use cloud_client::CloudClient;
pub use transfer::{TransferEngine, TransferEvent};
pub use waiter::Waiter;
