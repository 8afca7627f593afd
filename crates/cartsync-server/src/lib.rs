pub mod client;
pub mod dispatcher;
pub mod reporter;
pub mod server;
pub mod service;
pub mod sessions;

pub use client::{Channel, Client, ClientRegistry, DeliveryError};
pub use dispatcher::{BroadcastDispatcher, BroadcastReport};
pub use reporter::ErrorReporter;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use service::CartService;
pub use sessions::{SessionRegistry, SessionSlot};
