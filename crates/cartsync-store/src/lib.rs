pub mod carts;
pub mod database;
pub mod error;
pub mod schema;

pub use carts::{CartRepo, CartStore, MemoryStore};
pub use database::Database;
pub use error::StoreError;
