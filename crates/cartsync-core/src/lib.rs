pub mod cart;
pub mod catalog;
pub mod errors;
pub mod events;
pub mod ids;
pub mod machine;
pub mod money;

pub use cart::{Cart, CartLine, CartSnapshot, LineKey, SelectedOption};
pub use catalog::{Catalog, CatalogItem, CatalogOption, InMemoryCatalog, Selection};
pub use errors::{CartError, CatalogError};
pub use machine::{CartLimits, CartMachine, Mutation};
pub use money::Money;
