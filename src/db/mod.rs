pub mod connection;
pub mod migrations;
pub mod models;
pub mod schema;
pub mod store;

pub use connection::*;
pub use models::*;
pub use store::PhotoStore;
