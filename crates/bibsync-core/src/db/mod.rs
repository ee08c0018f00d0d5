//! Local store: connection setup, schema and transactional requests

mod connection;
mod migrations;
pub mod requests;
mod store;

pub use connection::Database;
pub use store::{DbRequest, LibraryStore, StoreContext, StoreEvent};
