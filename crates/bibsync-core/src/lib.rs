//! bibsync-core - Core library for bibsync
//!
//! This crate contains the local replica of bibliographic libraries, the
//! sync engine that reconciles it with the remote API, and the attachment
//! upload pipeline used by every bibsync interface.

pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod sync;
pub mod upload;
pub mod util;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use models::{Item, Library, LibraryIdentifier};
