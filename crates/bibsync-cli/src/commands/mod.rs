pub mod common;
pub mod completions;
pub mod config;
pub mod conflicts;
pub mod status;
pub mod sync;
pub mod transfers;
pub mod upload;
