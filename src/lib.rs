//! Container update management across local and remote Docker endpoints.

pub mod compose;
pub mod config;
pub mod detection;
pub mod error;
pub mod executor;
pub mod hosts;
pub mod image_ref;
pub mod policy;
pub mod registry;
pub mod runtime;
pub mod types;
pub mod version;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
