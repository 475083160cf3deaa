//! Common types for the relay gateway

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
