//! Common utilities and types shared across the snapkeep crates.
//!
//! This module provides the error type and the small identifier types
//! that every layer of the mount machinery passes around.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{HashId, Password, ProfileId};
