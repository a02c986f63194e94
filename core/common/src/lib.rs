//! Common utilities and types shared across OfflineKit modules.
//!
//! This module provides the error taxonomy and the value types (rows, primary
//! keys, database names) that every storage and sync component speaks.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{DatabaseName, Key, Row};
