//! mdmkit Core Library
//!
//! Shared functionality for mdmkit components:
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Common error types

pub mod config;
pub mod db;
pub mod error;

pub use config::{Config, LicenseTier};
pub use error::{Error, Result};
