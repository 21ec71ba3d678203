//! # Tally Common Library
//!
//! Shared code for the Tally categorization services including:
//! - Transaction, vendor rule and audit decision models
//! - Configuration loading (TOML bootstrap)
//! - Database bootstrap for the tables the engine reads and writes
//! - Common error type

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod models;

pub use error::{Error, Result};
