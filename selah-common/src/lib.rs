//! # Selah Common Library
//!
//! Shared code for Selah services including:
//! - Error types
//! - Event types (SelahEvent enum) and EventBus
//! - Bootstrap configuration loading
//! - Database initialization and schema

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
