//! Conveyor core
//!
//! Core domain types, traits, and error handling for Conveyor.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod condition;
pub mod definition;
pub mod error;
pub mod event;
pub mod ids;
pub mod ports;
pub mod run;

pub use error::{Error, Result};
pub use ids::*;
