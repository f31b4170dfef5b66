//! Shared error type and small cross-crate helpers for the watchroom backend.

pub mod error;

pub use error::{Error, Result};
