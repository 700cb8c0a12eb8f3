//! Common utilities shared across modules

pub mod error;
pub mod net;

pub use error::{Error, Result};
