//! Core domain types and error definitions.
//!
//! Independent of any specific infrastructure concern — database, cache
//! and API layers depend on this module, never the reverse.

pub mod error;
pub mod types;

pub use error::{CoreError, CoreResult};
pub use types::*;
