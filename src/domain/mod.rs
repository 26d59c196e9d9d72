//! Domain layer types and invariants.

pub mod blogs;
pub mod error;
pub mod types;
