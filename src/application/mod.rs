//! Application services layer: repository contracts and error mapping.

pub mod error;
pub mod repos;
