//! CLI command implementations.

pub mod patch;
pub mod profiles;
pub mod scan;
