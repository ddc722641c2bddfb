//! Command implementations.

pub mod maintenance;
