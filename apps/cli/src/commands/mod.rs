//! Command implementations for the meshforge CLI.

pub mod models;
pub mod params;
pub mod submit;
