//! CLI commands

pub mod profile;
