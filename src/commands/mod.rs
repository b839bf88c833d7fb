//! Subcommand implementations

pub mod cleanup;
pub mod limits;
pub mod simulate;
pub mod status;
