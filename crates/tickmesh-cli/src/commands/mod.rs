//! CLI command implementations.

pub mod analyze;
pub mod config;
pub mod experiment;
pub mod machine;
pub mod run;
pub mod verify;
pub mod version;
