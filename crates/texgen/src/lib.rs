//! The `texgen` command.
//!
//! The binary is a thin wrapper around [`cli::run`]; the pieces live in this
//! library so they can be tested without spawning a process.

pub mod cli;
pub mod discover;
pub mod error;

pub use cli::{run, Cli};
pub use discover::{discover, output_path, RenderJob};
pub use error::CliError;
