pub mod args;
pub mod cert;
pub mod commands;
pub mod config;
pub mod template;

pub use args::{Cli, Commands};
pub use commands::execute_command;
