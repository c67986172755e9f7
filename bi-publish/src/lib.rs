pub mod cli;
pub mod load_config;
pub mod resolver;

pub use cli::{run, Cli, Commands};
