mod config_toml;
mod log_level;

pub use config_toml::*;
pub use log_level::{LogLevel, ModuleLevel};
