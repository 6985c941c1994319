pub mod app;
pub mod config;
pub mod porkbun;
pub mod report;
pub mod tracing;

pub use app::{SyncApp, SyncOptions};
pub use config::ConfigToml;
pub use porkbun::PorkbunClient;
