mod config;
mod daemon;
mod http;

pub use config::{
  expand_env_vars, LoggingSection, ServerSection, ServiceConfig, ShutdownSection, StartupSection,
};
pub use daemon::Daemon;
pub use http::router;
