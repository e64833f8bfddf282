//! Configures, launches and supervises an external tunnel client as part of a
//! host server's startup.

pub mod cli;
pub mod config;
pub mod host;
pub mod plugin;
pub mod tunneling;

pub use config::{Config, ConfigDir, MainConfig, TunnelClientConfig, TunnelDefinition};
pub use plugin::{HookError, TunnelPlugin};
