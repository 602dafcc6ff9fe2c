pub mod config;
pub mod logging;
pub mod paths;

pub use config::{
    CatalogConfig, Config, ConfigError, LogLevel, LoggingConfig, SupervisorConfig, ValidationError,
};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use paths::{AppDirs, DirsError};

pub const APP_NAME: &str = "hostlink";
pub const APP_AUTHOR: &str = "Hostlink";
pub const APP_QUALIFIER: &str = "io";
