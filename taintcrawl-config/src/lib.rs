//! Configuration models and loading for taintcrawl workers.
#![allow(missing_docs)]

pub mod error;
pub mod loader;
pub mod models;
pub mod validation;

pub use error::{ConfigGuardRailError, ConfigLoadError};
pub use loader::db_url::{DatabaseEnv, resolve_database_url};
pub use loader::{CONFIG_JSON_ENV, CONFIG_PATH_ENV, ConfigSource};
pub use models::{
    CaptureSettings, CrashResetPolicy, CrawlerConfig, ExecutorSettings,
    LinkMaximum, LinkSettings, MaxTimeSettings, SchedulerSettings,
    TimeoutSettings,
};
pub use validation::ConfigWarnings;
