//! Process plumbing shared by the weave binaries: config files, logging
//! and shutdown signals.

pub mod config;
pub mod logging;
pub mod shutdown;

pub use config::{base_dir, load_or_default, logs_dir, save_to_file};
pub use logging::{LoggingConfig, init_logging, init_logging_to_dir};
pub use shutdown::{shutdown_channel, shutdown_signal};
