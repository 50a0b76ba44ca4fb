/// Application name
pub const APP_NAME: &str = "Plexus";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "plexus.toml";

/// Environment variable overriding the log filter of the binary
pub const LOG_ENV_VAR: &str = "RUST_LOG";
