pub mod loader;
pub mod schema;

pub use loader::{load_default, load_from_path, load_from_str, ConfigError, DEFAULT_CONFIG_FILE};
pub use schema::{
    CompileSettings, MatcherSettings, OutputFormat, OutputSettings, Settings, ValidationError,
    ValidationIssue,
};
