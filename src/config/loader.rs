use crate::config::schema::{Settings, ValidationError};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Settings file looked up in the working directory when `--config` is not
/// given.
pub const DEFAULT_CONFIG_FILE: &str = ".decl-annotate.toml";

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Toml {
        path: Option<PathBuf>,
        source: toml_edit::de::Error,
    },
    Validation {
        path: Option<PathBuf>,
        source: ValidationError,
    },
}

impl ConfigError {
    fn with_path(self, path: &Path) -> Self {
        let path = path.to_path_buf();
        match self {
            ConfigError::Io { .. } => self,
            ConfigError::Toml { path: None, source } => ConfigError::Toml {
                path: Some(path),
                source,
            },
            ConfigError::Validation { path: None, source } => ConfigError::Validation {
                path: Some(path),
                source,
            },
            other => other,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read settings from {}: {}", path.display(), source)
            }
            ConfigError::Toml { path, source } => match path {
                Some(path) => write!(
                    f,
                    "failed to parse settings TOML ({}): {}",
                    path.display(),
                    source
                ),
                None => write!(f, "failed to parse settings TOML: {}", source),
            },
            ConfigError::Validation { path, source } => match path {
                Some(path) => write!(f, "invalid settings ({}): {}", path.display(), source),
                None => write!(f, "invalid settings: {}", source),
            },
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Toml { source, .. } => Some(source),
            ConfigError::Validation { source, .. } => Some(source),
        }
    }
}

pub fn load_from_str(input: &str) -> Result<Settings, ConfigError> {
    let settings: Settings = toml_edit::de::from_str(input)
        .map_err(|source| ConfigError::Toml { path: None, source })?;
    settings
        .validate()
        .map_err(|source| ConfigError::Validation { path: None, source })?;
    Ok(settings)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_from_str(&contents).map_err(|error| error.with_path(path))
}

/// Load `dir/.decl-annotate.toml` if it exists.
pub fn load_default(dir: &Path) -> Result<Option<Settings>, ConfigError> {
    let path = dir.join(DEFAULT_CONFIG_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    load_from_path(&path).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::OutputFormat;

    #[test]
    fn full_settings_file() {
        let settings = load_from_str(
            r#"
[matcher]
require_at_least_one_field = true

[output]
format = "json"
rewrite_buffers = false

[compile]
build_path = "build"
extra_args = ["-DFOO", "-Iinclude"]
"#,
        )
        .unwrap();

        assert!(settings.matcher.require_at_least_one_field);
        assert_eq!(settings.output.format, OutputFormat::Json);
        assert!(!settings.output.rewrite_buffers);
        assert_eq!(settings.compile.build_path, Some(PathBuf::from("build")));
        assert_eq!(settings.compile.extra_args, vec!["-DFOO", "-Iinclude"]);
    }

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(load_from_str("").unwrap(), Settings::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = load_from_str("[matcher]\nrequire_field = true\n").unwrap_err();
        assert!(matches!(err, ConfigError::Toml { path: None, .. }));
    }

    #[test]
    fn errors_carry_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, "[output]\ndiff = true\nrewrite_buffers = false\n").unwrap();

        let err = load_default(dir.path()).unwrap_err();
        match &err {
            ConfigError::Validation { path: Some(p), .. } => assert_eq!(p, &path),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(err.to_string().contains(".decl-annotate.toml"));
    }

    #[test]
    fn missing_default_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_default(dir.path()).unwrap().is_none());
    }

    #[test]
    fn missing_explicit_file_is_io_error() {
        let err = load_from_path("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
