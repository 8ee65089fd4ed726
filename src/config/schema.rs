use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// Contents of a `.decl-annotate.toml` settings file.
///
/// Every section is optional; command-line flags override what is set here.
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub matcher: MatcherSettings,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub compile: CompileSettings,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MatcherSettings {
    /// Only annotate records that declare at least one field.
    #[serde(default)]
    pub require_at_least_one_field: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default = "default_true")]
    pub rewrite_buffers: bool,
    #[serde(default)]
    pub diff: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            rewrite_buffers: true,
            diff: false,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CompileSettings {
    /// Compilation database directory or file, like `-p`.
    #[serde(default)]
    pub build_path: Option<PathBuf>,
    /// Flags appended to every compile command.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn default_true() -> bool {
    true
}

impl Settings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        if self.output.diff && !self.output.rewrite_buffers {
            issues.push(ValidationIssue::InvalidCombo {
                message: "output.diff requires output.rewrite_buffers".to_string(),
            });
        }
        if self.output.diff && self.output.format == OutputFormat::Json {
            issues.push(ValidationIssue::InvalidCombo {
                message: "output.diff is only available with the text format".to_string(),
            });
        }
        if self.compile.extra_args.iter().any(|arg| arg.trim().is_empty()) {
            issues.push(ValidationIssue::EmptyValue {
                field: "compile.extra_args",
            });
        }
        if self
            .compile
            .build_path
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            issues.push(ValidationIssue::EmptyValue {
                field: "compile.build_path",
            });
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone)]
pub enum ValidationIssue {
    EmptyValue { field: &'static str },
    InvalidCombo { message: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::EmptyValue { field } => write!(f, "'{field}' must not be empty"),
            ValidationIssue::InvalidCombo { message } => {
                write!(f, "invalid settings: {message}")
            }
        }
    }
}
