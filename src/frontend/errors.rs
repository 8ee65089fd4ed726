use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrontendError {
    #[error("failed to set language for parser")]
    LanguageSet,

    #[error("failed to parse source code")]
    ParseFailed,

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{file}:{line}:{column}: syntax error ({count} ERROR nodes)")]
    Syntax {
        file: PathBuf,
        line: usize,
        column: usize,
        count: usize,
    },

    #[error("{file}:{line}: {kind}")]
    Preprocess {
        file: PathBuf,
        line: usize,
        kind: PreprocessErrorKind,
    },
}

/// Why the preprocessor gave up on a translation unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreprocessErrorKind {
    #[error("'{0}' file not found")]
    IncludeNotFound(String),

    #[error("#include nested too deeply")]
    IncludeDepthExceeded,

    #[error("malformed #include directive")]
    MalformedInclude,

    #[error("malformed #define directive")]
    MalformedDefine,

    #[error("unterminated conditional directive")]
    UnterminatedConditional,

    #[error("#{0} without #if")]
    UnbalancedConditional(&'static str),

    #[error("invalid #if expression: {0}")]
    InvalidCondition(String),

    #[error("unterminated argument list invoking macro '{0}'")]
    UnterminatedInvocation(String),

    #[error("macro '{name}' expects {expected} arguments, got {found}")]
    ArgumentCount {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("#error {0}")]
    ErrorDirective(String),
}
