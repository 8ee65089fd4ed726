//! Compile commands: where they come from and which flags we honour.
//!
//! Only the flags that change what the preprocessor sees are interpreted
//! (`-I`, `-iquote`, `-isystem`, `-D`, `-U`); everything else is carried along
//! untouched.

use serde::Deserialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub const DATABASE_FILE_NAME: &str = "compile_commands.json";

#[derive(Error, Debug)]
pub enum CompilationDatabaseError {
    #[error("failed to read compilation database {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse compilation database {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("entry for {file} has neither 'arguments' nor 'command'")]
    MissingArguments { file: PathBuf },
}

/// How to compile one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileCommand {
    pub directory: PathBuf,
    pub file: PathBuf,
    pub arguments: Vec<String>,
}

impl CompileCommand {
    pub fn options(&self) -> CompileOptions {
        CompileOptions::from_arguments(&self.arguments, &self.directory)
    }
}

/// A `-D` or `-U` in command-line order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroOp {
    Define { name: String, value: String },
    Undef(String),
}

/// Preprocessor-relevant view of a command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Searched for `#include "..."` only, before `include_dirs`.
    pub quote_dirs: Vec<PathBuf>,
    /// Searched for both include forms.
    pub include_dirs: Vec<PathBuf>,
    pub macros: Vec<MacroOp>,
}

impl CompileOptions {
    pub fn from_arguments(arguments: &[String], directory: &Path) -> Self {
        let mut options = CompileOptions::default();
        let resolve = |dir: &str| normalize(&directory.join(dir));
        let mut args = arguments.iter();

        while let Some(arg) = args.next() {
            let mut take = |flag: &str| -> Option<String> {
                let rest = arg.strip_prefix(flag)?;
                if rest.is_empty() {
                    args.next().cloned()
                } else {
                    Some(rest.to_string())
                }
            };

            if let Some(dir) = take("-iquote") {
                options.quote_dirs.push(resolve(&dir));
            } else if let Some(dir) = take("-isystem") {
                options.include_dirs.push(resolve(&dir));
            } else if let Some(dir) = take("-I") {
                options.include_dirs.push(resolve(&dir));
            } else if let Some(def) = take("-D") {
                let (name, value) = match def.split_once('=') {
                    Some((name, value)) => (name.to_string(), value.to_string()),
                    None => (def, "1".to_string()),
                };
                options.macros.push(MacroOp::Define { name, value });
            } else if let Some(name) = take("-U") {
                options.macros.push(MacroOp::Undef(name));
            }
        }

        options
    }
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    directory: PathBuf,
    file: PathBuf,
    #[serde(default)]
    arguments: Option<Vec<String>>,
    #[serde(default)]
    command: Option<String>,
}

/// Source of compile commands for the files being processed.
#[derive(Debug, Clone)]
pub enum CompilationDatabase {
    /// The same flags for every file (`-- <flags>` on the command line).
    Fixed {
        directory: PathBuf,
        arguments: Vec<String>,
    },
    /// Entries loaded from a `compile_commands.json`.
    Json {
        path: PathBuf,
        commands: Vec<CompileCommand>,
    },
}

impl CompilationDatabase {
    pub fn fixed(directory: impl Into<PathBuf>, arguments: Vec<String>) -> Self {
        CompilationDatabase::Fixed {
            directory: directory.into(),
            arguments,
        }
    }

    /// Load from a `compile_commands.json` path or the directory holding one.
    pub fn load(path: &Path) -> Result<Self, CompilationDatabaseError> {
        let path = if path.is_dir() {
            path.join(DATABASE_FILE_NAME)
        } else {
            path.to_path_buf()
        };
        let text = fs::read_to_string(&path).map_err(|source| CompilationDatabaseError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_json(&path, &text)
    }

    pub fn from_json(path: &Path, text: &str) -> Result<Self, CompilationDatabaseError> {
        let entries: Vec<RawEntry> =
            serde_json::from_str(text).map_err(|source| CompilationDatabaseError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        let commands = entries
            .into_iter()
            .map(|entry| {
                let arguments = match (entry.arguments, entry.command) {
                    (Some(arguments), _) => arguments,
                    (None, Some(command)) => split_command(&command),
                    (None, None) => {
                        return Err(CompilationDatabaseError::MissingArguments { file: entry.file })
                    }
                };
                let file = normalize(&entry.directory.join(&entry.file));
                Ok(CompileCommand {
                    directory: entry.directory,
                    file,
                    arguments,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CompilationDatabase::Json {
            path: path.to_path_buf(),
            commands,
        })
    }

    /// Look for a `compile_commands.json` in `start` and its ancestors.
    pub fn auto_detect(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(DATABASE_FILE_NAME))
            .find(|candidate| candidate.is_file())
    }

    /// The command for `file`, which should be absolute.
    pub fn compile_command(&self, file: &Path) -> Option<CompileCommand> {
        let file = normalize(file);
        match self {
            CompilationDatabase::Fixed {
                directory,
                arguments,
            } => Some(CompileCommand {
                directory: directory.clone(),
                file,
                arguments: arguments.clone(),
            }),
            CompilationDatabase::Json { commands, .. } => {
                commands.iter().find(|cmd| cmd.file == file).cloned()
            }
        }
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Split a shell-style command string on whitespace, honouring quotes and
/// backslash escapes.
fn split_command(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match (c, quote) {
            ('\\', Some('\'')) => current.push(c),
            ('\\', _) => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
                in_arg = true;
            }
            (q, None) if q == '"' || q == '\'' => {
                quote = Some(q);
                in_arg = true;
            }
            (q, Some(open)) if q == open => quote = None,
            (c, None) if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            (c, _) => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}
