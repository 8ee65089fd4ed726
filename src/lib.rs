//! decl-annotate: comment every C/C++ record and field declaration.
//!
//! For each translation unit the tool finds struct, class and union
//! declarations and their data members, and inserts
//! `/* this is the CXXRecordDecl ns::Foo */` (or `FieldDecl`) right before
//! each declaration, but only where that text belongs to the main file.
//!
//! # Architecture
//!
//! - [`frontend`] preprocesses and parses a file into an [`ast::TranslationUnit`],
//!   keeping spelling and expansion locations through a [`source::SourceMap`].
//! - [`matcher`] evaluates declarative matchers and hands captures to
//!   [`matcher::MatchCallback`]s.
//! - [`annotate::DeclHandler`] turns matches into insertions.
//! - [`edit::EditSet`] keeps insertions ordered and conflict-free and applies
//!   them with offset-shift bookkeeping.
//! - [`driver::Driver`] runs all of the above over many files.
//!
//! # Example
//!
//! ```no_run
//! use decl_annotate::{CompilationDatabase, Driver, DriverOptions};
//! use std::path::PathBuf;
//!
//! let database = CompilationDatabase::fixed(".", vec!["-Iinclude".to_string()]);
//! let report = Driver::new(database, DriverOptions::default())
//!     .run(&[PathBuf::from("src/main.cpp")]);
//!
//! for buffer in report.rewritten_buffers().unwrap() {
//!     println!("{}", buffer.text());
//! }
//! ```

pub mod annotate;
pub mod ast;
pub mod cache;
pub mod config;
pub mod driver;
pub mod edit;
pub mod frontend;
pub mod matcher;
pub mod pool;
pub mod source;

// Re-exports
pub use annotate::DeclHandler;
pub use ast::{FieldDecl, FromNode, NamespaceDecl, NodeRef, RecordDecl, TranslationUnit};
pub use config::{load_default, load_from_path, load_from_str, ConfigError, Settings};
pub use driver::{Driver, DriverError, DriverOptions, FileStatus, RunReport};
pub use edit::{Edit, EditError, EditRecord, EditSet, EditVerification, InsertOutcome, RewrittenBuffer};
pub use frontend::{CompilationDatabase, CompileCommand, FrontendError};
pub use matcher::{DeclMatcher, MatchCallback, MatchFinder, MatchResult};
pub use source::{SourceLocation, SourceMap};

/// Install the stderr log subscriber.
///
/// `RUST_LOG` wins; otherwise `verbosity` selects info, debug or trace for
/// this crate.
pub fn init_tracing(verbosity: u8) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default = match verbosity {
        0 => "decl_annotate=info",
        1 => "decl_annotate=debug",
        _ => "decl_annotate=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // Ignore a second initialisation (tests, embedding)
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false),
        )
        .try_init();
}
