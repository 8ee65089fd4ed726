//! Runs the annotation pass over a set of source files.

use crate::annotate::DeclHandler;
use crate::edit::{EditError, EditSet, RewrittenBuffer};
use crate::frontend::{self, CompilationDatabase, CompileCommand, FrontendError};
use crate::frontend::compile_db::normalize;
use crate::matcher::MatchFinder;
use crate::source::decode_source;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Why one source file produced no edits.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Frontend(#[from] FrontendError),

    #[error(transparent)]
    Edit(#[from] EditError),
}

#[derive(Debug, Clone, Default)]
pub struct DriverOptions {
    pub require_at_least_one_field: bool,
    /// Appended to every compile command.
    pub extra_args: Vec<String>,
}

#[derive(Debug)]
pub enum FileStatus {
    Annotated { matches: usize, edits: usize },
    /// No compile command covers the file.
    Skipped,
    Failed(DriverError),
}

#[derive(Debug)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub status: FileStatus,
}

/// Everything a run produced.
#[derive(Debug, Default)]
pub struct RunReport {
    pub edits: EditSet,
    pub outcomes: Vec<FileOutcome>,
    contents: BTreeMap<PathBuf, Arc<[u8]>>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.count(|status| matches!(status, FileStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|status| matches!(status, FileStatus::Skipped))
    }

    fn count(&self, pred: impl Fn(&FileStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// 1 if any file failed, 2 if files were skipped, 0 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.failed() > 0 {
            1
        } else if self.skipped() > 0 {
            2
        } else {
            0
        }
    }

    /// The bytes a main file had when it was processed.
    pub fn original(&self, path: &Path) -> Option<&[u8]> {
        self.contents.get(path).map(|bytes| &**bytes)
    }

    /// Every file with edits, rewritten, in path order.
    pub fn rewritten_buffers(&self) -> Result<Vec<RewrittenBuffer>, EditError> {
        self.edits
            .files()
            .filter_map(|file| self.contents.get(file).map(|bytes| (file, bytes)))
            .map(|(file, bytes)| self.edits.apply(file, &**bytes))
            .collect()
    }
}

pub struct Driver {
    database: CompilationDatabase,
    options: DriverOptions,
}

impl Driver {
    pub fn new(database: CompilationDatabase, options: DriverOptions) -> Self {
        Self { database, options }
    }

    /// Process every source in order. Failures are recorded per file and
    /// never stop the run.
    pub fn run(&self, sources: &[PathBuf]) -> RunReport {
        let handler = DeclHandler;
        let mut finder = MatchFinder::new();
        handler.register(&mut finder, self.options.require_at_least_one_field);

        let mut report = RunReport::default();
        let mut seen = HashSet::new();

        for source in sources {
            let path = absolute(source);
            if !seen.insert(path.clone()) {
                debug!(file = %path.display(), "already processed");
                continue;
            }

            let status = match self.compile_command(&path) {
                None => {
                    warn!(file = %path.display(), "no compile command found, skipping");
                    FileStatus::Skipped
                }
                Some(command) => match self.process(&finder, &command, &mut report) {
                    Ok((matches, edits)) => {
                        info!(file = %path.display(), matches, edits, "annotated");
                        FileStatus::Annotated { matches, edits }
                    }
                    Err(err) => {
                        error!(file = %path.display(), "{err}");
                        FileStatus::Failed(err)
                    }
                },
            };
            report.outcomes.push(FileOutcome { path, status });
        }

        report
    }

    fn compile_command(&self, path: &Path) -> Option<CompileCommand> {
        let mut command = self.database.compile_command(path)?;
        command.arguments.extend(self.options.extra_args.iter().cloned());
        Some(command)
    }

    /// Annotate one file. Edits only reach the report if the whole file
    /// succeeds.
    ///
    /// The front end sees a decoded view whose offsets match the raw bytes;
    /// edits are tracked against and applied to the raw bytes.
    fn process(
        &self,
        finder: &MatchFinder<'_>,
        command: &CompileCommand,
        report: &mut RunReport,
    ) -> Result<(usize, usize), DriverError> {
        let path = &command.file;
        let bytes: Arc<[u8]> = fs::read(path)
            .map_err(|source| DriverError::Io {
                path: path.clone(),
                source,
            })?
            .into();
        let text: Arc<str> = Arc::from(decode_source(&bytes));

        let unit = frontend::parse_translation_unit(command, text)?;
        debug!(file = %path.display(), decls = unit.len() - 1, "parsed translation unit");

        let mut local = EditSet::new();
        local.track_file(path, &*bytes)?;
        let matches = finder.match_ast(&unit, &mut local)?;

        report.edits.track_file(path, &*bytes)?;
        for edit in local.iter() {
            report.edits.insert(edit.clone())?;
        }
        report.contents.insert(path.clone(), bytes);
        Ok((matches, local.len()))
    }
}

fn absolute(path: &Path) -> PathBuf {
    let resolved = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    normalize(&resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> CompilationDatabase {
        CompilationDatabase::fixed("/", Vec::new())
    }

    #[test]
    fn annotates_and_reports_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.cpp");
        fs::write(&file, "struct Foo { int x; };\n").unwrap();

        let report = Driver::new(fixed(), DriverOptions::default()).run(&[file.clone()]);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.edits.len(), 2);

        let buffers = report.rewritten_buffers().unwrap();
        assert_eq!(buffers.len(), 1);
        assert_eq!(
            buffers[0].text(),
            "/* this is the CXXRecordDecl Foo */struct Foo { /* this is the FieldDecl Foo::x */int x; };\n"
        );
        assert_eq!(
            report.original(&file),
            Some(&b"struct Foo { int x; };\n"[..])
        );
    }

    #[test]
    fn failures_do_not_stop_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.cpp");
        let good = dir.path().join("good.cpp");
        fs::write(&bad, "struct { ) ;\n").unwrap();
        fs::write(&good, "struct Ok {};\n").unwrap();

        let report = Driver::new(fixed(), DriverOptions::default()).run(&[bad.clone(), good.clone()]);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.exit_code(), 1);
        assert!(report.edits.edits_for(&bad).is_empty());
        assert_eq!(report.edits.edits_for(&good).len(), 1);
        assert!(matches!(
            report.outcomes[0].status,
            FileStatus::Failed(DriverError::Frontend(FrontendError::Syntax { .. }))
        ));
    }

    #[test]
    fn non_utf8_main_file_is_annotated() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("latin1.cpp");
        let bytes: &[u8] = b"// caf\xe9\nstruct Foo { int x; };\n";
        fs::write(&file, bytes).unwrap();

        let report = Driver::new(fixed(), DriverOptions::default()).run(&[file.clone()]);
        assert_eq!(report.exit_code(), 0);
        let offsets: Vec<_> = report.edits.iter().map(|e| e.byte_start).collect();
        assert_eq!(offsets, vec![8, 21]);

        let buffers = report.rewritten_buffers().unwrap();
        assert_eq!(
            buffers[0].bytes,
            b"// caf\xe9\n/* this is the CXXRecordDecl Foo */struct Foo { /* this is the FieldDecl Foo::x */int x; };\n".to_vec()
        );
        assert_eq!(report.original(&file), Some(bytes));
    }

    #[test]
    fn missing_compile_command_skips() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.cpp");
        fs::write(&file, "struct Foo {};\n").unwrap();
        let db = CompilationDatabase::from_json(Path::new("db.json"), "[]").unwrap();

        let report = Driver::new(db, DriverOptions::default()).run(&[file]);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.exit_code(), 2);
        assert!(report.edits.is_empty());
    }

    #[test]
    fn unreadable_file_fails() {
        let report = Driver::new(fixed(), DriverOptions::default())
            .run(&[PathBuf::from("/definitely/missing/x.cpp")]);
        assert_eq!(report.exit_code(), 1);
        assert!(matches!(
            report.outcomes[0].status,
            FileStatus::Failed(DriverError::Io { .. })
        ));
    }

    #[test]
    fn extra_args_and_field_requirement() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.cpp");
        fs::write(
            &file,
            "struct Empty {};\n#ifdef WITH_FULL\nstruct Full { int v; };\n#endif\n",
        )
        .unwrap();

        let options = DriverOptions {
            require_at_least_one_field: true,
            extra_args: vec!["-DWITH_FULL".into()],
        };
        let report = Driver::new(fixed(), options).run(&[file.clone(), file.clone()]);
        assert_eq!(report.outcomes.len(), 1);
        let texts: Vec<_> = report.edits.iter().map(|e| e.new_text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "/* this is the CXXRecordDecl Full */",
                "/* this is the FieldDecl Full::v */"
            ]
        );
    }
}
