//! Integration tests for the command-line interface
//!
//! Runs the built binary against small projects in temp directories.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const FOO: &str = "struct Foo { int x; };\n";
const FOO_ANNOTATED: &str =
    "/* this is the CXXRecordDecl Foo */struct Foo { /* this is the FieldDecl Foo::x */int x; };\n";

/// Helper to create a workspace holding one source file
fn setup_workspace(source: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("main.cpp");
    fs::write(&file, source).unwrap();
    (dir, file)
}

/// Run the binary from `cwd` with colors disabled
fn run(cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_decl-annotate"))
        .current_dir(cwd)
        .arg("--no-color")
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run decl-annotate")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_help_lists_options() {
    let dir = TempDir::new().unwrap();
    let output = run(dir.path(), &["--help"]);

    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("--build-path"));
    assert!(text.contains("--require-field"));
    assert!(text.contains("--in-place"));
}

#[test]
fn test_prints_edits_and_rewrite_buffer() {
    let (dir, file) = setup_workspace(FOO);
    let path = file.to_str().unwrap();

    let output = run(dir.path(), &[path, "--", "-std=c++17"]);
    assert_eq!(output.status.code(), Some(0));

    let text = stdout(&output);
    let expected = format!(
        "Edits collected by the tool:\n\
         {path}:0:0:\"/* this is the CXXRecordDecl Foo */\"\n\
         {path}:13:0:\"/* this is the FieldDecl Foo::x */\"\n\
         Rewrite buffer for file: {path}\n\
         {FOO_ANNOTATED}\n"
    );
    assert_eq!(text, expected);

    // without --in-place the file is untouched
    assert_eq!(fs::read_to_string(&file).unwrap(), FOO);
}

#[test]
fn test_no_rewrite_prints_only_edits() {
    let (dir, file) = setup_workspace(FOO);

    let output = run(dir.path(), &[file.to_str().unwrap(), "--no-rewrite", "--", "-xc++"]);
    assert!(output.status.success());

    let text = stdout(&output);
    assert!(text.starts_with("Edits collected by the tool:\n"));
    assert_eq!(text.lines().count(), 3);
    assert!(!text.contains("Rewrite buffer for file"));
}

#[test]
fn test_json_output() {
    let (dir, file) = setup_workspace(FOO);

    let output = run(
        dir.path(),
        &[file.to_str().unwrap(), "--format", "json", "--", "-xc++"],
    );
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let edits = json["edits"].as_array().unwrap();
    assert_eq!(edits.len(), 2);
    assert_eq!(edits[0]["offset"], 0);
    assert_eq!(edits[0]["length"], 0);
    assert_eq!(edits[1]["offset"], 13);
    assert_eq!(edits[1]["text"], "/* this is the FieldDecl Foo::x */");
    assert_eq!(json["buffers"][0]["text"], FOO_ANNOTATED);
}

#[test]
fn test_in_place_rewrites_file() {
    let (dir, file) = setup_workspace(FOO);

    let output = run(
        dir.path(),
        &[file.to_str().unwrap(), "--in-place", "--no-rewrite", "--", "-xc++"],
    );
    assert!(output.status.success());
    assert_eq!(fs::read_to_string(&file).unwrap(), FOO_ANNOTATED);
}

#[test]
fn test_in_place_keeps_non_utf8_bytes() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("latin1.cpp");
    fs::write(&file, b"// caf\xe9\nstruct Foo { int x; };\n").unwrap();

    let output = run(
        dir.path(),
        &[file.to_str().unwrap(), "--in-place", "--no-rewrite", "--", "-xc++"],
    );
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains(":8:0:\"/* this is the CXXRecordDecl Foo */\""));
    assert_eq!(
        fs::read(&file).unwrap(),
        b"// caf\xe9\n/* this is the CXXRecordDecl Foo */struct Foo { /* this is the FieldDecl Foo::x */int x; };\n".to_vec()
    );
}

#[test]
fn test_failure_suppresses_output() {
    let dir = TempDir::new().unwrap();
    let good = dir.path().join("good.cpp");
    let bad = dir.path().join("bad.cpp");
    fs::write(&good, FOO).unwrap();
    fs::write(&bad, "#include \"missing.h\"\n").unwrap();

    let output = run(
        dir.path(),
        &[good.to_str().unwrap(), bad.to_str().unwrap(), "--", "-xc++"],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed"));
}

#[test]
fn test_file_missing_from_database_is_skipped() {
    let (dir, file) = setup_workspace(FOO);
    fs::write(dir.path().join("compile_commands.json"), "[]").unwrap();

    let output = run(dir.path(), &[file.to_str().unwrap(), "-p", "."]);
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(stdout(&output), "Edits collected by the tool:\n");
}

#[test]
fn test_directory_input_and_config_file() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    fs::write(src.join("a.cpp"), "struct Empty {};\n").unwrap();
    fs::write(src.join("b.cc"), FOO).unwrap();
    fs::write(src.join("notes.txt"), "struct Ignored {};\n").unwrap();
    fs::write(
        dir.path().join(".decl-annotate.toml"),
        "[matcher]\nrequire_at_least_one_field = true\n\n[output]\nrewrite_buffers = false\n",
    )
    .unwrap();

    let output = run(dir.path(), &["src", "--", "-xc++"]);
    assert!(output.status.success());

    let text = stdout(&output);
    assert!(!text.contains("Empty"));
    assert!(!text.contains("Ignored"));
    assert!(text.contains("b.cc:0:0:\"/* this is the CXXRecordDecl Foo */\""));
    assert!(!text.contains("Rewrite buffer"));
}

#[test]
fn test_invalid_config_is_an_error() {
    let (dir, file) = setup_workspace(FOO);
    fs::write(dir.path().join(".decl-annotate.toml"), "[matcher]\nbogus = 1\n").unwrap();

    let output = run(dir.path(), &[file.to_str().unwrap(), "--", "-xc++"]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}
