//! A small C preprocessor that keeps track of where every byte came from.
//!
//! The output is one buffer holding the whole translation unit (included
//! headers inlined, macros expanded, inactive conditional groups dropped)
//! plus a piece table mapping each output range back to either a file
//! offset or a recorded [`MacroExpansion`].
//!
//! Supported: `#include` (quoted and angled, `#pragma once`), object-like and
//! function-like macros with `#`, `##` and `__VA_ARGS__`, `#if`/`#ifdef`/
//! `#ifndef`/`#elif`/`#else`/`#endif` with integer expressions and
//! `defined`, `#undef`, `#error`. Macro invocations are recognised in file
//! text and rescanned inside expansions; an expansion that ends in a
//! function-like macro name is not joined with a `(` that follows it in the
//! file.

use crate::cache;
use crate::frontend::compile_db::{normalize, CompileOptions, MacroOp};
use crate::frontend::errors::{FrontendError, PreprocessErrorKind};
use crate::source::{ExpansionId, FileId, FileLoc, MacroExpansion, SourceLocation, SourceMap, SpellingSpan};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

const MAX_INCLUDE_DEPTH: usize = 200;
const MAX_EXPANSION_DEPTH: usize = 64;

/// Where a run of output text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    File(FileLoc),
    Macro(ExpansionId),
}

#[derive(Debug, Clone, Copy)]
struct Piece {
    start: usize,
    len: usize,
    origin: Origin,
}

/// The preprocessed translation unit.
#[derive(Debug, Clone, Default)]
pub struct Preprocessed {
    pub text: String,
    pieces: Vec<Piece>,
}

impl Preprocessed {
    /// Map an offset in [`Preprocessed::text`] back to a source location.
    pub fn location_at(&self, offset: usize) -> SourceLocation {
        let idx = self.pieces.partition_point(|p| p.start <= offset);
        let Some(piece) = idx.checked_sub(1).map(|i| self.pieces[i]) else {
            return SourceLocation::Invalid;
        };
        let delta = offset - piece.start;
        if delta >= piece.len {
            return SourceLocation::Invalid;
        }
        match piece.origin {
            Origin::File(loc) => SourceLocation::File(FileLoc::new(loc.file, loc.offset + delta)),
            Origin::Macro(expansion) => SourceLocation::Macro {
                expansion,
                offset: delta,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    text: String,
    /// `None` for tokens with no textual origin (pasted, stringized,
    /// command-line definitions).
    spelling: Option<FileLoc>,
    space_before: bool,
}

impl Token {
    fn synthetic(text: impl Into<String>, space_before: bool) -> Self {
        Self {
            text: text.into(),
            spelling: None,
            space_before,
        }
    }

    fn is_ident(&self) -> bool {
        self.text.bytes().next().is_some_and(is_ident_start)
    }

    fn is(&self, text: &str) -> bool {
        self.text == text
    }
}

#[derive(Debug)]
struct MacroDef {
    /// `None` for object-like macros.
    params: Option<Vec<String>>,
    variadic: bool,
    body: Vec<Token>,
}

impl MacroDef {
    fn param_index(&self, token: &Token) -> Option<usize> {
        self.params
            .as_ref()?
            .iter()
            .position(|p| *p == token.text)
    }
}

#[derive(Debug, Clone, Copy)]
struct Conditional {
    parent_active: bool,
    active: bool,
    any_taken: bool,
    seen_else: bool,
}

/// Run the preprocessor over `main_text`, registering every file and
/// expansion in a fresh [`SourceMap`].
pub fn preprocess(
    main_path: &Path,
    main_text: Arc<str>,
    options: &CompileOptions,
) -> Result<(SourceMap, Preprocessed), FrontendError> {
    let mut pp = Preprocessor::new(options);
    pp.define_builtins(main_path);
    let main = pp.source_map.add_file(main_path, main_text, None);
    pp.process_file(main)?;
    Ok((pp.source_map, pp.output))
}

struct Preprocessor<'o> {
    options: &'o CompileOptions,
    source_map: SourceMap,
    output: Preprocessed,
    macros: HashMap<String, Rc<MacroDef>>,
    conditionals: Vec<Conditional>,
    pragma_once: HashSet<PathBuf>,
    include_depth: usize,
}

impl<'o> Preprocessor<'o> {
    fn new(options: &'o CompileOptions) -> Self {
        Self {
            options,
            source_map: SourceMap::new(),
            output: Preprocessed::default(),
            macros: HashMap::new(),
            conditionals: Vec::new(),
            pragma_once: HashSet::new(),
            include_depth: 0,
        }
    }

    fn define_builtins(&mut self, main_path: &Path) {
        let is_cxx = main_path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext, "cc" | "cpp" | "cxx" | "c++" | "C" | "hpp" | "hh" | "hxx"));
        if is_cxx {
            self.define_synthetic("__cplusplus", "201703L");
        }

        for op in &self.options.macros {
            match op {
                MacroOp::Define { name, value } => {
                    let body = lex(value, None);
                    self.macros.insert(
                        name.clone(),
                        Rc::new(MacroDef {
                            params: None,
                            variadic: false,
                            body,
                        }),
                    );
                }
                MacroOp::Undef(name) => {
                    self.macros.remove(name);
                }
            }
        }
    }

    fn define_synthetic(&mut self, name: &str, value: &str) {
        self.macros.insert(
            name.to_string(),
            Rc::new(MacroDef {
                params: None,
                variadic: false,
                body: lex(value, None),
            }),
        );
    }

    fn is_active(&self) -> bool {
        self.conditionals.last().map_or(true, |c| c.active)
    }

    fn error(&self, file: FileId, offset: usize, kind: PreprocessErrorKind) -> FrontendError {
        let (path, line) = match self.source_map.file(file) {
            Some(f) => (f.path.clone(), f.line_column(offset).0),
            None => (PathBuf::new(), 0),
        };
        FrontendError::Preprocess {
            file: path,
            line,
            kind,
        }
    }

    fn push_text(&mut self, text: &str, origin: Origin) {
        if text.is_empty() {
            return;
        }
        self.output.pieces.push(Piece {
            start: self.output.text.len(),
            len: text.len(),
            origin,
        });
        self.output.text.push_str(text);
    }

    fn flush(&mut self, file: FileId, src: &str, from: usize, to: usize) {
        if from < to {
            self.push_text(&src[from..to], Origin::File(FileLoc::new(file, from)));
        }
    }

    fn process_file(&mut self, file: FileId) -> Result<(), FrontendError> {
        let Some(src) = self.source_map.file(file).map(|f| Arc::clone(&f.text)) else {
            return Ok(());
        };
        let bytes = src.as_bytes();
        let len = bytes.len();
        let conditional_depth = self.conditionals.len();

        let mut i = 0;
        let mut copy_from = 0;
        let mut line_start = true;

        while i < len {
            if line_start {
                line_start = false;
                let j = skip_hspace(bytes, i);
                if j < len && bytes[j] == b'#' {
                    if self.is_active() {
                        self.flush(file, &src, copy_from, i);
                    }
                    let end = directive_end(bytes, j + 1);
                    self.directive(file, &src, j + 1, end)?;
                    self.push_text("\n", Origin::File(FileLoc::new(file, end.min(len.saturating_sub(1)))));
                    i = (end + 1).min(len);
                    copy_from = i;
                    line_start = true;
                    continue;
                }
                if !self.is_active() {
                    i = (line_end(bytes, j) + 1).min(len);
                    copy_from = i;
                    line_start = true;
                    continue;
                }
                i = j;
                continue;
            }

            match bytes[i] {
                b'\n' => {
                    line_start = true;
                    i += 1;
                }
                b'/' if bytes.get(i + 1) == Some(&b'/') => i = line_end(bytes, i),
                b'/' if bytes.get(i + 1) == Some(&b'*') => i = block_comment_end(bytes, i),
                b'"' | b'\'' => i = literal_end(bytes, i),
                b if b.is_ascii_digit() => i = number_end(bytes, i),
                b if is_ident_start(b) => {
                    let end = ident_end(bytes, i);
                    if let Some(literal_end) = prefixed_literal_end(&src, i, end) {
                        i = literal_end;
                        continue;
                    }
                    let name = &src[i..end];
                    if let Some(def) = self.macros.get(name).cloned() {
                        if let Some((tokens, next)) =
                            self.expand_in_file(file, &src, name, &def, end)?
                        {
                            self.flush(file, &src, copy_from, i);
                            self.emit_expansion(name, FileLoc::new(file, i), tokens);
                            i = next;
                            copy_from = next;
                            continue;
                        }
                    }
                    i = end;
                }
                _ => i += 1,
            }
        }

        if self.is_active() {
            self.flush(file, &src, copy_from, len);
        }
        if self.conditionals.len() > conditional_depth {
            self.conditionals.truncate(conditional_depth);
            return Err(self.error(file, len, PreprocessErrorKind::UnterminatedConditional));
        }
        Ok(())
    }

    /// Expand the invocation of `name` whose identifier ends at `after_name`.
    ///
    /// Returns the expanded tokens and the offset just past the invocation,
    /// or `None` when a function-like macro name is not followed by `(`.
    fn expand_in_file(
        &self,
        file: FileId,
        src: &str,
        name: &str,
        def: &MacroDef,
        after_name: usize,
    ) -> Result<Option<(Vec<Token>, usize)>, FrontendError> {
        let bytes = src.as_bytes();
        let call_offset = after_name - name.len();
        let mut hide = vec![name.to_string()];

        if def.params.is_none() {
            let tokens = self
                .substitute(def, Vec::new(), &mut hide)
                .and_then(|tokens| self.expand_tokens(tokens, &mut hide))
                .map_err(|kind| self.error(file, call_offset, kind))?;
            return Ok(Some((tokens, after_name)));
        }

        let open = skip_whitespace_and_comments(bytes, after_name);
        if bytes.get(open) != Some(&b'(') {
            return Ok(None);
        }
        let close = matching_paren(bytes, open).ok_or_else(|| {
            self.error(
                file,
                call_offset,
                PreprocessErrorKind::UnterminatedInvocation(name.to_string()),
            )
        })?;

        let arg_tokens = lex(&src[open + 1..close], Some(FileLoc::new(file, open + 1)));
        let tokens = bind_args(name, def, arg_tokens)
            .and_then(|args| self.substitute(def, args, &mut hide))
            .and_then(|tokens| self.expand_tokens(tokens, &mut hide))
            .map_err(|kind| self.error(file, call_offset, kind))?;
        Ok(Some((tokens, close + 1)))
    }

    fn emit_expansion(&mut self, name: &str, call_site: FileLoc, tokens: Vec<Token>) {
        let mut text = String::new();
        let mut spellings = Vec::with_capacity(tokens.len());
        for (n, token) in tokens.into_iter().enumerate() {
            if n > 0 && token.space_before {
                text.push(' ');
            }
            let start = text.len();
            text.push_str(&token.text);
            spellings.push(SpellingSpan {
                range: start..text.len(),
                spelling: token.spelling,
            });
        }

        tracing::trace!(macro_name = name, expansion = %text, "expanded macro");
        if text.is_empty() {
            return;
        }
        let len = text.len();
        let id = self
            .source_map
            .add_expansion(MacroExpansion::new(name, call_site, text.clone(), spellings));
        self.output.pieces.push(Piece {
            start: self.output.text.len(),
            len,
            origin: Origin::Macro(id),
        });
        self.output.text.push_str(&text);
    }

    /// Replace parameters in the body of `def` and perform `#` and `##`.
    fn substitute(
        &self,
        def: &MacroDef,
        args: Vec<Vec<Token>>,
        hide: &mut Vec<String>,
    ) -> Result<Vec<Token>, PreprocessErrorKind> {
        let body = &def.body;
        let mut out: Vec<Token> = Vec::with_capacity(body.len());
        let mut paste_next = false;
        let mut k = 0;

        while k < body.len() {
            let token = &body[k];
            if token.is("##") {
                paste_next = true;
                k += 1;
                continue;
            }

            let stringized = def.params.is_some()
                && token.is("#")
                && body.get(k + 1).and_then(|t| def.param_index(t)).is_some();
            let replacement = if stringized {
                k += 1;
                let idx = def.param_index(&body[k]).unwrap_or_default();
                vec![stringize(&args[idx])]
            } else if let Some(idx) = def.param_index(token) {
                let pasted = paste_next || body.get(k + 1).is_some_and(|t| t.is("##"));
                if pasted {
                    args[idx].clone()
                } else {
                    self.expand_tokens(args[idx].clone(), hide)?
                }
            } else {
                vec![token.clone()]
            };

            let mut replacement = replacement.into_iter();
            if let Some(mut first) = replacement.next() {
                first.space_before = token.space_before;
                match out.last_mut() {
                    Some(last) if paste_next => {
                        last.text.push_str(&first.text);
                        last.spelling = None;
                    }
                    _ => out.push(first),
                }
                out.extend(replacement);
            }
            paste_next = false;
            k += 1;
        }

        Ok(out)
    }

    /// Rescan `tokens`, expanding macros not currently being expanded.
    fn expand_tokens(
        &self,
        tokens: Vec<Token>,
        hide: &mut Vec<String>,
    ) -> Result<Vec<Token>, PreprocessErrorKind> {
        if hide.len() > MAX_EXPANSION_DEPTH || !tokens.iter().any(|t| self.is_expandable(t, hide)) {
            return Ok(tokens);
        }

        let mut out = Vec::with_capacity(tokens.len());
        let mut k = 0;
        while k < tokens.len() {
            let token = &tokens[k];
            let Some(def) = self
                .is_expandable(token, hide)
                .then(|| self.macros.get(&token.text).cloned())
                .flatten()
            else {
                out.push(token.clone());
                k += 1;
                continue;
            };

            let (args, next) = match def.params {
                None => (Vec::new(), k + 1),
                Some(_) => match collect_token_args(&tokens, k + 1) {
                    Some((raw, next)) => (bind_args(&token.text, &def, raw)?, next),
                    None => {
                        out.push(token.clone());
                        k += 1;
                        continue;
                    }
                },
            };

            hide.push(token.text.clone());
            let expanded = self
                .substitute(&def, args, hide)
                .and_then(|body| self.expand_tokens(body, hide));
            hide.pop();

            let mut expanded = expanded?;
            if let Some(first) = expanded.first_mut() {
                first.space_before = token.space_before;
            }
            out.extend(expanded);
            k = next;
        }
        Ok(out)
    }

    fn is_expandable(&self, token: &Token, hide: &[String]) -> bool {
        token.is_ident() && self.macros.contains_key(&token.text) && !hide.contains(&token.text)
    }

    fn directive(
        &mut self,
        file: FileId,
        src: &str,
        start: usize,
        end: usize,
    ) -> Result<(), FrontendError> {
        let tokens = lex(&src[start..end], Some(FileLoc::new(file, start)));
        let Some((name, rest)) = tokens.split_first() else {
            return Ok(());
        };
        let at = start;

        match name.text.as_str() {
            "if" | "ifdef" | "ifndef" => {
                let parent_active = self.is_active();
                let active = parent_active
                    && match name.text.as_str() {
                        "ifdef" => self.is_defined(rest),
                        "ifndef" => !self.is_defined(rest),
                        _ => self
                            .evaluate(rest)
                            .map_err(|kind| self.error(file, at, kind))?,
                    };
                self.conditionals.push(Conditional {
                    parent_active,
                    active,
                    any_taken: active,
                    seen_else: false,
                });
            }
            "elif" | "elifdef" | "elifndef" => {
                let Some(top) = self.conditionals.last().copied() else {
                    return Err(self.error(file, at, PreprocessErrorKind::UnbalancedConditional("elif")));
                };
                let active = top.parent_active
                    && !top.any_taken
                    && !top.seen_else
                    && match name.text.as_str() {
                        "elifdef" => self.is_defined(rest),
                        "elifndef" => !self.is_defined(rest),
                        _ => self
                            .evaluate(rest)
                            .map_err(|kind| self.error(file, at, kind))?,
                    };
                if let Some(top) = self.conditionals.last_mut() {
                    top.active = active;
                    top.any_taken |= active;
                }
            }
            "else" => {
                let Some(top) = self.conditionals.last_mut() else {
                    return Err(self.error(file, at, PreprocessErrorKind::UnbalancedConditional("else")));
                };
                top.active = top.parent_active && !top.any_taken;
                top.any_taken = true;
                top.seen_else = true;
            }
            "endif" => {
                if self.conditionals.pop().is_none() {
                    return Err(self.error(file, at, PreprocessErrorKind::UnbalancedConditional("endif")));
                }
            }
            _ if !self.is_active() => {}
            "define" => self.define(file, at, rest)?,
            "undef" => {
                if let Some(name) = rest.first() {
                    self.macros.remove(&name.text);
                }
            }
            "include" | "include_next" | "import" => self.include(file, at, rest)?,
            "pragma" => {
                if rest.first().is_some_and(|t| t.is("once")) {
                    if let Some(path) = self.source_map.file_path(file) {
                        self.pragma_once.insert(normalize(path));
                    }
                }
            }
            "error" => {
                let message = join_tokens(rest);
                return Err(self.error(file, at, PreprocessErrorKind::ErrorDirective(message)));
            }
            "warning" => {
                let path = self.source_map.file_path(file).map(Path::to_path_buf);
                tracing::warn!(file = ?path, "#warning {}", join_tokens(rest));
            }
            _ => {}
        }
        Ok(())
    }

    fn is_defined(&self, rest: &[Token]) -> bool {
        rest.first()
            .is_some_and(|name| self.macros.contains_key(&name.text))
    }

    fn define(&mut self, file: FileId, at: usize, rest: &[Token]) -> Result<(), FrontendError> {
        let malformed = || self.error(file, at, PreprocessErrorKind::MalformedDefine);
        let Some((name, rest)) = rest.split_first() else {
            return Err(malformed());
        };
        if !name.is_ident() {
            return Err(malformed());
        }

        let function_like = rest.first().is_some_and(|t| t.is("(") && !t.space_before);
        let (params, variadic, body) = if function_like {
            let (params, variadic, consumed) = parse_params(&rest[1..]).ok_or_else(malformed)?;
            (Some(params), variadic, &rest[1 + consumed..])
        } else {
            (None, false, rest)
        };

        let mut body = body.to_vec();
        if let Some(first) = body.first_mut() {
            first.space_before = false;
        }
        tracing::trace!(macro_name = %name.text, function_like, "defined macro");
        self.macros.insert(
            name.text.clone(),
            Rc::new(MacroDef {
                params,
                variadic,
                body,
            }),
        );
        Ok(())
    }

    fn include(&mut self, file: FileId, at: usize, rest: &[Token]) -> Result<(), FrontendError> {
        let (target, quoted) = match rest.first() {
            Some(t) if t.text.len() >= 2 && t.text.starts_with('"') && t.text.ends_with('"') => {
                (t.text[1..t.text.len() - 1].to_string(), true)
            }
            Some(t) if t.is("<") => {
                let close = rest
                    .iter()
                    .position(|t| t.is(">"))
                    .ok_or_else(|| self.error(file, at, PreprocessErrorKind::MalformedInclude))?;
                (join_tokens(&rest[1..close]), false)
            }
            _ => return Err(self.error(file, at, PreprocessErrorKind::MalformedInclude)),
        };

        let Some(path) = self.resolve_include(file, &target, quoted) else {
            if quoted {
                return Err(self.error(file, at, PreprocessErrorKind::IncludeNotFound(target)));
            }
            tracing::debug!(header = %target, "skipping unresolved system include");
            return Ok(());
        };

        if self.pragma_once.contains(&path) {
            tracing::trace!(header = %path.display(), "already included (#pragma once)");
            return Ok(());
        }
        if self.include_depth >= MAX_INCLUDE_DEPTH {
            return Err(self.error(file, at, PreprocessErrorKind::IncludeDepthExceeded));
        }

        let text = cache::read_cached(&path).map_err(|source| FrontendError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(header = %path.display(), "entering include");
        let header = self
            .source_map
            .add_file(path, text, Some(FileLoc::new(file, at)));

        self.include_depth += 1;
        self.push_text("\n", Origin::File(FileLoc::new(file, at)));
        let result = self.process_file(header);
        self.include_depth -= 1;
        result
    }

    fn resolve_include(&self, file: FileId, target: &str, quoted: bool) -> Option<PathBuf> {
        let current_dir = self
            .source_map
            .file_path(file)
            .and_then(Path::parent)
            .map(Path::to_path_buf);

        let quoted_dirs = quoted
            .then(|| current_dir.into_iter().chain(self.options.quote_dirs.iter().cloned()))
            .into_iter()
            .flatten();

        quoted_dirs
            .chain(self.options.include_dirs.iter().cloned())
            .map(|dir| normalize(&dir.join(target)))
            .find(|candidate| candidate.is_file())
    }

    /// Evaluate a `#if` expression.
    fn evaluate(&self, tokens: &[Token]) -> Result<bool, PreprocessErrorKind> {
        // `defined` must be resolved before macro expansion
        let mut resolved = Vec::with_capacity(tokens.len());
        let mut k = 0;
        while k < tokens.len() {
            let token = &tokens[k];
            if token.is("defined") {
                let (name, next) = match tokens.get(k + 1) {
                    Some(open) if open.is("(") => (tokens.get(k + 2), k + 4),
                    other => (other, k + 2),
                };
                let name = name.ok_or_else(|| PreprocessErrorKind::InvalidCondition(join_tokens(tokens)))?;
                let value = if self.macros.contains_key(&name.text) { "1" } else { "0" };
                resolved.push(Token::synthetic(value, true));
                k = next;
            } else {
                resolved.push(token.clone());
                k += 1;
            }
        }

        let expanded = self.expand_tokens(resolved, &mut Vec::new())?;
        let expression = join_tokens(&expanded);
        let value = ConditionParser::new(&expression)
            .parse()
            .ok_or_else(|| PreprocessErrorKind::InvalidCondition(expression.clone()))?;
        Ok(value != 0)
    }
}

/// Split raw argument tokens at top-level commas and check them against
/// the parameter list, folding variadic arguments into `__VA_ARGS__`.
fn bind_args(
    name: &str,
    def: &MacroDef,
    tokens: Vec<Token>,
) -> Result<Vec<Vec<Token>>, PreprocessErrorKind> {
    let params = def.params.as_deref().unwrap_or_default();
    let mut args: Vec<Vec<Token>> = vec![Vec::new()];
    let mut commas: Vec<Token> = Vec::new();
    let mut depth = 0usize;

    for token in tokens {
        match token.text.as_str() {
            "(" => depth += 1,
            ")" => depth = depth.saturating_sub(1),
            "," if depth == 0 => {
                commas.push(token);
                args.push(Vec::new());
                continue;
            }
            _ => {}
        }
        if let Some(last) = args.last_mut() {
            last.push(token);
        }
    }

    let count_error = |found| PreprocessErrorKind::ArgumentCount {
        name: name.to_string(),
        expected: params.len(),
        found,
    };

    if def.variadic {
        let fixed = params.len() - 1;
        if fixed == 0 && args.len() == 1 && args[0].is_empty() {
            return Ok(args);
        }
        if args.len() < fixed {
            return Err(count_error(args.len()));
        }
        let rest = args.split_off(fixed);
        let rest_commas = commas.split_off(fixed.min(commas.len()));
        let mut variadic = Vec::new();
        for (n, arg) in rest.into_iter().enumerate() {
            if n > 0 {
                if let Some(comma) = rest_commas.get(n - 1) {
                    variadic.push(comma.clone());
                }
            }
            variadic.extend(arg);
        }
        args.push(variadic);
        return Ok(args);
    }

    if params.is_empty() && args.len() == 1 && args[0].is_empty() {
        return Ok(Vec::new());
    }
    if args.len() != params.len() {
        return Err(count_error(args.len()));
    }
    Ok(args)
}

/// Parse `a, b, ...)` after the opening parenthesis of a definition.
/// Returns the parameters, whether the macro is variadic and how many
/// tokens were consumed including the closing parenthesis.
fn parse_params(tokens: &[Token]) -> Option<(Vec<String>, bool, usize)> {
    let mut params = Vec::new();
    let mut k = 0;
    loop {
        let token = tokens.get(k)?;
        if token.is(")") && params.is_empty() {
            return Some((params, false, k + 1));
        }
        if token.is(".") {
            let dots = tokens.get(k..k + 3)?;
            if !dots.iter().all(|t| t.is(".")) || !tokens.get(k + 3)?.is(")") {
                return None;
            }
            params.push("__VA_ARGS__".to_string());
            return Some((params, true, k + 4));
        }
        if !token.is_ident() {
            return None;
        }
        params.push(token.text.clone());
        let separator = tokens.get(k + 1)?;
        if separator.is(")") {
            return Some((params, false, k + 2));
        }
        if !separator.is(",") {
            return None;
        }
        k += 2;
    }
}

/// Collect the parenthesised argument tokens following a macro name inside
/// an expansion. Returns the raw argument tokens and the index past `)`.
fn collect_token_args(tokens: &[Token], open: usize) -> Option<(Vec<Token>, usize)> {
    if !tokens.get(open)?.is("(") {
        return None;
    }
    let mut depth = 0usize;
    for (k, token) in tokens.iter().enumerate().skip(open) {
        match token.text.as_str() {
            "(" => depth += 1,
            ")" => {
                depth -= 1;
                if depth == 0 {
                    return Some((tokens[open + 1..k].to_vec(), k + 1));
                }
            }
            _ => {}
        }
    }
    None
}

fn stringize(arg: &[Token]) -> Token {
    let mut text = String::from("\"");
    for (n, token) in arg.iter().enumerate() {
        if n > 0 && token.space_before {
            text.push(' ');
        }
        for c in token.text.chars() {
            if c == '"' || c == '\\' {
                text.push('\\');
            }
            text.push(c);
        }
    }
    text.push('"');
    Token::synthetic(text, false)
}

fn join_tokens(tokens: &[Token]) -> String {
    let mut out = String::new();
    for (n, token) in tokens.iter().enumerate() {
        if n > 0 && token.space_before {
            out.push(' ');
        }
        out.push_str(&token.text);
    }
    out
}

/// Tokenize `src`. Spellings are `base` plus the token's offset in `src`.
fn lex(src: &str, base: Option<FileLoc>) -> Vec<Token> {
    let bytes = src.as_bytes();
    let len = bytes.len();
    let mut tokens = Vec::new();
    let mut space = false;
    let mut i = 0;

    while i < len {
        let b = bytes[i];
        if b == b'\\' && bytes.get(i + 1) == Some(&b'\n') {
            i += 2;
            space = true;
            continue;
        }
        if b == b'\\' && bytes.get(i + 1) == Some(&b'\r') && bytes.get(i + 2) == Some(&b'\n') {
            i += 3;
            space = true;
            continue;
        }
        if b.is_ascii_whitespace() {
            i += 1;
            space = true;
            continue;
        }
        if b == b'/' && bytes.get(i + 1) == Some(&b'/') {
            i = line_end(bytes, i);
            space = true;
            continue;
        }
        if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i = block_comment_end(bytes, i);
            space = true;
            continue;
        }

        let start = i;
        i = if is_ident_start(b) {
            let end = ident_end(bytes, i);
            prefixed_literal_end(src, i, end).unwrap_or(end)
        } else if b.is_ascii_digit() || (b == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            number_end(bytes, i)
        } else if b == b'"' || b == b'\'' {
            literal_end(bytes, i)
        } else if b == b'#' && bytes.get(i + 1) == Some(&b'#') {
            i + 2
        } else {
            i + 1
        };

        tokens.push(Token {
            text: src[start..i].to_string(),
            spelling: base.map(|base| FileLoc::new(base.file, base.offset + start)),
            space_before: space,
        });
        space = false;
    }
    tokens
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

fn ident_end(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && is_ident_continue(bytes[i]) {
        i += 1;
    }
    i
}

fn number_end(bytes: &[u8], mut i: usize) -> usize {
    i += 1;
    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'.' {
            i += 1;
        } else if (b == b'+' || b == b'-') && matches!(bytes[i - 1], b'e' | b'E' | b'p' | b'P') {
            i += 1;
        } else if b == b'\'' && bytes.get(i + 1).is_some_and(u8::is_ascii_alphanumeric) {
            i += 2;
        } else {
            break;
        }
    }
    i
}

/// End of a string or character literal starting at `i`. Stops at an
/// unescaped newline for unterminated literals.
fn literal_end(bytes: &[u8], i: usize) -> usize {
    let quote = bytes[i];
    let mut j = i + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            b'\n' => return j,
            b if b == quote => return j + 1,
            _ => j += 1,
        }
    }
    bytes.len()
}

/// For an identifier at `start..end` that is an encoding prefix directly
/// followed by a quote, the end of the whole literal.
fn prefixed_literal_end(src: &str, start: usize, end: usize) -> Option<usize> {
    let bytes = src.as_bytes();
    let quote = *bytes.get(end)?;
    if quote != b'"' && quote != b'\'' {
        return None;
    }
    let prefix = &src[start..end];
    match prefix {
        "L" | "u" | "U" | "u8" => Some(literal_end(bytes, end)),
        "R" | "LR" | "uR" | "UR" | "u8R" if quote == b'"' => {
            let open = src[end..].find('(')? + end;
            let delimiter = &src[end + 1..open];
            let closing = format!("){delimiter}\"");
            Some(
                src[open..]
                    .find(&closing)
                    .map_or(src.len(), |pos| open + pos + closing.len()),
            )
        }
        _ => None,
    }
}

fn line_end(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

fn block_comment_end(bytes: &[u8], i: usize) -> usize {
    let mut j = i + 2;
    while j + 1 < bytes.len() {
        if bytes[j] == b'*' && bytes[j + 1] == b'/' {
            return j + 2;
        }
        j += 1;
    }
    bytes.len()
}

fn skip_hspace(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && matches!(bytes[i], b' ' | b'\t' | b'\r' | b'\x0b' | b'\x0c') {
        i += 1;
    }
    i
}

fn skip_whitespace_and_comments(bytes: &[u8], mut i: usize) -> usize {
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        match (bytes.get(i), bytes.get(i + 1)) {
            (Some(b'/'), Some(b'/')) => i = line_end(bytes, i),
            (Some(b'/'), Some(b'*')) => i = block_comment_end(bytes, i),
            _ => return i,
        }
    }
}

/// End of the logical line holding a directive: the index of the
/// terminating newline, honouring continuations, comments and literals.
fn directive_end(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => return i,
            b'\\' if bytes.get(i + 1) == Some(&b'\n') => i += 2,
            b'\\' if bytes.get(i + 1) == Some(&b'\r') && bytes.get(i + 2) == Some(&b'\n') => i += 3,
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = block_comment_end(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'/') => i = line_end(bytes, i),
            b'"' | b'\'' => i = literal_end(bytes, i),
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Index of the `)` matching the `(` at `open`.
fn matching_paren(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => {
                depth += 1;
                i += 1;
            }
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
                i += 1;
            }
            b'"' | b'\'' => i = literal_end(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'/') => i = line_end(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = block_comment_end(bytes, i),
            _ => i += 1,
        }
    }
    None
}

/// Integer expression parser for `#if`, over already macro-expanded text.
/// Identifiers left after expansion evaluate to 0 (`true` to 1).
struct ConditionParser<'a> {
    src: &'a str,
    pos: usize,
}

const BINARY_OPERATORS: &[(&str, u8)] = &[
    ("||", 1),
    ("&&", 2),
    ("==", 6),
    ("!=", 6),
    ("<=", 7),
    (">=", 7),
    ("<<", 8),
    (">>", 8),
    ("|", 3),
    ("^", 4),
    ("&", 5),
    ("<", 7),
    (">", 7),
    ("+", 9),
    ("-", 9),
    ("*", 10),
    ("/", 10),
    ("%", 10),
];

impl<'a> ConditionParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn parse(mut self) -> Option<i64> {
        let value = self.ternary()?;
        self.skip_space();
        (self.pos == self.src.len()).then_some(value)
    }

    fn skip_space(&mut self) {
        while let Some(c) = self.src[self.pos..].chars().next().filter(|c| c.is_whitespace()) {
            self.pos += c.len_utf8();
        }
    }

    fn eat(&mut self, text: &str) -> bool {
        self.skip_space();
        if self.src[self.pos..].starts_with(text) {
            self.pos += text.len();
            true
        } else {
            false
        }
    }

    fn ternary(&mut self) -> Option<i64> {
        let condition = self.binary(1)?;
        if !self.eat("?") {
            return Some(condition);
        }
        let then = self.ternary()?;
        if !self.eat(":") {
            return None;
        }
        let otherwise = self.ternary()?;
        Some(if condition != 0 { then } else { otherwise })
    }

    fn peek_operator(&mut self) -> Option<(&'static str, u8)> {
        self.skip_space();
        let rest = &self.src[self.pos..];
        BINARY_OPERATORS
            .iter()
            .copied()
            .find(|(op, _)| rest.starts_with(op))
    }

    fn binary(&mut self, min_precedence: u8) -> Option<i64> {
        let mut lhs = self.unary()?;
        while let Some((op, precedence)) = self.peek_operator() {
            if precedence < min_precedence {
                break;
            }
            self.pos += op.len();
            let rhs = self.binary(precedence + 1)?;
            lhs = match op {
                "||" => i64::from(lhs != 0 || rhs != 0),
                "&&" => i64::from(lhs != 0 && rhs != 0),
                "==" => i64::from(lhs == rhs),
                "!=" => i64::from(lhs != rhs),
                "<=" => i64::from(lhs <= rhs),
                ">=" => i64::from(lhs >= rhs),
                "<" => i64::from(lhs < rhs),
                ">" => i64::from(lhs > rhs),
                "<<" => lhs.wrapping_shl(rhs as u32),
                ">>" => lhs.wrapping_shr(rhs as u32),
                "|" => lhs | rhs,
                "^" => lhs ^ rhs,
                "&" => lhs & rhs,
                "+" => lhs.wrapping_add(rhs),
                "-" => lhs.wrapping_sub(rhs),
                "*" => lhs.wrapping_mul(rhs),
                "/" => lhs.checked_div(rhs)?,
                "%" => lhs.checked_rem(rhs)?,
                _ => return None,
            };
        }
        Some(lhs)
    }

    fn unary(&mut self) -> Option<i64> {
        if self.eat("!") {
            return Some(i64::from(self.unary()? == 0));
        }
        if self.eat("-") {
            return Some(self.unary()?.wrapping_neg());
        }
        if self.eat("+") {
            return self.unary();
        }
        if self.eat("~") {
            return Some(!self.unary()?);
        }
        if self.eat("(") {
            let value = self.ternary()?;
            return self.eat(")").then_some(value);
        }
        self.primary()
    }

    fn primary(&mut self) -> Option<i64> {
        self.skip_space();
        let bytes = self.src.as_bytes();
        let start = self.pos;
        let first = *bytes.get(start)?;

        if first.is_ascii_digit() {
            let end = number_end(bytes, start);
            self.pos = end;
            return parse_integer(&self.src[start..end]);
        }
        if is_ident_start(first) {
            let end = ident_end(bytes, start);
            self.pos = end;
            return Some(i64::from(&self.src[start..end] == "true"));
        }
        None
    }
}

fn parse_integer(literal: &str) -> Option<i64> {
    let digits = literal
        .trim_end_matches(['u', 'U', 'l', 'L'])
        .replace('\'', "");
    let (radix, digits) = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        (16, hex.to_string())
    } else if let Some(bin) = digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")) {
        (2, bin.to_string())
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, digits[1..].to_string())
    } else {
        (10, digits)
    };
    u64::from_str_radix(&digits, radix).ok().map(|v| v as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn run(src: &str) -> (SourceMap, Preprocessed) {
        run_with(src, &CompileOptions::default())
    }

    fn run_with(src: &str, options: &CompileOptions) -> (SourceMap, Preprocessed) {
        preprocess(Path::new("/virtual/main.cpp"), Arc::from(src), options).unwrap()
    }

    fn squash(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn plain_text_maps_to_file_offsets() {
        let src = "struct Foo { int x; };\n";
        let (map, out) = run(src);
        assert_eq!(out.text, src);
        let main = map.main_file().unwrap();
        assert_eq!(
            out.location_at(13),
            SourceLocation::File(FileLoc::new(main, 13))
        );
        assert_eq!(out.location_at(src.len()), SourceLocation::Invalid);
    }

    #[test]
    fn directives_are_removed_and_offsets_survive() {
        let src = "#define N 4\nint a[N];\n";
        let (map, out) = run(src);
        assert_eq!(squash(&out.text), "int a[4];");

        let main = map.main_file().unwrap();
        let int_at = out.text.find("int").unwrap();
        assert_eq!(
            out.location_at(int_at),
            SourceLocation::File(FileLoc::new(main, 12))
        );
    }

    #[test]
    fn function_like_macro_records_spellings() {
        let src = "#define MAKE(N) struct N { int v; };\nMAKE(Foo)\n";
        let (map, out) = run(src);
        assert_eq!(squash(&out.text), "struct Foo { int v; };");

        let name_at = out.text.find("Foo").unwrap();
        let loc = out.location_at(name_at);
        assert!(loc.is_macro());
        assert!(map.is_in_main_file(loc));
        // "Foo" is spelled in the invocation argument
        let main = map.main_file().unwrap();
        assert_eq!(map.spelling_loc(loc), Some(FileLoc::new(main, 42)));
        // "struct" is spelled in the definition body
        let keyword = out.location_at(out.text.find("struct").unwrap());
        assert_eq!(map.spelling_loc(keyword), Some(FileLoc::new(main, 16)));
        assert_eq!(map.expansion_loc(keyword), Some(FileLoc::new(main, 37)));
    }

    #[test]
    fn stringize_and_paste() {
        let src = "#define STR(x) #x\n#define CAT(a, b) a ## b\nconst char* s = STR(hi \"there\"); int CAT(foo, bar);\n";
        let (map, out) = run(src);
        assert!(out.text.contains(r#""hi \"there\"""#));
        let pasted = out.text.find("foobar").unwrap();
        let loc = out.location_at(pasted);
        assert!(map.is_in_main_file(loc));
        assert_eq!(map.spelling_loc(loc), None);
    }

    #[test]
    fn variadic_and_nested_macros() {
        let src = "#define FIELD(t, n) t n;\n#define FIELDS(...) __VA_ARGS__\n#define REC(N, ...) struct N { FIELDS(__VA_ARGS__) };\nREC(P, int a; int b;)\n";
        let (_, out) = run(src);
        assert_eq!(squash(&out.text), "struct P { int a; int b; };");
    }

    #[test]
    fn nested_expansion_in_body() {
        let src = "#define FIELD(t, n) t n;\n#define POINT struct Point { FIELD(int, x) FIELD(int, y) };\nPOINT\n";
        let (map, out) = run(src);
        assert_eq!(squash(&out.text), "struct Point { int x; int y; };");
        let x_at = out.text.find("x;").unwrap();
        let main = map.main_file().unwrap();
        // Expansion location of anything in the expansion is the outer call site
        let call = src.rfind("POINT").unwrap();
        assert_eq!(
            map.expansion_loc(out.location_at(x_at)),
            Some(FileLoc::new(main, call))
        );
    }

    #[test]
    fn self_referential_macro_stops() {
        let (_, out) = run("#define foo foo + 1\nint x = foo;\n");
        assert_eq!(squash(&out.text), "int x = foo + 1;");
    }

    #[test]
    fn function_like_name_without_parens_is_left_alone() {
        let (_, out) = run("#define F(x) x\nint F;\n");
        assert_eq!(squash(&out.text), "int F;");
    }

    #[test]
    fn argument_count_mismatch_is_an_error() {
        let err = preprocess(
            Path::new("m.cpp"),
            Arc::from("#define F(a, b) a b\nF(1)\n"),
            &CompileOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FrontendError::Preprocess {
                line: 2,
                kind: PreprocessErrorKind::ArgumentCount { expected: 2, found: 1, .. },
                ..
            }
        ));
    }

    #[test]
    fn conditionals_select_branches() {
        let src = "\
#define A 2
#if A > 1 && !defined(B)
int yes1;
#else
int no1;
#endif
#ifdef B
int no2;
#elif defined A
int yes2;
#endif
#ifndef A
int no3;
#endif
#if 0
#error never
#endif
";
        let (_, out) = run(src);
        assert_eq!(squash(&out.text), "int yes1; int yes2;");
    }

    #[test]
    fn command_line_defines() {
        let options = CompileOptions {
            macros: vec![
                MacroOp::Define {
                    name: "WIDE".into(),
                    value: "1".into(),
                },
                MacroOp::Define {
                    name: "T".into(),
                    value: "long".into(),
                },
            ],
            ..CompileOptions::default()
        };
        let (map, out) = run_with("#if WIDE\nT x;\n#endif\n", &options);
        assert_eq!(squash(&out.text), "long x;");
        let loc = out.location_at(out.text.find("long").unwrap());
        assert!(map.is_in_main_file(loc));
        assert!(!map.is_written_in_main_file(loc));
    }

    #[test]
    fn cplusplus_is_predefined_for_cpp_files() {
        let (_, out) = run("#ifdef __cplusplus\nint cxx;\n#endif\n");
        assert_eq!(squash(&out.text), "int cxx;");

        let (_, out) = preprocess(
            Path::new("main.c"),
            Arc::from("#ifdef __cplusplus\nint cxx;\n#endif\n"),
            &CompileOptions::default(),
        )
        .unwrap();
        assert_eq!(squash(&out.text), "");
    }

    #[test]
    fn unterminated_conditional_is_an_error() {
        let err = preprocess(
            Path::new("m.cpp"),
            Arc::from("#if 1\nint x;\n"),
            &CompileOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FrontendError::Preprocess {
                kind: PreprocessErrorKind::UnterminatedConditional,
                ..
            }
        ));
    }

    #[test]
    fn error_directive_fails_only_when_active() {
        let err = preprocess(
            Path::new("m.cpp"),
            Arc::from("#error stop here\n"),
            &CompileOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FrontendError::Preprocess {
                kind: PreprocessErrorKind::ErrorDirective(ref msg),
                ..
            } if msg == "stop here"
        ));
    }

    #[test]
    fn includes_are_inlined_from_their_own_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("inc")).unwrap();
        fs::write(
            dir.path().join("inc/bar.h"),
            "#pragma once\nstruct Bar { int y; };\n",
        )
        .unwrap();
        let main_path = dir.path().join("main.cpp");
        let src = "#include <bar.h>\n#include \"inc/bar.h\"\n#include <vector>\nstruct Foo {};\n";

        let options = CompileOptions {
            include_dirs: vec![dir.path().join("inc")],
            ..CompileOptions::default()
        };
        let (map, out) = preprocess(&main_path, Arc::from(src), &options).unwrap();
        assert_eq!(squash(&out.text), "struct Bar { int y; }; struct Foo {};");

        let bar = out.location_at(out.text.find("Bar").unwrap());
        assert!(!map.is_in_main_file(bar));
        let header = map.expansion_loc(bar).unwrap().file;
        assert_eq!(map.file_path(header), Some(dir.path().join("inc/bar.h").as_path()));
        assert!(map.file(header).unwrap().included_from.is_some());

        let foo = out.location_at(out.text.find("Foo").unwrap());
        assert!(map.is_in_main_file(foo));
    }

    #[test]
    fn missing_quoted_include_is_fatal() {
        let err = preprocess(
            Path::new("/nowhere/main.cpp"),
            Arc::from("#include \"missing.h\"\n"),
            &CompileOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FrontendError::Preprocess {
                kind: PreprocessErrorKind::IncludeNotFound(_),
                ..
            }
        ));
    }

    #[test]
    fn macros_in_comments_and_strings_are_ignored() {
        let src = "#define X struct\n// X\n/* X */ const char* s = \"X\"; char c = 'X';\n";
        let (_, out) = run(src);
        assert!(out.text.contains("// X"));
        assert!(out.text.contains("\"X\""));
        assert!(out.text.contains("'X'"));
        assert!(!out.text.contains("struct"));
    }

    #[test]
    fn condition_parser() {
        let eval = |s: &str| ConditionParser::new(s).parse();
        assert_eq!(eval("1 + 2 * 3"), Some(7));
        assert_eq!(eval("(1 + 2) * 3 == 9"), Some(1));
        assert_eq!(eval("0x10 >> 2"), Some(4));
        assert_eq!(eval("201703L >= 201103L"), Some(1));
        assert_eq!(eval("1 ? 2 : 3"), Some(2));
        assert_eq!(eval("!0 && ~0"), Some(1));
        assert_eq!(eval("UNKNOWN || true"), Some(1));
        assert_eq!(eval("1 / 0"), None);
        assert_eq!(eval("1 +"), None);
    }
}
