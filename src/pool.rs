//! Thread-local parser pooling.
//!
//! Each thread creates one C++ parser on first use and reuses it for every
//! translation unit it processes afterwards.

use crate::frontend::{CppParser, FrontendError};
use std::cell::RefCell;

thread_local! {
    static CPP_PARSER: RefCell<Option<CppParser>> = const { RefCell::new(None) };
}

/// Execute function with pooled parser instance.
///
/// # Example
///
/// ```no_run
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use decl_annotate::pool::with_parser;
///
/// let has_errors = with_parser(|parser| {
///     parser.parse_with_source("struct Foo {};").map(|p| p.has_errors())
/// })??;
/// # Ok(())
/// # }
/// ```
pub fn with_parser<F, R>(f: F) -> Result<R, FrontendError>
where
    F: FnOnce(&mut CppParser) -> R,
{
    CPP_PARSER.with(|cell| {
        let mut slot = cell.borrow_mut();
        let parser = match &mut *slot {
            Some(parser) => parser,
            empty @ None => empty.insert(CppParser::new()?),
        };
        Ok(f(parser))
    })
}
