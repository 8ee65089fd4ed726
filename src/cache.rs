//! Thread-local cache of header contents.
//!
//! Headers are typically included by many translation units in one run; the
//! cache keeps their text so each is read from disk once per thread.
//! Contents are decoded with [`decode_source`], so headers that are not
//! valid UTF-8 still load with their byte offsets intact.
//! Capped at 256 entries; the cache is cleared when full.

use crate::source::decode_source;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MAX_CACHE_ENTRIES: usize = 256;

thread_local! {
    static FILE_CACHE: RefCell<HashMap<PathBuf, Arc<str>>> = RefCell::new(HashMap::new());
}

/// Read a file through the cache.
pub fn read_cached(path: &Path) -> io::Result<Arc<str>> {
    FILE_CACHE.with(|cache| {
        if let Some(text) = cache.borrow().get(path) {
            return Ok(Arc::clone(text));
        }

        let bytes = fs::read(path)?;
        let text: Arc<str> = Arc::from(decode_source(&bytes));
        let mut cache = cache.borrow_mut();
        // Evict all if at capacity (simple but effective for batch workloads)
        if cache.len() >= MAX_CACHE_ENTRIES {
            cache.clear();
        }
        cache.insert(path.to_path_buf(), Arc::clone(&text));
        Ok(text)
    })
}

/// Clear the cache (mainly for testing).
pub fn clear_cache() {
    FILE_CACHE.with(|cache| cache.borrow_mut().clear());
}

pub fn cache_size() -> usize {
    FILE_CACHE.with(|cache| cache.borrow().len())
}
