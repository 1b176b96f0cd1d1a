//! The process-wide fused-kernel source cache. Keys are the structural
//! fingerprint of a fusion walk; a hit means the kernel text (and, on the
//! device runtime, the compiled binary) is reused. Unbounded by design;
//! callers needing eviction wrap it externally.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

struct CacheInner {
    sources: HashMap<String, String>,
    misses: usize,
}

static CACHE: Lazy<Mutex<CacheInner>> = Lazy::new(|| {
    Mutex::new(CacheInner {
        sources: HashMap::new(),
        misses: 0,
    })
});

/// Returns the interned source for `key`, invoking `build` only on the
/// first request. The flag reports whether this call compiled (true) or
/// hit the cache (false).
pub fn intern(key: &str, build: impl FnOnce() -> String) -> (String, bool) {
    let mut cache = CACHE.lock();
    if let Some(src) = cache.sources.get(key) {
        return (src.clone(), false);
    }
    let src = build();
    debug!(key, "caching newly generated kernel");
    cache.misses += 1;
    cache.sources.insert(key.to_string(), src.clone());
    (src, true)
}

/// Number of cache misses (i.e. kernel generations) so far.
pub fn generation_count() -> usize {
    CACHE.lock().misses
}

/// Number of distinct kernels cached so far.
pub fn cached_count() -> usize {
    CACHE.lock().sources.len()
}
