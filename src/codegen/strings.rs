//! Process-wide cstring pool.
//!
//! Interface tables and dynamic property access refer to member names by
//! address in linear memory. The pool is content-addressed: interning the
//! same string or blob twice yields the same offset, which makes writes
//! idempotent and keeps the pool usable across module compilations.
//! [`reset`] empties it between compilations.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

/// First byte offset handed out by the pool. Offset 0 stays unused so a
/// zero name pointer can mean "no name" (e.g. anonymous dynamic invokes).
const POOL_BASE: u32 = 8;

static POOL: Lazy<Mutex<Pool>> = Lazy::new(|| Mutex::new(Pool::new()));

struct Pool {
    bytes: Vec<u8>,
    cstrings: HashMap<String, u32>,
    blobs: HashMap<Vec<u8>, u32>,
}

impl Pool {
    fn new() -> Self {
        Pool {
            bytes: Vec::new(),
            cstrings: HashMap::new(),
            blobs: HashMap::new(),
        }
    }

    fn intern_cstring(&mut self, value: &str) -> u32 {
        if let Some(&offset) = self.cstrings.get(value) {
            return offset;
        }
        let offset = POOL_BASE + self.bytes.len() as u32;
        self.bytes.extend_from_slice(value.as_bytes());
        self.bytes.push(0);
        self.cstrings.insert(value.into(), offset);
        offset
    }

    fn intern_blob(&mut self, blob: &[u8]) -> u32 {
        if let Some(&offset) = self.blobs.get(blob) {
            return offset;
        }
        // Keep i32 table entries naturally aligned.
        while (POOL_BASE + self.bytes.len() as u32) % 4 != 0 {
            self.bytes.push(0);
        }
        let offset = POOL_BASE + self.bytes.len() as u32;
        self.bytes.extend_from_slice(blob);
        self.blobs.insert(blob.to_vec(), offset);
        offset
    }
}

/// Intern a NUL-terminated string, returning its linear-memory address.
pub fn intern_cstring(value: &str) -> u32 {
    POOL.lock()
        .expect("cstring pool poisoned")
        .intern_cstring(value)
}

/// Intern a raw blob (an itable rendering), returning its address.
pub fn intern_blob(blob: &[u8]) -> u32 {
    POOL.lock().expect("cstring pool poisoned").intern_blob(blob)
}

/// The pool contents for the module's data segment: base offset and bytes.
pub fn snapshot() -> (u32, Vec<u8>) {
    let pool = POOL.lock().expect("cstring pool poisoned");
    (POOL_BASE, pool.bytes.clone())
}

/// Empty the pool. Call between module compilations when stable offsets
/// across modules are not wanted.
pub fn reset() {
    let mut pool = POOL.lock().expect("cstring pool poisoned");
    *pool = Pool::new();
}

/// Serializes tests that touch the process-wide pool; the test harness
/// runs test functions concurrently.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static TEST_MUTEX: Mutex<()> = Mutex::new(());
    TEST_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_idempotent() {
        let _guard = test_guard();
        let a = intern_cstring("foo");
        let b = intern_cstring("foo");
        let c = intern_cstring("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let blob = intern_blob(&[1, 2, 3, 4]);
        assert_eq!(blob, intern_blob(&[1, 2, 3, 4]));
        assert_eq!(blob % 4, 0);
    }

    #[test]
    fn test_reset_clears_offsets() {
        let _guard = test_guard();
        reset();
        let a = intern_cstring("alpha");
        intern_cstring("beta");
        reset();
        let again = intern_cstring("alpha");
        assert_eq!(a, again);
    }
}
