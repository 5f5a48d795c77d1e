//! Immutable byte strings with a cached hash.

use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::FxHasher;

/// A Lua string: an immutable, shareable byte sequence.
///
/// Lua strings are not required to be valid UTF-8, so the payload is raw
/// bytes. The hash is computed once at construction; clones share both the
/// buffer and the hash.
#[derive(Clone)]
pub struct LuaStr {
    bytes: Arc<[u8]>,
    hash: u64,
}

impl LuaStr {
    pub fn new(bytes: &[u8]) -> Self {
        let mut h = FxHasher::default();
        h.write(bytes);
        Self {
            bytes: Arc::from(bytes),
            hash: h.finish(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The cached content hash.
    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    /// Lossy UTF-8 view, for messages and display.
    pub fn to_str_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// Borrow as `&str` when the bytes are valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    pub fn concat(&self, other: &LuaStr) -> LuaStr {
        let mut buf = Vec::with_capacity(self.len() + other.len());
        buf.extend_from_slice(&self.bytes);
        buf.extend_from_slice(&other.bytes);
        LuaStr::from(buf)
    }
}

impl PartialEq for LuaStr {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.bytes == other.bytes
    }
}

impl Eq for LuaStr {}

impl Hash for LuaStr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialOrd for LuaStr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LuaStr {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl From<&str> for LuaStr {
    fn from(s: &str) -> Self {
        LuaStr::new(s.as_bytes())
    }
}

impl From<String> for LuaStr {
    fn from(s: String) -> Self {
        LuaStr::new(s.as_bytes())
    }
}

impl From<&[u8]> for LuaStr {
    fn from(b: &[u8]) -> Self {
        LuaStr::new(b)
    }
}

impl From<Vec<u8>> for LuaStr {
    fn from(b: Vec<u8>) -> Self {
        LuaStr::new(&b)
    }
}

impl fmt::Debug for LuaStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_str_lossy())
    }
}

impl fmt::Display for LuaStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str_lossy())
    }
}
