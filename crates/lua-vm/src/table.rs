use std::sync::Arc;

use lua_core::number::float_to_int;
use lua_core::LuaStr;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::LuaError;
use crate::value::LuaValue;

/// Shared handle to a table.
pub type TableRef = Arc<RwLock<LuaTable>>;

/// A Lua table: an associative array keyed by any non-nil, non-NaN value.
///
/// Integer keys `1..n` live in a compact `array` part. Everything else goes
/// into the hash part, which keeps insertion order so that `next` can resume
/// from any live key. Clearing a key leaves a tombstone behind until the
/// next compaction, so clearing fields during a traversal is allowed.
#[derive(Default)]
pub struct LuaTable {
    array: Vec<LuaValue>, // 1-indexed: array[i-1] = t[i]
    entries: Vec<(LuaValue, LuaValue)>,
    index: FxHashMap<TableKey, usize>,
    tombstones: usize,
    /// Largest size the array part has reached; keys up to it stay valid
    /// for `next` after the tail was trimmed.
    array_peak: usize,
    pub metatable: Option<TableRef>,
}

/// Hashable identity of a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TableKey {
    Boolean(bool),
    Integer(i64),
    Float(u64),
    Str(LuaStr),
    Ref(usize),
}

/// Float keys with an integral value become integer keys.
fn normalize(key: LuaValue) -> Result<LuaValue, LuaError> {
    match key {
        LuaValue::Nil => Err(LuaError::runtime("table index is nil")),
        LuaValue::Float(f) if f.is_nan() => Err(LuaError::runtime("table index is NaN")),
        LuaValue::Float(f) => Ok(match float_to_int(f) {
            Some(i) => LuaValue::Integer(i),
            None => LuaValue::Float(f),
        }),
        other => Ok(other),
    }
}

fn key_of(key: &LuaValue) -> Option<TableKey> {
    Some(match key {
        LuaValue::Nil => return None,
        LuaValue::Boolean(b) => TableKey::Boolean(*b),
        LuaValue::Integer(i) => TableKey::Integer(*i),
        LuaValue::Float(f) => match float_to_int(*f) {
            Some(i) => TableKey::Integer(i),
            None if f.is_nan() => return None,
            None => TableKey::Float(f.to_bits()),
        },
        LuaValue::LuaString(s) => TableKey::Str(s.clone()),
        other => TableKey::Ref(other.ref_addr()?),
    })
}

/// Position of an integer key inside the array part.
fn array_slot(key: &LuaValue, len: usize) -> Option<usize> {
    let i = match key {
        LuaValue::Integer(i) => *i,
        LuaValue::Float(f) => float_to_int(*f)?,
        _ => return None,
    };
    (i >= 1 && (i as u64) <= len as u64).then(|| (i - 1) as usize)
}

impl LuaTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(narray: usize, nhash: usize) -> Self {
        Self {
            array: Vec::with_capacity(narray),
            entries: Vec::with_capacity(nhash),
            index: FxHashMap::with_capacity_and_hasher(nhash, Default::default()),
            ..Self::default()
        }
    }

    pub fn new_ref() -> TableRef {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn into_ref(self) -> TableRef {
        Arc::new(RwLock::new(self))
    }

    /// Build a sequence `{v1, v2, ...}`.
    pub fn from_values(values: Vec<LuaValue>) -> Self {
        let mut t = Self::with_capacity(values.len(), 0);
        for (i, v) in values.into_iter().enumerate() {
            if !v.is_nil() {
                // Integer keys are never invalid.
                let _ = t.set(LuaValue::Integer(i as i64 + 1), v);
            }
        }
        t
    }

    /// Read `t[key]` without metamethods. Missing keys read as nil.
    pub fn get(&self, key: &LuaValue) -> LuaValue {
        if let Some(slot) = array_slot(key, self.array.len()) {
            return self.array[slot].clone();
        }
        key_of(key)
            .and_then(|k| self.index.get(&k))
            .map(|&pos| self.entries[pos].1.clone())
            .unwrap_or(LuaValue::Nil)
    }

    pub fn get_int(&self, i: i64) -> LuaValue {
        self.get(&LuaValue::Integer(i))
    }

    pub fn get_str(&self, name: &str) -> LuaValue {
        self.get(&LuaValue::from(name))
    }

    /// Write `t[key] = val` without metamethods. Storing nil removes the key.
    pub fn set(&mut self, key: LuaValue, val: LuaValue) -> Result<(), LuaError> {
        let key = normalize(key)?;
        if let LuaValue::Integer(i) = key {
            if i >= 1 {
                let idx = (i - 1) as u64;
                let len = self.array.len() as u64;
                if idx < len {
                    self.array[idx as usize] = val;
                    if idx + 1 == len {
                        self.trim_array();
                    }
                    return Ok(());
                }
                if idx == len && !val.is_nil() {
                    self.remove_entry(&TableKey::Integer(i));
                    self.array.push(val);
                    self.migrate_from_hash();
                    self.array_peak = self.array_peak.max(self.array.len());
                    return Ok(());
                }
            }
        }
        let Some(k) = key_of(&key) else {
            return Ok(());
        };
        if let Some(&pos) = self.index.get(&k) {
            let was_nil = self.entries[pos].1.is_nil();
            match (was_nil, val.is_nil()) {
                (false, true) => self.tombstones += 1,
                (true, false) => self.tombstones -= 1,
                _ => {}
            }
            self.entries[pos].1 = val;
        } else if !val.is_nil() {
            if self.tombstones > 8 && self.tombstones * 2 > self.entries.len() {
                self.compact();
            }
            self.index.insert(k, self.entries.len());
            self.entries.push((key, val));
        }
        Ok(())
    }

    pub fn set_int(&mut self, i: i64, val: LuaValue) {
        // Integer keys cannot be nil or NaN.
        let _ = self.set(LuaValue::Integer(i), val);
    }

    pub fn set_str(&mut self, name: &str, val: LuaValue) {
        let _ = self.set(LuaValue::from(name), val);
    }

    /// Lua-style length: a border of the table. For a contiguous run
    /// `1..n` this is exactly `n`.
    pub fn length(&self) -> i64 {
        // The array part never ends in nil and key `len + 1` is never
        // stored in the hash part.
        self.array.len() as i64
    }

    /// Append `val` (equivalent to `t[#t+1] = val`).
    pub fn push(&mut self, val: LuaValue) {
        let n = self.length();
        self.set_int(n + 1, val);
    }

    /// The entry after `key` in traversal order; `None` once exhausted.
    pub fn next(&self, key: &LuaValue) -> Result<Option<(LuaValue, LuaValue)>, LuaError> {
        let mut array_from = 0usize;
        let mut entries_from = 0usize;
        if !key.is_nil() {
            if let Some(slot) = array_slot(key, self.array.len()) {
                array_from = slot + 1;
            } else if let Some(pos) = key_of(key).and_then(|k| self.index.get(&k).copied()) {
                array_from = self.array.len();
                entries_from = pos + 1;
            } else if array_slot(key, self.array_peak).is_some() {
                // A key of the array tail that was trimmed away.
                array_from = self.array.len();
            } else {
                return Err(LuaError::runtime("invalid key to 'next'"));
            }
        }
        for i in array_from..self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((LuaValue::Integer(i as i64 + 1), self.array[i].clone())));
            }
        }
        Ok(self
            .entries
            .iter()
            .skip(entries_from)
            .find(|(_, v)| !v.is_nil())
            .cloned())
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable.clone()
    }

    pub fn set_metatable(&mut self, mt: Option<TableRef>) {
        self.metatable = mt;
    }

    /// Raw lookup of a metamethod by event name.
    pub fn metamethod(&self, event: &str) -> LuaValue {
        match &self.metatable {
            Some(mt) => mt.read().get_str(event),
            None => LuaValue::Nil,
        }
    }

    // ── internals ─────────────────────────────────────────────────────────

    fn trim_array(&mut self) {
        while matches!(self.array.last(), Some(LuaValue::Nil)) {
            self.array.pop();
        }
    }

    /// After the array part grew, pull the following integer keys out of
    /// the hash part so `length` stays a border.
    fn migrate_from_hash(&mut self) {
        loop {
            let next = TableKey::Integer(self.array.len() as i64 + 1);
            match self.index.get(&next) {
                Some(&pos) if !self.entries[pos].1.is_nil() => {
                    let v = std::mem::replace(&mut self.entries[pos].1, LuaValue::Nil);
                    self.tombstones += 1;
                    self.array.push(v);
                }
                _ => break,
            }
        }
    }

    fn remove_entry(&mut self, k: &TableKey) {
        if let Some(&pos) = self.index.get(k) {
            if !self.entries[pos].1.is_nil() {
                self.entries[pos].1 = LuaValue::Nil;
                self.tombstones += 1;
            }
        }
    }

    fn compact(&mut self) {
        self.entries.retain(|(_, v)| !v.is_nil());
        self.index.clear();
        for (pos, (k, _)) in self.entries.iter().enumerate() {
            if let Some(key) = key_of(k) {
                self.index.insert(key, pos);
            }
        }
        self.tombstones = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> LuaValue {
        LuaValue::Integer(i)
    }

    #[test]
    fn nil_and_nan_keys_are_rejected() {
        let mut t = LuaTable::new();
        assert!(t.set(LuaValue::Nil, int(1)).is_err());
        let err = t.set(LuaValue::Float(f64::NAN), int(1)).unwrap_err();
        assert_eq!(err.to_string(), "table index is NaN");
        assert_eq!(t.get(&LuaValue::Nil), LuaValue::Nil);
    }

    #[test]
    fn float_keys_normalize_to_integers() {
        let mut t = LuaTable::new();
        t.set(LuaValue::Float(2.0), LuaValue::from("two")).unwrap();
        assert_eq!(t.get(&int(2)), LuaValue::from("two"));
        t.set(LuaValue::Float(2.5), LuaValue::from("half")).unwrap();
        assert_eq!(t.get(&LuaValue::Float(2.5)), LuaValue::from("half"));
    }

    #[test]
    fn length_of_sequence_ignores_other_keys() {
        let mut t = LuaTable::new();
        t.set_str("name", LuaValue::from("x"));
        for i in 1..=10 {
            t.set_int(i, int(i * i));
        }
        t.set_int(100, int(0));
        assert_eq!(t.length(), 10);
    }

    #[test]
    fn out_of_order_keys_migrate_into_array() {
        let mut t = LuaTable::new();
        t.set_int(3, int(3));
        t.set_int(2, int(2));
        assert_eq!(t.length(), 0);
        t.set_int(1, int(1));
        assert_eq!(t.length(), 3);
        t.set_int(3, LuaValue::Nil);
        assert_eq!(t.length(), 2);
    }

    #[test]
    fn next_visits_every_key_once() {
        let mut t = LuaTable::new();
        t.set_int(1, int(10));
        t.set_int(2, int(20));
        t.set_str("a", int(1));
        t.set_str("b", int(2));
        let mut seen = Vec::new();
        let mut k = LuaValue::Nil;
        while let Some((key, _)) = t.next(&k).unwrap() {
            seen.push(key.to_string());
            k = key;
        }
        assert_eq!(seen, vec!["1", "2", "a", "b"]);
    }

    #[test]
    fn clearing_during_traversal_is_allowed() {
        let mut t = LuaTable::new();
        for i in 1..=3 {
            t.set_int(i, int(i));
        }
        t.set_str("x", int(0));
        let mut k = LuaValue::Nil;
        let mut count = 0;
        while let Some((key, _)) = t.next(&k).unwrap() {
            t.set(key.clone(), LuaValue::Nil).unwrap();
            count += 1;
            k = key;
        }
        assert_eq!(count, 4);
        assert_eq!(t.next(&LuaValue::Nil).unwrap(), None);
    }

    #[test]
    fn unknown_key_to_next_is_an_error() {
        let t = LuaTable::new();
        let err = t.next(&LuaValue::from("ghost")).unwrap_err();
        assert_eq!(err.to_string(), "invalid key to 'next'");
    }

    #[test]
    fn tombstones_are_reused_and_compacted() {
        let mut t = LuaTable::new();
        for i in 0..100 {
            t.set_str(&format!("k{i}"), int(i));
        }
        for i in 0..90 {
            t.set_str(&format!("k{i}"), LuaValue::Nil);
        }
        t.set_str("fresh", int(1));
        assert_eq!(t.get_str("k95"), int(95));
        assert_eq!(t.get_str("fresh"), int(1));
        assert!(t.entries.len() < 100);
    }
}
