use hashbrown::HashMap;

/// String interning pool backing a partition's string table.
///
/// Stores each distinct string once and hands out dense `u32` ids in
/// insertion order. Index 0 is reserved for the empty string, which doubles
/// as the sentinel id of the table: interning `""` always returns 0.
///
/// Mappings and functions reference strings through these ids; the pool's
/// backing vector is what ends up in `strings.parquet`.
#[derive(Debug, Clone, Default)]
pub struct StringPool {
    strings: Vec<String>,
    lookup: HashMap<String, u32>,
}

impl StringPool {
    /// Creates a pool with the empty string pre-interned at index 0.
    pub fn new() -> Self {
        let mut pool = Self {
            strings: Vec::new(),
            lookup: HashMap::new(),
        };
        pool.intern("");
        pool
    }

    /// Interns a string and returns its id.
    ///
    /// An already-known string returns its existing id, so repeated symbol
    /// names cost one entry regardless of how many records reference them.
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.lookup.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.lookup.insert(s.to_string(), idx);
        idx
    }

    /// Retrieves a string by id, or `None` when the id is out of bounds.
    pub fn get(&self, idx: u32) -> Option<&str> {
        self.strings.get(idx as usize).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// The interned strings in id order.
    pub fn as_slice(&self) -> &[String] {
        &self.strings
    }
}
