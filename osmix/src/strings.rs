//! Interned string storage shared by all tag stores of one index.

use rustc_hash::FxHashMap;

/// Append-only string table. Index 0 is always the empty string, matching
/// the PBF convention of a blank first entry.
#[derive(Debug)]
pub struct StringTable {
    strings: Vec<String>,
    index: FxHashMap<String, u32>,
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StringTable {
    pub fn new() -> Self {
        let mut table = StringTable {
            strings: Vec::new(),
            index: FxHashMap::default(),
        };
        table.intern("");
        table
    }

    /// Returns the index of `s`, inserting it on first sight. Identical
    /// strings always return identical indexes within one table.
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_owned());
        self.index.insert(s.to_owned(), idx);
        idx
    }

    pub fn get(&self, idx: u32) -> &str {
        &self.strings[idx as usize]
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        // index 0 is always present
        self.strings.len() <= 1
    }

    pub fn lookup(&self, s: &str) -> Option<u32> {
        self.index.get(s).copied()
    }

    /// Maps a PBF block's local string table onto this one, returning the
    /// local index → global index translation vector.
    pub fn create_block_index_map(&mut self, block_strings: &[Vec<u8>]) -> Vec<u32> {
        block_strings
            .iter()
            .map(|raw| {
                let s = String::from_utf8_lossy(raw);
                self.intern(&s)
            })
            .collect()
    }

    /// Flattens the table into a contiguous byte buffer plus an offset
    /// vector of length `len() + 1`.
    pub fn to_buffers(&self) -> (Vec<u8>, Vec<u32>) {
        let total: usize = self.strings.iter().map(|s| s.len()).sum();
        let mut bytes = Vec::with_capacity(total);
        let mut offsets = Vec::with_capacity(self.strings.len() + 1);
        offsets.push(0);
        for s in &self.strings {
            bytes.extend_from_slice(s.as_bytes());
            offsets.push(bytes.len() as u32);
        }
        (bytes, offsets)
    }

    pub fn from_buffers(bytes: &[u8], offsets: &[u32]) -> Self {
        let mut table = StringTable {
            strings: Vec::with_capacity(offsets.len().saturating_sub(1)),
            index: FxHashMap::default(),
        };
        for window in offsets.windows(2) {
            let slice = &bytes[window[0] as usize..window[1] as usize];
            let s = String::from_utf8_lossy(slice).into_owned();
            let idx = table.strings.len() as u32;
            table.index.entry(s.clone()).or_insert(idx);
            table.strings.push(s);
        }
        if table.strings.is_empty() {
            table.intern("");
        }
        table
    }
}

#[cfg(test)]
mod test {
    use super::StringTable;

    #[test]
    fn test_intern_deduplicates() {
        let mut st = StringTable::new();
        assert_eq!(st.get(0), "");
        let a = st.intern("highway");
        let b = st.intern("residential");
        assert_eq!(st.intern("highway"), a);
        assert_ne!(a, b);
        assert_eq!(st.get(a), "highway");
        assert_eq!(st.get(b), "residential");
    }

    #[test]
    fn test_block_index_map() {
        let mut st = StringTable::new();
        st.intern("name");

        let block = vec![b"".to_vec(), b"highway".to_vec(), b"name".to_vec()];
        let remap = st.create_block_index_map(&block);
        assert_eq!(remap[0], 0);
        assert_eq!(st.get(remap[1]), "highway");
        assert_eq!(remap[2], 1);
    }

    #[test]
    fn test_buffer_round_trip() {
        let mut st = StringTable::new();
        st.intern("a");
        st.intern("bc");
        st.intern("def");
        let (bytes, offsets) = st.to_buffers();
        let restored = StringTable::from_buffers(&bytes, &offsets);
        assert_eq!(restored.len(), st.len());
        assert_eq!(restored.get(2), "bc");
        assert_eq!(restored.lookup("def"), Some(3));
    }
}
