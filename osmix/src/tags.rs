//! Columnar tag storage plus the packed PBF keyval stream iterator.

use crate::model::Tags;
use crate::strings::StringTable;
use std::iter::Iterator;

/// Tag pairs for a whole store, laid out as one flat buffer of alternating
/// (key index, value index) entries with per-entity offsets.
#[derive(Debug, Clone)]
pub struct TagStore {
    pairs: Vec<u32>,
    offsets: Vec<u32>,
}

impl Default for TagStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TagStore {
    pub fn new() -> Self {
        TagStore {
            pairs: Vec::new(),
            offsets: vec![0],
        }
    }

    /// Number of entities that have a tag run recorded.
    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len() / 2
    }

    /// Appends one entity's tags, interning the strings.
    pub fn add(&mut self, tags: &Tags, strings: &mut StringTable) {
        for (k, v) in tags {
            let k = strings.intern(k);
            let v = strings.intern(v);
            self.pairs.push(k);
            self.pairs.push(v);
        }
        self.offsets.push((self.pairs.len() / 2) as u32);
    }

    /// Appends one entity's tags from already-global string indexes.
    pub fn add_remapped(&mut self, pairs: impl Iterator<Item = (u32, u32)>) {
        for (k, v) in pairs {
            self.pairs.push(k);
            self.pairs.push(v);
        }
        self.offsets.push((self.pairs.len() / 2) as u32);
    }

    /// Raw (key index, value index) run of entity `i`.
    pub fn raw(&self, i: usize) -> &[u32] {
        let start = self.offsets[i] as usize * 2;
        let end = self.offsets[i + 1] as usize * 2;
        &self.pairs[start..end]
    }

    /// Materializes entity `i`'s tags in stored order.
    pub fn get_tags(&self, i: usize, strings: &StringTable) -> Tags {
        self.raw(i)
            .chunks_exact(2)
            .map(|kv| (strings.get(kv[0]).to_owned(), strings.get(kv[1]).to_owned()))
            .collect()
    }

    /// Linear scan over all tag pairs for entities carrying `key`
    /// (optionally with a specific value). Index-space arguments so the
    /// caller resolves strings once.
    pub fn search(&self, key_idx: u32, val_idx: Option<u32>) -> Vec<u32> {
        let mut found = Vec::new();
        for i in 0..self.len() {
            let hit = self.raw(i).chunks_exact(2).any(|kv| {
                kv[0] == key_idx && val_idx.map(|v| kv[1] == v).unwrap_or(true)
            });
            if hit {
                found.push(i as u32);
            }
        }
        found
    }

    pub fn buffers(&self) -> (&[u32], &[u32]) {
        (&self.pairs, &self.offsets)
    }

    pub fn from_buffers(pairs: Vec<u32>, offsets: Vec<u32>) -> Self {
        TagStore { pairs, offsets }
    }
}

/// Iterator over the packed dense-node `keys_vals` stream: interleaved
/// (k, v) index pairs per node, each node's run terminated by a 0.
pub struct PackedTagIterator<I> {
    iter: I,
    exhausted: bool,
}

impl<I: Iterator<Item = i32>> Iterator for PackedTagIterator<I> {
    type Item = Vec<(u32, u32)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let mut tags = Vec::new();
        loop {
            let key = match self.iter.next() {
                Some(key) => key as u32,
                None => {
                    self.exhausted = true;
                    if tags.is_empty() {
                        return None;
                    }
                    return Some(tags);
                }
            };

            if key == 0 {
                return Some(tags);
            }

            let val = self.iter.next()? as u32;
            tags.push((key, val));
        }
    }
}

pub trait IntoPackedTagIterator<I>: Sized {
    fn packed_tags(self) -> PackedTagIterator<I>;
}

impl<I: Iterator<Item = i32>> IntoPackedTagIterator<I> for I {
    fn packed_tags(self) -> PackedTagIterator<I> {
        PackedTagIterator {
            iter: self,
            exhausted: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::strings::StringTable;

    #[test]
    fn test_packed_tag_iterator() {
        let packed = [1, 2, 3, 4, 0, 0, 2, 1];

        let tags: Vec<Vec<(u32, u32)>> = packed.into_iter().packed_tags().collect();

        assert_eq!(tags.len(), 3, "Expect 3 runs of tags");
        assert_eq!(tags[0], vec![(1, 2), (3, 4)]);
        assert!(tags[1].is_empty());
        assert_eq!(tags[2], vec![(2, 1)]);
    }

    #[test]
    fn test_tag_store_runs() {
        let mut strings = StringTable::new();
        let mut store = TagStore::new();
        store.add(
            &vec![("highway".into(), "residential".into())],
            &mut strings,
        );
        store.add(&Vec::new(), &mut strings);
        store.add(
            &vec![("highway".into(), "service".into()), ("name".into(), "x".into())],
            &mut strings,
        );

        assert_eq!(store.len(), 3);
        assert_eq!(store.pair_count(), 3);
        assert!(store.raw(1).is_empty());
        assert_eq!(
            store.get_tags(2, &strings),
            vec![
                ("highway".to_owned(), "service".to_owned()),
                ("name".to_owned(), "x".to_owned())
            ]
        );
    }

    #[test]
    fn test_search() {
        let mut strings = StringTable::new();
        let mut store = TagStore::new();
        store.add(&vec![("highway".into(), "residential".into())], &mut strings);
        store.add(&vec![("building".into(), "yes".into())], &mut strings);
        store.add(&vec![("highway".into(), "service".into())], &mut strings);

        let highway = strings.lookup("highway").unwrap();
        let service = strings.lookup("service").unwrap();
        assert_eq!(store.search(highway, None), vec![0, 2]);
        assert_eq!(store.search(highway, Some(service)), vec![2]);
    }
}
