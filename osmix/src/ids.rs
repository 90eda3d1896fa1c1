//! Entity id index: a sorted permutation over the append-order arrays plus
//! a reverse id → dense index map.

use rustc_hash::FxHashMap;

#[derive(Debug)]
pub struct IdIndex {
    sorted: Vec<u32>,
    map: FxHashMap<i64, u32>,
}

impl IdIndex {
    /// Builds the index without permuting the underlying storage. Fails on
    /// the first duplicate id.
    pub fn build(ids: &[i64]) -> Result<Self, i64> {
        let mut sorted: Vec<u32> = (0..ids.len() as u32).collect();
        sorted.sort_unstable_by_key(|&i| ids[i as usize]);

        let mut map = FxHashMap::with_capacity_and_hasher(ids.len(), Default::default());
        for pair in sorted.windows(2) {
            if ids[pair[0] as usize] == ids[pair[1] as usize] {
                return Err(ids[pair[0] as usize]);
            }
        }
        for &i in &sorted {
            map.insert(ids[i as usize], i);
        }
        Ok(IdIndex { sorted, map })
    }

    pub fn get(&self, id: i64) -> Option<u32> {
        self.map.get(&id).copied()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.map.contains_key(&id)
    }

    /// Dense indexes in ascending-id order.
    pub fn sorted(&self) -> &[u32] {
        &self.sorted
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::IdIndex;

    #[test]
    fn test_lookup_and_order() {
        let ids = [40_i64, 10, 30, 20];
        let index = IdIndex::build(&ids).unwrap();

        assert_eq!(index.get(10), Some(1));
        assert_eq!(index.get(40), Some(0));
        assert_eq!(index.get(99), None);
        assert_eq!(index.sorted(), &[1, 3, 2, 0]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let ids = [1_i64, 2, 2, 3];
        assert!(matches!(IdIndex::build(&ids), Err(2)));
    }

    #[test]
    fn test_empty() {
        let index = IdIndex::build(&[]).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.get(0), None);
    }
}
