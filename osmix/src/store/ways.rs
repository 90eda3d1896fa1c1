use crate::ids::IdIndex;
use crate::model::{EntityType, Tags, Way};
use crate::spatial::{self, BboxEntry};
use crate::store::{NodeStore, StoreError};
use crate::strings::StringTable;
use crate::tags::TagStore;
use geo::{BoundingRect, LineString, Rect};
use rstar::RTree;

/// Columnar way storage: ids plus a flat node-ref buffer addressed by
/// per-way offsets, sharing the tag layout of the other stores.
#[derive(Debug)]
pub struct WayStore {
    ids: Vec<i64>,
    ref_offsets: Vec<u32>,
    refs: Vec<i64>,
    tags: TagStore,
    index: Option<IdIndex>,
    // bbox cache parallel to ids, filled by build_spatial_index; ways with
    // no resolvable refs carry None
    bboxes: Vec<Option<Rect>>,
    tree: Option<RTree<BboxEntry>>,
}

impl Default for WayStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WayStore {
    pub fn new() -> Self {
        WayStore {
            ids: Vec::new(),
            ref_offsets: vec![0],
            refs: Vec::new(),
            tags: TagStore::new(),
            index: None,
            bboxes: Vec::new(),
            tree: None,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ref_count(&self) -> usize {
        self.refs.len()
    }

    pub fn add(&mut self, way: &Way, strings: &mut StringTable) {
        self.push_raw(
            way.id,
            way.refs.iter().copied(),
            way.tags
                .iter()
                .map(|(k, v)| (strings.intern(k), strings.intern(v)))
                .collect::<Vec<_>>()
                .into_iter(),
        );
    }

    pub(crate) fn push_raw(
        &mut self,
        id: i64,
        refs: impl Iterator<Item = i64>,
        pairs: impl Iterator<Item = (u32, u32)>,
    ) {
        self.ids.push(id);
        self.refs.extend(refs);
        self.ref_offsets.push(self.refs.len() as u32);
        self.tags.add_remapped(pairs);
        self.index = None;
    }

    pub fn build_index(&mut self) -> Result<(), StoreError> {
        let index = IdIndex::build(&self.ids).map_err(|id| StoreError::DuplicateId {
            kind: EntityType::Way,
            id,
        })?;
        self.index = Some(index);
        Ok(())
    }

    /// Computes the per-way bbox cache against the node store and bulk
    /// loads the R-tree. Ways whose refs all point outside the index get
    /// no envelope and never match a spatial query.
    pub fn build_spatial_index(&mut self, nodes: &NodeStore) {
        self.bboxes = (0..self.len())
            .map(|i| self.coordinates(i, nodes).bounding_rect())
            .collect();
        let entries = self
            .bboxes
            .iter()
            .enumerate()
            .filter_map(|(i, bbox)| bbox.map(|b| spatial::bbox_entry(&b, i as u32)))
            .collect();
        self.tree = Some(RTree::bulk_load(entries));
    }

    pub fn is_indexed(&self) -> bool {
        self.index.is_some()
    }

    pub fn has_spatial_index(&self) -> bool {
        self.tree.is_some()
    }

    fn index(&self) -> &IdIndex {
        self.index
            .as_ref()
            .expect("way store read before build_indexes()")
    }

    pub fn id(&self, i: usize) -> i64 {
        self.ids[i]
    }

    pub fn refs(&self, i: usize) -> &[i64] {
        let start = self.ref_offsets[i] as usize;
        let end = self.ref_offsets[i + 1] as usize;
        &self.refs[start..end]
    }

    pub fn index_of(&self, id: i64) -> Option<u32> {
        self.index().get(id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.index().contains(id)
    }

    pub fn get_tags(&self, i: usize, strings: &StringTable) -> Tags {
        self.tags.get_tags(i, strings)
    }

    pub fn tag_store(&self) -> &TagStore {
        &self.tags
    }

    pub fn get_by_index(&self, i: usize, strings: &StringTable) -> Way {
        Way {
            id: self.ids[i],
            refs: self.refs(i).to_vec(),
            tags: self.tags.get_tags(i, strings),
        }
    }

    pub fn get_by_id(&self, id: i64, strings: &StringTable) -> Option<Way> {
        self.index_of(id)
            .map(|i| self.get_by_index(i as usize, strings))
    }

    /// Dense indexes in ascending-id order.
    pub fn sorted(&self) -> impl Iterator<Item = u32> + '_ {
        self.index().sorted().iter().copied()
    }

    pub fn search(&self, key: &str, value: Option<&str>, strings: &StringTable) -> Vec<u32> {
        let Some(key_idx) = strings.lookup(key) else {
            return Vec::new();
        };
        let val_idx = match value {
            Some(v) => match strings.lookup(v) {
                Some(idx) => Some(idx),
                None => return Vec::new(),
            },
            None => None,
        };
        self.tags.search(key_idx, val_idx)
    }

    /// Resolves way `i` to coordinates, silently dropping refs missing
    /// from the node store (they may have been filtered at ingest).
    pub fn coordinates(&self, i: usize, nodes: &NodeStore) -> LineString {
        self.refs(i)
            .iter()
            .filter_map(|&r| nodes.index_of(r).map(|n| nodes.coord(n as usize)))
            .collect()
    }

    pub fn bbox(&self, i: usize) -> Option<Rect> {
        self.bboxes.get(i).copied().flatten()
    }

    /// R-tree query for ways whose bbox intersects `rect`.
    pub fn intersects(&self, rect: &Rect) -> Vec<u32> {
        match &self.tree {
            Some(tree) => tree
                .locate_in_envelope_intersecting(&spatial::envelope(rect))
                .map(|entry| entry.data)
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn buffers(&self) -> WayBufferRefs<'_> {
        let (tag_pairs, tag_offsets) = self.tags.buffers();
        WayBufferRefs {
            ids: &self.ids,
            ref_offsets: &self.ref_offsets,
            refs: &self.refs,
            tag_pairs,
            tag_offsets,
        }
    }

    pub(crate) fn from_raw(
        ids: Vec<i64>,
        ref_offsets: Vec<u32>,
        refs: Vec<i64>,
        tag_pairs: Vec<u32>,
        tag_offsets: Vec<u32>,
    ) -> Self {
        WayStore {
            ids,
            ref_offsets,
            refs,
            tags: TagStore::from_buffers(tag_pairs, tag_offsets),
            index: None,
            bboxes: Vec::new(),
            tree: None,
        }
    }
}

pub(crate) struct WayBufferRefs<'a> {
    pub ids: &'a [i64],
    pub ref_offsets: &'a [u32],
    pub refs: &'a [i64],
    pub tag_pairs: &'a [u32],
    pub tag_offsets: &'a [u32],
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{bbox_rect, Node};

    fn setup() -> (StringTable, NodeStore, WayStore) {
        let mut strings = StringTable::new();
        let mut nodes = NodeStore::new();
        for (id, lon, lat) in [(1, 0.0, 0.0), (2, 2.0, 0.0), (3, 0.5, 0.5), (4, 1.5, 0.5)] {
            nodes.add(
                &Node {
                    id,
                    lon,
                    lat,
                    tags: Vec::new(),
                },
                &mut strings,
            );
        }
        nodes.build_index().unwrap();

        let mut ways = WayStore::new();
        ways.add(
            &Way {
                id: 10,
                refs: vec![1, 2],
                tags: vec![("highway".into(), "residential".into())],
            },
            &mut strings,
        );
        ways.add(
            &Way {
                id: 11,
                refs: vec![3, 4],
                tags: Vec::new(),
            },
            &mut strings,
        );
        ways.build_index().unwrap();
        ways.build_spatial_index(&nodes);
        (strings, nodes, ways)
    }

    #[test]
    fn test_refs_and_coordinates() {
        let (strings, nodes, ways) = setup();
        let way = ways.get_by_id(10, &strings).unwrap();
        assert_eq!(way.refs, vec![1, 2]);

        let line = ways.coordinates(0, &nodes);
        assert_eq!(line.0.len(), 2);
        assert_eq!(line.0[1].x, 2.0);
    }

    #[test]
    fn test_intersects_uses_bbox_cache() {
        let (_, _, ways) = setup();
        let hits = ways.intersects(&bbox_rect(0.4, 0.4, 0.6, 0.6));
        assert_eq!(hits, vec![1]);

        let both = ways.intersects(&bbox_rect(-1.0, -1.0, 3.0, 1.0));
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn test_missing_refs_are_dropped_from_coordinates() {
        let (mut strings, nodes, mut ways) = setup();
        ways.add(
            &Way {
                id: 12,
                refs: vec![1, 99],
                tags: Vec::new(),
            },
            &mut strings,
        );
        let line = ways.coordinates(2, &nodes);
        assert_eq!(line.0.len(), 1);
    }
}
