use crate::ids::IdIndex;
use crate::model::{dequantize, quantize, rect_contains, EntityType, Node, Tags};
use crate::proto;
use crate::reader::IntoDelta;
use crate::spatial::{self, PointEntry};
use crate::store::StoreError;
use crate::strings::StringTable;
use crate::tags::{IntoPackedTagIterator, TagStore};
use geo::{coord, Coord, Rect};
use itertools::izip;
use rstar::RTree;
use rustc_hash::FxHashSet;

/// Columnar node storage: `ids`, quantised `lon_q`/`lat_q` and the shared
/// tag layout, all parallel arrays of the same logical length.
#[derive(Debug, Default)]
pub struct NodeStore {
    ids: Vec<i64>,
    lon_q: Vec<i32>,
    lat_q: Vec<i32>,
    tags: TagStore,
    index: Option<IdIndex>,
    tree: Option<RTree<PointEntry>>,
}

impl NodeStore {
    pub fn new() -> Self {
        NodeStore {
            tags: TagStore::new(),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn add(&mut self, node: &Node, strings: &mut StringTable) {
        self.ids.push(node.id);
        self.lon_q.push(quantize(node.lon));
        self.lat_q.push(quantize(node.lat));
        self.tags.add(&node.tags, strings);
        self.index = None;
    }

    pub(crate) fn push_raw(
        &mut self,
        id: i64,
        lon_q: i32,
        lat_q: i32,
        pairs: impl Iterator<Item = (u32, u32)>,
    ) {
        self.ids.push(id);
        self.lon_q.push(lon_q);
        self.lat_q.push(lat_q);
        self.tags.add_remapped(pairs);
        self.index = None;
    }

    /// Expands one PBF dense-node run and appends it. Ids, coordinates and
    /// the optional info columns are prefix-sum deltas; tags arrive as the
    /// packed keyval stream. When a bbox filter is given, nodes outside it
    /// are skipped and kept ids are recorded in `kept`.
    pub fn add_dense(
        &mut self,
        block: &proto::PrimitiveBlock,
        dense: &proto::DenseNodes,
        remap: &[u32],
        mut filter: Option<(Rect, &mut FxHashSet<i64>)>,
    ) -> usize {
        let granularity = block.granularity.unwrap_or(100) as i64;
        let lat_offset = block.lat_offset.unwrap_or(0);
        let lon_offset = block.lon_offset.unwrap_or(0);

        // a block of tagless nodes may omit keys_vals entirely
        let mut tag_runs = dense
            .keys_vals
            .iter()
            .copied()
            .packed_tags()
            .chain(std::iter::repeat(Vec::new()));

        let mut appended = 0;
        for (id, lat, lon) in izip!(
            dense.id.iter().copied().delta(),
            dense.lat.iter().copied().delta(),
            dense.lon.iter().copied().delta(),
        ) {
            let run = tag_runs.next().unwrap_or_default();
            let lat_nano = lat_offset + granularity * lat;
            let lon_nano = lon_offset + granularity * lon;
            let lat_q = (lat_nano / 100) as i32;
            let lon_q = (lon_nano / 100) as i32;

            if let Some((bbox, kept)) = filter.as_mut() {
                if !rect_contains(bbox, dequantize(lon_q), dequantize(lat_q)) {
                    continue;
                }
                kept.insert(id);
            }

            self.push_raw(
                id,
                lon_q,
                lat_q,
                run.iter().map(|&(k, v)| (remap[k as usize], remap[v as usize])),
            );
            appended += 1;
        }
        appended
    }

    pub fn build_index(&mut self) -> Result<(), StoreError> {
        let index = IdIndex::build(&self.ids).map_err(|id| StoreError::DuplicateId {
            kind: EntityType::Node,
            id,
        })?;
        self.index = Some(index);
        Ok(())
    }

    pub fn build_spatial_index(&mut self) {
        let entries = self
            .ids
            .iter()
            .enumerate()
            .map(|(i, _)| spatial::point_entry(self.lon(i), self.lat(i), i as u32))
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
            .expect("node store read before build_indexes()")
    }

    pub fn id(&self, i: usize) -> i64 {
        self.ids[i]
    }

    pub fn lon(&self, i: usize) -> f64 {
        dequantize(self.lon_q[i])
    }

    pub fn lat(&self, i: usize) -> f64 {
        dequantize(self.lat_q[i])
    }

    pub fn lon_q(&self, i: usize) -> i32 {
        self.lon_q[i]
    }

    pub fn lat_q(&self, i: usize) -> i32 {
        self.lat_q[i]
    }

    pub fn coord(&self, i: usize) -> Coord {
        coord! { x: self.lon(i), y: self.lat(i) }
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

    pub fn get_by_index(&self, i: usize, strings: &StringTable) -> Node {
        Node {
            id: self.ids[i],
            lon: self.lon(i),
            lat: self.lat(i),
            tags: self.tags.get_tags(i, strings),
        }
    }

    pub fn get_by_id(&self, id: i64, strings: &StringTable) -> Option<Node> {
        self.index_of(id)
            .map(|i| self.get_by_index(i as usize, strings))
    }

    /// Dense indexes in ascending-id order.
    pub fn sorted(&self) -> impl Iterator<Item = u32> + '_ {
        self.index().sorted().iter().copied()
    }

    /// Linear tag scan; slow path by design.
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

    /// All node indexes whose position lies inside `rect` (inclusive).
    pub fn find_indexes_within_bbox(&self, rect: &Rect) -> Vec<u32> {
        match &self.tree {
            Some(tree) => tree
                .locate_in_envelope_intersecting(&spatial::envelope(rect))
                .filter(|entry| {
                    let [lon, lat] = *entry.geom();
                    rect_contains(rect, lon, lat)
                })
                .map(|entry| entry.data)
                .collect(),
            None => (0..self.len() as u32)
                .filter(|&i| rect_contains(rect, self.lon(i as usize), self.lat(i as usize)))
                .collect(),
        }
    }

    /// Candidate node indexes within `radius_m` meters of a position,
    /// confirmed by great-circle distance.
    pub fn find_indexes_within_radius(&self, lon: f64, lat: f64, radius_m: f64) -> Vec<u32> {
        let env = spatial::radius_envelope(lon, lat, radius_m);
        match &self.tree {
            Some(tree) => tree
                .locate_in_envelope_intersecting(&env)
                .filter(|entry| {
                    let [elon, elat] = *entry.geom();
                    spatial::distance_m(lon, lat, elon, elat) <= radius_m
                })
                .map(|entry| entry.data)
                .collect(),
            None => (0..self.len() as u32)
                .filter(|&i| {
                    spatial::distance_m(lon, lat, self.lon(i as usize), self.lat(i as usize))
                        <= radius_m
                })
                .collect(),
        }
    }

    pub(crate) fn buffers(&self) -> NodeBufferRefs<'_> {
        let (tag_pairs, tag_offsets) = self.tags.buffers();
        NodeBufferRefs {
            ids: &self.ids,
            lon_q: &self.lon_q,
            lat_q: &self.lat_q,
            tag_pairs,
            tag_offsets,
        }
    }

    pub(crate) fn from_raw(
        ids: Vec<i64>,
        lon_q: Vec<i32>,
        lat_q: Vec<i32>,
        tag_pairs: Vec<u32>,
        tag_offsets: Vec<u32>,
    ) -> Self {
        NodeStore {
            ids,
            lon_q,
            lat_q,
            tags: TagStore::from_buffers(tag_pairs, tag_offsets),
            index: None,
            tree: None,
        }
    }
}

pub(crate) struct NodeBufferRefs<'a> {
    pub ids: &'a [i64],
    pub lon_q: &'a [i32],
    pub lat_q: &'a [i32],
    pub tag_pairs: &'a [u32],
    pub tag_offsets: &'a [u32],
}
