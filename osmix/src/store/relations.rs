use crate::ids::IdIndex;
use crate::model::{tag_value, EntityType, Member, Relation, Tags};
use crate::spatial::{self, BboxEntry};
use crate::store::{member_type_code, member_type_from_code, NodeStore, StoreError, WayStore};
use crate::strings::StringTable;
use crate::tags::TagStore;
use geo::{BoundingRect, Contains, Coord, LineString, Polygon, Rect};
use rstar::RTree;
use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;

/// Relation → relation indirection is broken here during geometry
/// resolution.
const MAX_RELATION_DEPTH: usize = 10;

/// Geometry resolved from a relation's members. Multipolygon assembly that
/// leaves an open outer ring yields no geometry at all; the relation is
/// simply skipped by consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationGeometry {
    Points(Vec<Coord>),
    Lines(Vec<LineString>),
    Rings(Vec<Polygon>),
}

/// Columnar relation storage: flat member arrays (type, ref, role index)
/// addressed by per-relation offsets.
#[derive(Debug)]
pub struct RelationStore {
    ids: Vec<i64>,
    member_offsets: Vec<u32>,
    member_types: Vec<u8>,
    member_refs: Vec<i64>,
    member_role_idx: Vec<u32>,
    tags: TagStore,
    index: Option<IdIndex>,
    bboxes: Vec<Option<Rect>>,
    tree: Option<RTree<BboxEntry>>,
}

impl Default for RelationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RelationStore {
    pub fn new() -> Self {
        RelationStore {
            ids: Vec::new(),
            member_offsets: vec![0],
            member_types: Vec::new(),
            member_refs: Vec::new(),
            member_role_idx: Vec::new(),
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

    pub fn member_count(&self) -> usize {
        self.member_refs.len()
    }

    pub fn add(&mut self, relation: &Relation, strings: &mut StringTable) {
        let members: Vec<(u8, i64, u32)> = relation
            .members
            .iter()
            .map(|m| (member_type_code(m.mtype), m.mref, strings.intern(&m.role)))
            .collect();
        let pairs: Vec<(u32, u32)> = relation
            .tags
            .iter()
            .map(|(k, v)| (strings.intern(k), strings.intern(v)))
            .collect();
        self.push_raw(relation.id, members.into_iter(), pairs.into_iter());
    }

    pub(crate) fn push_raw(
        &mut self,
        id: i64,
        members: impl Iterator<Item = (u8, i64, u32)>,
        pairs: impl Iterator<Item = (u32, u32)>,
    ) {
        self.ids.push(id);
        for (mtype, mref, role_idx) in members {
            self.member_types.push(mtype);
            self.member_refs.push(mref);
            self.member_role_idx.push(role_idx);
        }
        self.member_offsets.push(self.member_refs.len() as u32);
        self.tags.add_remapped(pairs);
        self.index = None;
    }

    pub fn build_index(&mut self) -> Result<(), StoreError> {
        let index = IdIndex::build(&self.ids).map_err(|id| StoreError::DuplicateId {
            kind: EntityType::Relation,
            id,
        })?;
        self.index = Some(index);
        Ok(())
    }

    /// Resolves each relation's geometry bbox and bulk loads the R-tree.
    pub fn build_spatial_index(
        &mut self,
        nodes: &NodeStore,
        ways: &WayStore,
        strings: &StringTable,
    ) {
        self.bboxes = (0..self.len())
            .map(|i| {
                self.geometry(i, nodes, ways, strings)
                    .and_then(|g| geometry_bbox(&g))
            })
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
            .expect("relation store read before build_indexes()")
    }

    pub fn id(&self, i: usize) -> i64 {
        self.ids[i]
    }

    /// Raw member triples (type code, ref, role index) of relation `i`.
    pub fn raw_members(&self, i: usize) -> impl Iterator<Item = (u8, i64, u32)> + '_ {
        let start = self.member_offsets[i] as usize;
        let end = self.member_offsets[i + 1] as usize;
        (start..end).map(move |m| (self.member_types[m], self.member_refs[m], self.member_role_idx[m]))
    }

    pub fn members(&self, i: usize, strings: &StringTable) -> Vec<Member> {
        self.raw_members(i)
            .map(|(mtype, mref, role_idx)| Member {
                mtype: member_type_from_code(mtype),
                mref,
                role: strings.get(role_idx).to_owned(),
            })
            .collect()
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

    pub fn get_by_index(&self, i: usize, strings: &StringTable) -> Relation {
        Relation {
            id: self.ids[i],
            members: self.members(i, strings),
            tags: self.tags.get_tags(i, strings),
        }
    }

    pub fn get_by_id(&self, id: i64, strings: &StringTable) -> Option<Relation> {
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

    pub fn bbox(&self, i: usize) -> Option<Rect> {
        self.bboxes.get(i).copied().flatten()
    }

    /// R-tree query for relations whose geometry bbox intersects `rect`.
    pub fn intersects(&self, rect: &Rect) -> Vec<u32> {
        match &self.tree {
            Some(tree) => tree
                .locate_in_envelope_intersecting(&spatial::envelope(rect))
                .map(|entry| entry.data)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Resolves members into one geometry. Multipolygons assemble member
    /// ways into closed rings; any open outer ring makes the whole
    /// relation yield `None`, without error.
    pub fn geometry(
        &self,
        i: usize,
        nodes: &NodeStore,
        ways: &WayStore,
        strings: &StringTable,
    ) -> Option<RelationGeometry> {
        let mut visited = FxHashSet::default();
        self.geometry_at_depth(i, nodes, ways, strings, &mut visited, 0)
    }

    fn geometry_at_depth(
        &self,
        i: usize,
        nodes: &NodeStore,
        ways: &WayStore,
        strings: &StringTable,
        visited: &mut FxHashSet<i64>,
        depth: usize,
    ) -> Option<RelationGeometry> {
        if depth >= MAX_RELATION_DEPTH || !visited.insert(self.ids[i]) {
            return None;
        }

        let tags = self.tags.get_tags(i, strings);
        let kind = tag_value(&tags, "type");
        if matches!(kind, Some("multipolygon") | Some("boundary")) {
            return self.assemble_rings(i, nodes, ways, strings);
        }

        let mut points = Vec::new();
        let mut lines = Vec::new();
        for (mtype, mref, _) in self.raw_members(i) {
            match member_type_from_code(mtype) {
                EntityType::Node => {
                    if let Some(n) = nodes.index_of(mref) {
                        points.push(nodes.coord(n as usize));
                    }
                }
                EntityType::Way => {
                    if let Some(w) = ways.index_of(mref) {
                        let line = ways.coordinates(w as usize, nodes);
                        if line.0.len() >= 2 {
                            lines.push(line);
                        }
                    }
                }
                EntityType::Relation => {
                    if let Some(sub) = self.index_of(mref) {
                        match self.geometry_at_depth(
                            sub as usize,
                            nodes,
                            ways,
                            strings,
                            visited,
                            depth + 1,
                        ) {
                            Some(RelationGeometry::Points(p)) => points.extend(p),
                            Some(RelationGeometry::Lines(l)) => lines.extend(l),
                            Some(RelationGeometry::Rings(rings)) => {
                                lines.extend(rings.into_iter().map(|p| p.into_inner().0))
                            }
                            None => {}
                        }
                    }
                }
            }
        }

        if !lines.is_empty() {
            Some(RelationGeometry::Lines(lines))
        } else if !points.is_empty() {
            Some(RelationGeometry::Points(points))
        } else {
            None
        }
    }

    fn assemble_rings(
        &self,
        i: usize,
        nodes: &NodeStore,
        ways: &WayStore,
        strings: &StringTable,
    ) -> Option<RelationGeometry> {
        let mut outer_pieces = Vec::new();
        let mut inner_pieces = Vec::new();
        for (mtype, mref, role_idx) in self.raw_members(i) {
            if member_type_from_code(mtype) != EntityType::Way {
                continue;
            }
            let Some(w) = ways.index_of(mref) else {
                continue;
            };
            let refs = ways.refs(w as usize).to_vec();
            if refs.is_empty() {
                continue;
            }
            if strings.get(role_idx) == "inner" {
                inner_pieces.push(refs);
            } else {
                outer_pieces.push(refs);
            }
        }
        if outer_pieces.is_empty() {
            return None;
        }

        let (outer_rings, open) = join_rings(outer_pieces);
        if open {
            return None;
        }
        let (inner_rings, _) = join_rings(inner_pieces);

        let resolve = |refs: &[i64]| -> Option<LineString> {
            let coords: Vec<Coord> = refs
                .iter()
                .filter_map(|&r| nodes.index_of(r).map(|n| nodes.coord(n as usize)))
                .collect();
            (coords.len() == refs.len()).then(|| LineString(coords))
        };

        let mut polygons: Vec<Polygon> = Vec::new();
        for ring in &outer_rings {
            polygons.push(Polygon::new(resolve(ring)?, Vec::new()));
        }
        for ring in &inner_rings {
            let Some(line) = resolve(ring) else { continue };
            let Some(first) = line.0.first().copied() else {
                continue;
            };
            for poly in &mut polygons {
                if poly.contains(&first) {
                    poly.interiors_push(line);
                    break;
                }
            }
        }
        Some(RelationGeometry::Rings(polygons))
    }

    pub(crate) fn buffers(&self) -> RelationBufferRefs<'_> {
        let (tag_pairs, tag_offsets) = self.tags.buffers();
        RelationBufferRefs {
            ids: &self.ids,
            member_offsets: &self.member_offsets,
            member_types: &self.member_types,
            member_refs: &self.member_refs,
            member_role_idx: &self.member_role_idx,
            tag_pairs,
            tag_offsets,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_raw(
        ids: Vec<i64>,
        member_offsets: Vec<u32>,
        member_types: Vec<u8>,
        member_refs: Vec<i64>,
        member_role_idx: Vec<u32>,
        tag_pairs: Vec<u32>,
        tag_offsets: Vec<u32>,
    ) -> Self {
        RelationStore {
            ids,
            member_offsets,
            member_types,
            member_refs,
            member_role_idx,
            tags: TagStore::from_buffers(tag_pairs, tag_offsets),
            index: None,
            bboxes: Vec::new(),
            tree: None,
        }
    }
}

pub(crate) struct RelationBufferRefs<'a> {
    pub ids: &'a [i64],
    pub member_offsets: &'a [u32],
    pub member_types: &'a [u8],
    pub member_refs: &'a [i64],
    pub member_role_idx: &'a [u32],
    pub tag_pairs: &'a [u32],
    pub tag_offsets: &'a [u32],
}

fn geometry_bbox(geometry: &RelationGeometry) -> Option<Rect> {
    match geometry {
        RelationGeometry::Points(points) => LineString(points.clone()).bounding_rect(),
        RelationGeometry::Lines(lines) => {
            let mut merged: Option<Rect> = None;
            for line in lines {
                if let Some(bbox) = line.bounding_rect() {
                    merged = Some(match merged {
                        Some(acc) => merge_rects(acc, bbox),
                        None => bbox,
                    });
                }
            }
            merged
        }
        RelationGeometry::Rings(polygons) => {
            let mut merged: Option<Rect> = None;
            for poly in polygons {
                if let Some(bbox) = poly.bounding_rect() {
                    merged = Some(match merged {
                        Some(acc) => merge_rects(acc, bbox),
                        None => bbox,
                    });
                }
            }
            merged
        }
    }
}

fn merge_rects(a: Rect, b: Rect) -> Rect {
    Rect::new(
        Coord {
            x: a.min().x.min(b.min().x),
            y: a.min().y.min(b.min().y),
        },
        Coord {
            x: a.max().x.max(b.max().x),
            y: a.max().y.max(b.max().y),
        },
    )
}

/// Joins way ref sequences into rings by matching endpoints. Returns the
/// closed rings and whether any chain was left open.
fn join_rings(pieces: Vec<Vec<i64>>) -> (Vec<Vec<i64>>, bool) {
    let mut closed = Vec::new();
    // every open chain is registered under both of its endpoints
    let mut open: FxHashMap<i64, Vec<i64>> = FxHashMap::default();

    for piece in pieces {
        if piece.len() < 2 {
            continue;
        }
        let mut current = piece;
        loop {
            let first = *current.first().unwrap();
            let last = *current.last().unwrap();
            if first == last {
                closed.push(current);
                break;
            }

            let key = if open.contains_key(&last) {
                last
            } else if open.contains_key(&first) {
                first
            } else {
                open.insert(first, current.clone());
                open.insert(last, current);
                break;
            };
            let neighbour = open.remove(&key).unwrap();
            let n_first = *neighbour.first().unwrap();
            let n_last = *neighbour.last().unwrap();
            open.remove(if n_first == key { &n_last } else { &n_first });

            current = if last == n_first {
                let mut joined = current;
                joined.extend_from_slice(&neighbour[1..]);
                joined
            } else if last == n_last {
                let mut joined = current;
                joined.extend(neighbour.iter().rev().skip(1));
                joined
            } else if first == n_last {
                let mut joined = neighbour;
                joined.extend_from_slice(&current[1..]);
                joined
            } else {
                let mut joined: Vec<i64> = neighbour.into_iter().rev().collect();
                joined.extend_from_slice(&current[1..]);
                joined
            };
        }
    }

    (closed, !open.is_empty())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Node;

    fn grid_fixture() -> (StringTable, NodeStore, WayStore) {
        let mut strings = StringTable::new();
        let mut nodes = NodeStore::new();
        // unit square corners 1..4 and an island corner triangle 5..7
        let coords = [
            (1, 0.0, 0.0),
            (2, 1.0, 0.0),
            (3, 1.0, 1.0),
            (4, 0.0, 1.0),
            (5, 0.2, 0.2),
            (6, 0.8, 0.2),
            (7, 0.5, 0.8),
        ];
        for (id, lon, lat) in coords {
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
        // outer square split into two open halves
        ways.add(
            &crate::model::Way {
                id: 10,
                refs: vec![1, 2, 3],
                tags: Vec::new(),
            },
            &mut strings,
        );
        ways.add(
            &crate::model::Way {
                id: 11,
                refs: vec![3, 4, 1],
                tags: Vec::new(),
            },
            &mut strings,
        );
        // closed inner triangle
        ways.add(
            &crate::model::Way {
                id: 12,
                refs: vec![5, 6, 7, 5],
                tags: Vec::new(),
            },
            &mut strings,
        );
        // dangling piece that can never close
        ways.add(
            &crate::model::Way {
                id: 13,
                refs: vec![3, 4],
                tags: Vec::new(),
            },
            &mut strings,
        );
        ways.build_index().unwrap();
        (strings, nodes, ways)
    }

    fn relation(id: i64, members: Vec<(EntityType, i64, &str)>, tags: Tags) -> Relation {
        Relation {
            id,
            members: members
                .into_iter()
                .map(|(mtype, mref, role)| Member {
                    mtype,
                    mref,
                    role: role.to_owned(),
                })
                .collect(),
            tags,
        }
    }

    #[test]
    fn test_multipolygon_assembly() {
        let (mut strings, nodes, ways) = grid_fixture();
        let mut relations = RelationStore::new();
        relations.add(
            &relation(
                20,
                vec![
                    (EntityType::Way, 10, "outer"),
                    (EntityType::Way, 11, "outer"),
                    (EntityType::Way, 12, "inner"),
                ],
                vec![("type".into(), "multipolygon".into())],
            ),
            &mut strings,
        );
        relations.build_index().unwrap();

        let geometry = relations.geometry(0, &nodes, &ways, &strings).unwrap();
        let RelationGeometry::Rings(polygons) = geometry else {
            panic!("expected rings");
        };
        assert_eq!(polygons.len(), 1);
        assert_eq!(polygons[0].interiors().len(), 1);
        assert_eq!(polygons[0].exterior().0.len(), 5);
    }

    #[test]
    fn test_open_ring_yields_no_geometry() {
        let (mut strings, nodes, ways) = grid_fixture();
        let mut relations = RelationStore::new();
        relations.add(
            &relation(
                21,
                vec![
                    (EntityType::Way, 10, "outer"),
                    (EntityType::Way, 13, "outer"),
                ],
                vec![("type".into(), "multipolygon".into())],
            ),
            &mut strings,
        );
        relations.build_index().unwrap();

        assert_eq!(relations.geometry(0, &nodes, &ways, &strings), None);
    }

    #[test]
    fn test_plain_relation_collects_lines_and_cycles_stop() {
        let (mut strings, nodes, ways) = grid_fixture();
        let mut relations = RelationStore::new();
        // 30 references 31, 31 references 30: resolution must terminate
        relations.add(
            &relation(
                30,
                vec![
                    (EntityType::Way, 10, ""),
                    (EntityType::Relation, 31, ""),
                ],
                Vec::new(),
            ),
            &mut strings,
        );
        relations.add(
            &relation(31, vec![(EntityType::Relation, 30, "")], Vec::new()),
            &mut strings,
        );
        relations.build_index().unwrap();

        let geometry = relations.geometry(0, &nodes, &ways, &strings).unwrap();
        let RelationGeometry::Lines(lines) = geometry else {
            panic!("expected lines");
        };
        assert_eq!(lines.len(), 1);

        // entering from the other end terminates as well
        let through_cycle = relations.geometry(1, &nodes, &ways, &strings).unwrap();
        assert!(matches!(through_cycle, RelationGeometry::Lines(l) if l.len() == 1));
    }

    #[test]
    fn test_member_round_trip() {
        let (mut strings, _, _) = grid_fixture();
        let mut relations = RelationStore::new();
        let rel = relation(
            40,
            vec![(EntityType::Node, 1, "stop"), (EntityType::Way, 10, "")],
            vec![("route".into(), "bus".into())],
        );
        relations.add(&rel, &mut strings);
        relations.build_index().unwrap();
        assert_eq!(relations.get_by_id(40, &strings), Some(rel));
    }
}
