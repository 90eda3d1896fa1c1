//! The Osm facade: one header, one string table, three columnar stores.

use crate::model::{bbox_rect, Entity, EntityType, Node, Relation, Way};
use crate::store::{NodeStore, RelationStore, StoreError, WayStore};
use crate::strings::StringTable;
use error_stack::Report;
use geo::Rect;
use serde::{Deserialize, Serialize};

/// File-level metadata, preserved across snapshot and PBF round trips.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsmHeader {
    pub writing_program: Option<String>,
    pub source: Option<String>,
    /// `[min_lon, min_lat, max_lon, max_lat]`
    pub bbox: Option<[f64; 4]>,
    pub replication_timestamp: Option<i64>,
    pub replication_sequence_number: Option<i64>,
    pub required_features: Vec<String>,
    pub optional_features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsmInfo {
    pub nodes: usize,
    pub ways: usize,
    pub way_refs: usize,
    pub relations: usize,
    pub relation_members: usize,
    pub strings: usize,
    pub tag_pairs: usize,
}

/// An in-memory OSM index. Created empty, filled by `add_*` calls, then
/// finalized once by [`Osm::build_indexes`]; readers treat it as immutable
/// afterwards. Further mutation goes through the changeset engine, which
/// produces a new `Osm`.
#[derive(Debug, Default)]
pub struct Osm {
    pub header: OsmHeader,
    pub strings: StringTable,
    pub nodes: NodeStore,
    pub ways: WayStore,
    pub relations: RelationStore,
    pub(crate) ready: bool,
}

impl Osm {
    pub fn new() -> Self {
        Osm {
            header: OsmHeader::default(),
            strings: StringTable::new(),
            nodes: NodeStore::new(),
            ways: WayStore::new(),
            relations: RelationStore::new(),
            ready: false,
        }
    }

    pub fn add_node(&mut self, node: &Node) {
        self.nodes.add(node, &mut self.strings);
        self.ready = false;
    }

    pub fn add_way(&mut self, way: &Way) {
        self.ways.add(way, &mut self.strings);
        self.ready = false;
    }

    pub fn add_relation(&mut self, relation: &Relation) {
        self.relations.add(relation, &mut self.strings);
        self.ready = false;
    }

    pub fn add_entity(&mut self, entity: &Entity) {
        match entity {
            Entity::Node(n) => self.add_node(n),
            Entity::Way(w) => self.add_way(w),
            Entity::Relation(r) => self.add_relation(r),
        }
    }

    /// Sorts the derived id maps without permuting storage. Fails on
    /// duplicate ids; the store contents are untouched either way.
    pub fn build_indexes(&mut self) -> Result<(), Report<StoreError>> {
        self.nodes.build_index()?;
        self.ways.build_index()?;
        self.relations.build_index()?;
        self.ready = true;
        Ok(())
    }

    /// Builds the node, way and relation spatial trees. Requires
    /// [`Osm::build_indexes`] to have run.
    pub fn build_spatial_indexes(&mut self) -> Result<(), Report<StoreError>> {
        self.ensure_ready()?;
        self.nodes.build_spatial_index();
        self.ways.build_spatial_index(&self.nodes);
        self.relations
            .build_spatial_index(&self.nodes, &self.ways, &self.strings);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), Report<StoreError>> {
        if self.ready {
            Ok(())
        } else {
            Err(Report::new(StoreError::NotReady))
        }
    }

    pub fn info(&self) -> OsmInfo {
        OsmInfo {
            nodes: self.nodes.len(),
            ways: self.ways.len(),
            way_refs: self.ways.ref_count(),
            relations: self.relations.len(),
            relation_members: self.relations.member_count(),
            strings: self.strings.len(),
            tag_pairs: self.nodes.tag_store().pair_count()
                + self.ways.tag_store().pair_count()
                + self.relations.tag_store().pair_count(),
        }
    }

    /// Header bbox when present, otherwise the extent of the node store.
    pub fn bbox(&self) -> Option<Rect> {
        if let Some([min_lon, min_lat, max_lon, max_lat]) = self.header.bbox {
            return Some(bbox_rect(min_lon, min_lat, max_lon, max_lat));
        }
        if self.nodes.is_empty() {
            return None;
        }
        let mut min_lon = f64::INFINITY;
        let mut min_lat = f64::INFINITY;
        let mut max_lon = f64::NEG_INFINITY;
        let mut max_lat = f64::NEG_INFINITY;
        for i in 0..self.nodes.len() {
            min_lon = min_lon.min(self.nodes.lon(i));
            max_lon = max_lon.max(self.nodes.lon(i));
            min_lat = min_lat.min(self.nodes.lat(i));
            max_lat = max_lat.max(self.nodes.lat(i));
        }
        Some(bbox_rect(min_lon, min_lat, max_lon, max_lat))
    }

    pub fn get_node(&self, id: i64) -> Option<Node> {
        self.nodes.get_by_id(id, &self.strings)
    }

    pub fn get_way(&self, id: i64) -> Option<Way> {
        self.ways.get_by_id(id, &self.strings)
    }

    pub fn get_relation(&self, id: i64) -> Option<Relation> {
        self.relations.get_by_id(id, &self.strings)
    }

    pub fn get_entity(&self, kind: EntityType, id: i64) -> Option<Entity> {
        match kind {
            EntityType::Node => self.get_node(id).map(Entity::Node),
            EntityType::Way => self.get_way(id).map(Entity::Way),
            EntityType::Relation => self.get_relation(id).map(Entity::Relation),
        }
    }

    /// All entities in export order: nodes, then ways, then relations,
    /// each ascending by id.
    pub fn sorted_entities(&self) -> impl Iterator<Item = Entity> + '_ {
        let nodes = self
            .nodes
            .sorted()
            .map(|i| Entity::Node(self.nodes.get_by_index(i as usize, &self.strings)));
        let ways = self
            .ways
            .sorted()
            .map(|i| Entity::Way(self.ways.get_by_index(i as usize, &self.strings)));
        let relations = self
            .relations
            .sorted()
            .map(|i| Entity::Relation(self.relations.get_by_index(i as usize, &self.strings)));
        nodes.chain(ways).chain(relations)
    }

    /// Smallest id strictly greater than every id in the index; used to
    /// synthesize ids for created entities.
    pub fn next_free_id(&self) -> i64 {
        let max = |ids: &mut dyn Iterator<Item = i64>| ids.max().unwrap_or(0);
        let nodes = max(&mut (0..self.nodes.len()).map(|i| self.nodes.id(i)));
        let ways = max(&mut (0..self.ways.len()).map(|i| self.ways.id(i)));
        let relations = max(&mut (0..self.relations.len()).map(|i| self.relations.id(i)));
        nodes.max(ways).max(relations).max(0) + 1
    }
}
