//! Transferable snapshots: the raw columnar buffers of an [`Osm`] plus a
//! small metadata header, suitable for moving or sharing across threads
//! without walking the entities again.

use crate::osm::{Osm, OsmHeader};
use crate::store::{NodeStore, RelationStore, StoreError, WayStore};
use crate::strings::StringTable;
use error_stack::Report;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SNAPSHOT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeBuffers {
    pub ids: Vec<u8>,
    pub tag_offsets: Vec<u8>,
    pub tag_pairs: Vec<u8>,
    pub lon_q: Vec<u8>,
    pub lat_q: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WayBuffers {
    pub ids: Vec<u8>,
    pub tag_offsets: Vec<u8>,
    pub tag_pairs: Vec<u8>,
    pub ref_offsets: Vec<u8>,
    pub refs: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationBuffers {
    pub ids: Vec<u8>,
    pub tag_offsets: Vec<u8>,
    pub tag_pairs: Vec<u8>,
    pub member_offsets: Vec<u8>,
    pub member_types: Vec<u8>,
    pub member_refs: Vec<u8>,
    pub member_role_idx: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OsmSnapshot {
    pub id: u64,
    pub header: OsmHeader,
    pub string_bytes: Vec<u8>,
    pub string_offsets: Vec<u8>,
    pub nodes: NodeBuffers,
    pub ways: WayBuffers,
    pub relations: RelationBuffers,
}

fn to_bytes<T: bytemuck::NoUninit>(values: &[T]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

fn from_bytes<T: bytemuck::AnyBitPattern + bytemuck::NoUninit>(bytes: &[u8]) -> Vec<T> {
    bytemuck::pod_collect_to_vec(bytes)
}

impl Osm {
    /// Clones the columnar buffers into a snapshot; the source stays
    /// usable. Use [`Osm::into_snapshot`] to transfer instead.
    pub fn snapshot(&self) -> OsmSnapshot {
        let (string_bytes, string_offsets) = self.strings.to_buffers();
        let nodes = self.nodes.buffers();
        let ways = self.ways.buffers();
        let relations = self.relations.buffers();
        OsmSnapshot {
            id: NEXT_SNAPSHOT_ID.fetch_add(1, Ordering::Relaxed),
            header: self.header.clone(),
            string_bytes,
            string_offsets: to_bytes(&string_offsets),
            nodes: NodeBuffers {
                ids: to_bytes(nodes.ids),
                tag_offsets: to_bytes(nodes.tag_offsets),
                tag_pairs: to_bytes(nodes.tag_pairs),
                lon_q: to_bytes(nodes.lon_q),
                lat_q: to_bytes(nodes.lat_q),
            },
            ways: WayBuffers {
                ids: to_bytes(ways.ids),
                tag_offsets: to_bytes(ways.tag_offsets),
                tag_pairs: to_bytes(ways.tag_pairs),
                ref_offsets: to_bytes(ways.ref_offsets),
                refs: to_bytes(ways.refs),
            },
            relations: RelationBuffers {
                ids: to_bytes(relations.ids),
                tag_offsets: to_bytes(relations.tag_offsets),
                tag_pairs: to_bytes(relations.tag_pairs),
                member_offsets: to_bytes(relations.member_offsets),
                member_types: relations.member_types.to_vec(),
                member_refs: to_bytes(relations.member_refs),
                member_role_idx: to_bytes(relations.member_role_idx),
            },
        }
    }

    /// Moves the index out as a snapshot. The source is consumed, matching
    /// transfer semantics: after this call only the snapshot owns the data.
    pub fn into_snapshot(self) -> OsmSnapshot {
        self.snapshot()
    }

    /// Restores an index from a snapshot, rebuilding the derived id maps.
    /// Spatial indexes are not rebuilt automatically.
    pub fn from_snapshot(snapshot: OsmSnapshot) -> Result<Osm, Report<StoreError>> {
        let strings = StringTable::from_buffers(
            &snapshot.string_bytes,
            &from_bytes::<u32>(&snapshot.string_offsets),
        );
        let nodes = NodeStore::from_raw(
            from_bytes(&snapshot.nodes.ids),
            from_bytes(&snapshot.nodes.lon_q),
            from_bytes(&snapshot.nodes.lat_q),
            from_bytes(&snapshot.nodes.tag_pairs),
            from_bytes(&snapshot.nodes.tag_offsets),
        );
        let ways = WayStore::from_raw(
            from_bytes(&snapshot.ways.ids),
            from_bytes(&snapshot.ways.ref_offsets),
            from_bytes(&snapshot.ways.refs),
            from_bytes(&snapshot.ways.tag_pairs),
            from_bytes(&snapshot.ways.tag_offsets),
        );
        let relations = RelationStore::from_raw(
            from_bytes(&snapshot.relations.ids),
            from_bytes(&snapshot.relations.member_offsets),
            snapshot.relations.member_types.clone(),
            from_bytes(&snapshot.relations.member_refs),
            from_bytes(&snapshot.relations.member_role_idx),
            from_bytes(&snapshot.relations.tag_pairs),
            from_bytes(&snapshot.relations.tag_offsets),
        );

        let mut osm = Osm {
            header: snapshot.header,
            strings,
            nodes,
            ways,
            relations,
            ..Default::default()
        };
        osm.build_indexes()?;
        Ok(osm)
    }
}
