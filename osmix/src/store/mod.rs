//! Columnar entity stores: parallel append-order arrays per entity kind,
//! finalized by an id index and optional spatial index.

mod nodes;
mod relations;
mod ways;

pub use nodes::NodeStore;
pub use relations::{RelationGeometry, RelationStore};
pub use ways::WayStore;

use crate::model::EntityType;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Duplicate {kind:?} id {id}")]
    DuplicateId { kind: EntityType, id: i64 },
    #[error("Index read before build_indexes()")]
    NotReady,
    #[error("{kind:?} {id} references missing entity {missing}")]
    MissingReference {
        kind: EntityType,
        id: i64,
        missing: i64,
    },
    #[error("Operation aborted")]
    Aborted,
}

/// Relation member type discriminants as stored in the flat member arrays
/// (and on the PBF wire).
pub(crate) fn member_type_code(mtype: EntityType) -> u8 {
    match mtype {
        EntityType::Node => 0,
        EntityType::Way => 1,
        EntityType::Relation => 2,
    }
}

pub(crate) fn member_type_from_code(code: u8) -> EntityType {
    match code {
        0 => EntityType::Node,
        1 => EntityType::Way,
        _ => EntityType::Relation,
    }
}
