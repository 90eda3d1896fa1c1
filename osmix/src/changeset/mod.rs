//! Typed change log over a base index, with the dedupe and intersection
//! passes that turn two indexes into one merged dataset.

mod apply;
mod dedupe;
mod diff;
mod intersect;

pub use apply::apply_changeset;
pub use diff::generate_direct_changes;

use crate::model::{Entity, EntityType};
use crate::osm::Osm;
use crate::store::StoreError;
use error_stack::Report;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeType {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub change_type: ChangeType,
    pub entity: Entity,
    /// Related entities touched by this change.
    pub refs: Vec<(EntityType, i64)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeStats {
    pub total_changes: usize,
    pub creates: usize,
    pub modifies: usize,
    pub deletes: usize,
    pub deduplicated_nodes: usize,
    pub deduplicated_nodes_replaced: usize,
    pub deduplicated_ways: usize,
    pub intersection_points_found: usize,
    pub intersection_nodes_created: usize,
}

/// Changes keyed by (entity type, id); iteration is deterministic in key
/// order.
#[derive(Debug, Default)]
pub struct Changeset {
    changes: BTreeMap<(EntityType, i64), Change>,
    pub stats: ChangeStats,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, change: Change) {
        let key = change.entity.key();
        let change_type = change.change_type;
        if let Some(previous) = self.changes.insert(key, change) {
            self.count(previous.change_type, -1);
        }
        self.count(change_type, 1);
    }

    pub fn remove(&mut self, key: &(EntityType, i64)) -> Option<Change> {
        let removed = self.changes.remove(key);
        if let Some(change) = &removed {
            self.count(change.change_type, -1);
        }
        removed
    }

    fn count(&mut self, change_type: ChangeType, delta: isize) {
        let bucket = match change_type {
            ChangeType::Create => &mut self.stats.creates,
            ChangeType::Modify => &mut self.stats.modifies,
            ChangeType::Delete => &mut self.stats.deletes,
        };
        *bucket = bucket.wrapping_add_signed(delta);
        self.stats.total_changes = self.stats.total_changes.wrapping_add_signed(delta);
    }

    pub fn get(&self, key: &(EntityType, i64)) -> Option<&Change> {
        self.changes.get(key)
    }

    pub fn get_mut(&mut self, key: &(EntityType, i64)) -> Option<&mut Change> {
        self.changes.get_mut(key)
    }

    pub fn contains(&self, key: &(EntityType, i64)) -> bool {
        self.changes.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.values()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ChangesetOptions {
    pub deduplicate_nodes: bool,
    pub create_intersections: bool,
    /// Strict-match tolerance in meters. Two candidate nodes closer than
    /// this collapse into one; the default covers coordinates that differ
    /// by a single 1e-7 degree quantum.
    pub dedupe_match_tolerance_m: f64,
    /// Spatial candidate query radius in meters.
    pub dedupe_candidate_radius_m: f64,
}

impl Default for ChangesetOptions {
    fn default() -> Self {
        ChangesetOptions {
            deduplicate_nodes: false,
            create_intersections: false,
            dedupe_match_tolerance_m: 0.02,
            dedupe_candidate_radius_m: 10.0,
        }
    }
}

/// Builds the changeset that merges `patch` into `base`: the direct diff,
/// then the optional dedupe and intersection passes.
pub fn generate_changeset(
    base: &Osm,
    patch: &Osm,
    options: &ChangesetOptions,
) -> Result<Changeset, Report<StoreError>> {
    base.ensure_ready()?;
    patch.ensure_ready()?;

    let mut changeset = diff::generate_direct_changes(base, patch)?;
    if options.deduplicate_nodes {
        dedupe::dedupe_nodes_and_ways(base, patch, &mut changeset, options);
    }
    if options.create_intersections {
        intersect::create_intersections_for_ways(base, patch, &mut changeset);
    }
    Ok(changeset)
}
