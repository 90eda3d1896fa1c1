use crate::changeset::{Change, ChangeType, Changeset, ChangesetOptions};
use crate::model::{entities_equal, Entity, EntityType, Tags};
use crate::osm::Osm;
use crate::spatial;
use rustc_hash::FxHashMap;

/// Geographic node deduplication: patch nodes that land on a base node
/// within the strict tolerance (and without conflicting tags) are dropped
/// from the changeset, and every way or relation referencing them is
/// rewritten to the base node's id.
pub fn dedupe_nodes_and_ways(
    base: &Osm,
    patch: &Osm,
    changeset: &mut Changeset,
    options: &ChangesetOptions,
) {
    // patch node id → base node id it collapses into
    let mut replacements: FxHashMap<i64, i64> = FxHashMap::default();
    // base node id → winning patch id; ascending iteration makes the
    // lowest patch id win collisions
    let mut claimed: FxHashMap<i64, i64> = FxHashMap::default();

    for i in patch.nodes.sorted() {
        let i = i as usize;
        let patch_id = patch.nodes.id(i);
        // only nodes the changeset would create are candidates
        if !matches!(
            changeset.get(&(EntityType::Node, patch_id)),
            Some(change) if change.change_type == ChangeType::Create
        ) {
            continue;
        }

        let lon = patch.nodes.lon(i);
        let lat = patch.nodes.lat(i);
        let candidates =
            base.nodes
                .find_indexes_within_radius(lon, lat, options.dedupe_candidate_radius_m);

        let mut best: Option<(f64, i64)> = None;
        for c in candidates {
            let c = c as usize;
            let distance = spatial::distance_m(lon, lat, base.nodes.lon(c), base.nodes.lat(c));
            if distance > options.dedupe_match_tolerance_m {
                continue;
            }
            if tags_conflict(
                &patch.nodes.get_tags(i, &patch.strings),
                &base.nodes.get_tags(c, &base.strings),
            ) {
                continue;
            }
            let base_id = base.nodes.id(c);
            let better = match best {
                Some((best_distance, best_id)) => {
                    distance < best_distance || (distance == best_distance && base_id < best_id)
                }
                None => true,
            };
            if better {
                best = Some((distance, base_id));
            }
        }

        if let Some((_, base_id)) = best {
            if claimed.contains_key(&base_id) {
                continue;
            }
            claimed.insert(base_id, patch_id);
            replacements.insert(patch_id, base_id);
        }
    }

    if replacements.is_empty() {
        return;
    }

    for patch_id in replacements.keys() {
        changeset.remove(&(EntityType::Node, *patch_id));
    }
    changeset.stats.deduplicated_nodes = replacements.len();

    rewrite_ways(base, patch, changeset, &replacements);
    rewrite_relations(patch, changeset, &replacements);
}

/// True when the two tag sets disagree on any shared key.
fn tags_conflict(a: &Tags, b: &Tags) -> bool {
    a.iter().any(|(k, v)| {
        b.iter()
            .any(|(bk, bv)| bk == k && bv != v)
    })
}

fn rewrite_ways(
    base: &Osm,
    patch: &Osm,
    changeset: &mut Changeset,
    replacements: &FxHashMap<i64, i64>,
) {
    for i in patch.ways.sorted() {
        let i = i as usize;
        let way_id = patch.ways.id(i);

        let mut touched: Vec<(EntityType, i64)> = Vec::new();
        let mut replaced = 0usize;
        let new_refs: Vec<i64> = patch
            .ways
            .refs(i)
            .iter()
            .map(|r| match replacements.get(r) {
                Some(&base_id) => {
                    replaced += 1;
                    touched.push((EntityType::Node, base_id));
                    base_id
                }
                None => *r,
            })
            .collect();
        if replaced == 0 {
            continue;
        }
        changeset.stats.deduplicated_nodes_replaced += replaced;

        let key = (EntityType::Way, way_id);
        let mut change = match changeset.remove(&key) {
            Some(change) => change,
            None => Change {
                change_type: ChangeType::Modify,
                entity: Entity::Way(patch.ways.get_by_index(i, &patch.strings)),
                refs: Vec::new(),
            },
        };
        if let Entity::Way(way) = &mut change.entity {
            way.refs = new_refs;
        }
        change.refs.extend(touched);

        // a created way may now be indistinguishable from the base way
        if change.change_type == ChangeType::Create {
            if let Some(base_way) = base.get_way(way_id) {
                if entities_equal(&Entity::Way(base_way), &change.entity) {
                    changeset.stats.deduplicated_ways += 1;
                    continue;
                }
            }
        }
        changeset.insert(change);
    }
}

fn rewrite_relations(
    patch: &Osm,
    changeset: &mut Changeset,
    replacements: &FxHashMap<i64, i64>,
) {
    for i in patch.relations.sorted() {
        let i = i as usize;
        let relation_id = patch.relations.id(i);

        let mut relation = patch.relations.get_by_index(i, &patch.strings);
        let mut touched: Vec<(EntityType, i64)> = Vec::new();
        for member in &mut relation.members {
            if member.mtype != EntityType::Node {
                continue;
            }
            if let Some(&base_id) = replacements.get(&member.mref) {
                member.mref = base_id;
                touched.push((EntityType::Node, base_id));
            }
        }
        if touched.is_empty() {
            continue;
        }
        changeset.stats.deduplicated_nodes_replaced += touched.len();

        let key = (EntityType::Relation, relation_id);
        let mut change = changeset.remove(&key).unwrap_or(Change {
            change_type: ChangeType::Modify,
            entity: Entity::Relation(relation.clone()),
            refs: Vec::new(),
        });
        change.entity = Entity::Relation(relation);
        change.refs.extend(touched);
        changeset.insert(change);
    }
}
