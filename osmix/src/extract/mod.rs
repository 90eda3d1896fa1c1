//! Geographic extraction: a spatial sub-index under a completeness policy.

use crate::model::{tag_value, EntityType};
use crate::osm::Osm;
use crate::store::StoreError;
use error_stack::Report;
use geo::Rect;
use rustc_hash::FxHashSet;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractPolicy {
    /// Nodes inside the bbox; way refs are trimmed to surviving nodes.
    Simple,
    /// A way with any node inside keeps all refs and pulls the outside
    /// nodes in; included relations keep their full member list.
    CompleteWays,
    /// `CompleteWays`, plus multipolygon relations touching the bbox pull
    /// in their whole member-way closure.
    Smart,
}

impl FromStr for ExtractPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(ExtractPolicy::Simple),
            "complete_ways" | "complete-ways" => Ok(ExtractPolicy::CompleteWays),
            "smart" => Ok(ExtractPolicy::Smart),
            other => Err(format!("unknown extract policy {other:?}")),
        }
    }
}

/// Builds a new finalized index holding the part of `src` selected by
/// `bbox` under the given policy.
pub fn create_extract(
    src: &Osm,
    bbox: &Rect,
    policy: ExtractPolicy,
) -> Result<Osm, Report<StoreError>> {
    src.ensure_ready()?;

    let inside: FxHashSet<i64> = src
        .nodes
        .find_indexes_within_bbox(bbox)
        .into_iter()
        .map(|i| src.nodes.id(i as usize))
        .collect();

    let mut kept_nodes = inside.clone();
    let mut kept_way_ids: FxHashSet<i64> = FxHashSet::default();
    // way id → refs it keeps in the extract
    let mut way_refs: Vec<(u32, Vec<i64>)> = Vec::new();

    for i in 0..src.ways.len() {
        let refs = src.ways.refs(i);
        if !refs.iter().any(|r| inside.contains(r)) {
            continue;
        }
        let refs = match policy {
            ExtractPolicy::Simple => refs
                .iter()
                .copied()
                .filter(|r| inside.contains(r))
                .collect(),
            _ => refs.to_vec(),
        };
        if policy != ExtractPolicy::Simple {
            pull_nodes(src, &refs, &mut kept_nodes);
        }
        kept_way_ids.insert(src.ways.id(i));
        way_refs.push((i as u32, refs));
    }

    if policy == ExtractPolicy::Smart {
        pull_multipolygon_closures(src, &mut kept_nodes, &mut kept_way_ids, &mut way_refs);
    }

    // two passes so relation → relation members settle regardless of order
    let mut kept_relation_ids: FxHashSet<i64> = FxHashSet::default();
    for _ in 0..2 {
        for i in 0..src.relations.len() {
            let id = src.relations.id(i);
            if kept_relation_ids.contains(&id) {
                continue;
            }
            let any_member = src.relations.raw_members(i).any(|(mtype, mref, _)| {
                match mtype {
                    0 => kept_nodes.contains(&mref),
                    1 => kept_way_ids.contains(&mref),
                    _ => kept_relation_ids.contains(&mref),
                }
            });
            if any_member {
                kept_relation_ids.insert(id);
            }
        }
    }

    let mut out = Osm::new();
    out.header = src.header.clone();
    out.header.bbox = Some([bbox.min().x, bbox.min().y, bbox.max().x, bbox.max().y]);

    for i in src.nodes.sorted() {
        if kept_nodes.contains(&src.nodes.id(i as usize)) {
            out.add_node(&src.nodes.get_by_index(i as usize, &src.strings));
        }
    }
    way_refs.sort_by_key(|&(i, _)| src.ways.id(i as usize));
    for (i, refs) in way_refs {
        let mut way = src.ways.get_by_index(i as usize, &src.strings);
        way.refs = refs;
        out.add_way(&way);
    }
    for i in src.relations.sorted() {
        let i = i as usize;
        if !kept_relation_ids.contains(&src.relations.id(i)) {
            continue;
        }
        let mut relation = src.relations.get_by_index(i, &src.strings);
        if policy == ExtractPolicy::Simple {
            relation.members.retain(|m| match m.mtype {
                EntityType::Node => kept_nodes.contains(&m.mref),
                EntityType::Way => kept_way_ids.contains(&m.mref),
                EntityType::Relation => kept_relation_ids.contains(&m.mref),
            });
        }
        out.add_relation(&relation);
    }

    out.build_indexes()?;
    Ok(out)
}

fn pull_nodes(src: &Osm, refs: &[i64], kept_nodes: &mut FxHashSet<i64>) {
    for &r in refs {
        if src.nodes.index_of(r).is_some() {
            kept_nodes.insert(r);
        }
    }
}

/// Multipolygon relations already touching the extract pull in every
/// member way with all of its nodes.
fn pull_multipolygon_closures(
    src: &Osm,
    kept_nodes: &mut FxHashSet<i64>,
    kept_way_ids: &mut FxHashSet<i64>,
    way_refs: &mut Vec<(u32, Vec<i64>)>,
) {
    for i in 0..src.relations.len() {
        let tags = src.relations.get_tags(i, &src.strings);
        if tag_value(&tags, "type") != Some("multipolygon") {
            continue;
        }
        let touches = src.relations.raw_members(i).any(|(mtype, mref, _)| match mtype {
            0 => kept_nodes.contains(&mref),
            1 => kept_way_ids.contains(&mref),
            _ => false,
        });
        if !touches {
            continue;
        }
        for (mtype, mref, _) in src.relations.raw_members(i) {
            if mtype != 1 || kept_way_ids.contains(&mref) {
                continue;
            }
            let Some(w) = src.ways.index_of(mref) else {
                continue;
            };
            let refs = src.ways.refs(w as usize).to_vec();
            pull_nodes(src, &refs, kept_nodes);
            kept_way_ids.insert(mref);
            way_refs.push((w, refs));
        }
    }
}
