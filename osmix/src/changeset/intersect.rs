use crate::changeset::{Change, ChangeType, Changeset};
use crate::model::{quantize, tag_value, Entity, EntityType, Node, Tags, Way};
use crate::osm::Osm;
use geo::line_intersection::{line_intersection, LineIntersection};
use geo::{BoundingRect, Coord, Line, LineString};
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, Clone, Copy)]
struct Splice {
    /// Ref-array index of the segment start the node is spliced after.
    seg: usize,
    /// Parametric position along that segment, used to order multiple
    /// splices within one segment.
    t: f64,
    node: i64,
}

/// Finds crossings between patch highways and base highways and promotes
/// them to shared nodes, splicing the new ref into both ways at the
/// parametric position of the intersection.
pub fn create_intersections_for_ways(base: &Osm, patch: &Osm, changeset: &mut Changeset) {
    let mut next_id = base.next_free_id().max(patch.next_free_id());

    let mut patch_splices: FxHashMap<i64, Vec<Splice>> = FxHashMap::default();
    let mut base_splices: FxHashMap<i64, Vec<Splice>> = FxHashMap::default();
    let mut created: Vec<(i64, Coord, i64, i64)> = Vec::new();
    let mut seen: FxHashSet<(i64, i64, i32, i32)> = FxHashSet::default();

    for wi in patch.ways.sorted() {
        let wi = wi as usize;
        let patch_way_id = patch.ways.id(wi);
        let patch_tags = patch.ways.get_tags(wi, &patch.strings);
        if tag_value(&patch_tags, "highway").is_none() {
            continue;
        }

        // dedupe may already have rewritten this way's refs
        let patch_refs: Vec<i64> = match changeset.get(&(EntityType::Way, patch_way_id)) {
            Some(Change {
                entity: Entity::Way(way),
                ..
            }) => way.refs.clone(),
            _ => patch.ways.refs(wi).to_vec(),
        };
        let patch_points = resolve_points(&patch_refs, patch, base);
        if patch_points.len() < 2 {
            continue;
        }

        let Some(bbox) = LineString(patch_points.iter().map(|&(_, c)| c).collect())
            .bounding_rect()
        else {
            continue;
        };
        let candidates = match base.ways.has_spatial_index() {
            true => base.ways.intersects(&bbox),
            false => (0..base.ways.len() as u32).collect(),
        };

        for bi in candidates {
            let bi = bi as usize;
            let base_way_id = base.ways.id(bi);
            if base_way_id == patch_way_id {
                continue;
            }
            let base_tags = base.ways.get_tags(bi, &base.strings);
            if tag_value(&base_tags, "highway").is_none()
                || !grade_compatible(&patch_tags, &base_tags)
            {
                continue;
            }

            let base_refs = base.ways.refs(bi).to_vec();
            let base_points = resolve_points(&base_refs, base, base);
            if base_points.len() < 2 {
                continue;
            }

            for pw in patch_points.windows(2) {
                let (pa_idx, pa) = pw[0];
                let (_, pb) = pw[1];
                for bw in base_points.windows(2) {
                    let (ba_idx, ba) = bw[0];
                    let (_, bb) = bw[1];
                    let crossing =
                        line_intersection(Line::new(pa, pb), Line::new(ba, bb));
                    let Some(LineIntersection::SinglePoint {
                        intersection,
                        is_proper,
                    }) = crossing
                    else {
                        continue;
                    };
                    changeset.stats.intersection_points_found += 1;
                    if !is_proper {
                        continue;
                    }

                    let key = (
                        base_way_id,
                        patch_way_id,
                        quantize(intersection.x),
                        quantize(intersection.y),
                    );
                    if !seen.insert(key) {
                        continue;
                    }
                    // an existing shared vertex is already a junction
                    if has_vertex_at(&patch_points, intersection)
                        || has_vertex_at(&base_points, intersection)
                    {
                        continue;
                    }

                    let node_id = next_id;
                    next_id += 1;
                    created.push((node_id, intersection, patch_way_id, base_way_id));
                    patch_splices.entry(patch_way_id).or_default().push(Splice {
                        seg: pa_idx,
                        t: segment_t(pa, pb, intersection),
                        node: node_id,
                    });
                    base_splices.entry(base_way_id).or_default().push(Splice {
                        seg: ba_idx,
                        t: segment_t(ba, bb, intersection),
                        node: node_id,
                    });
                }
            }
        }
    }

    for (node_id, position, patch_way_id, base_way_id) in created {
        changeset.insert(Change {
            change_type: ChangeType::Create,
            entity: Entity::Node(Node {
                id: node_id,
                lon: position.x,
                lat: position.y,
                tags: Vec::new(),
            }),
            refs: vec![
                (EntityType::Way, patch_way_id),
                (EntityType::Way, base_way_id),
            ],
        });
        changeset.stats.intersection_nodes_created += 1;
    }

    for (way_id, splices) in patch_splices {
        apply_splices(changeset, way_id, splices, patch);
    }
    for (way_id, splices) in base_splices {
        apply_splices(changeset, way_id, splices, base);
    }
}

/// Rewrites a way's change entry (or adds a modify) with the junction
/// nodes spliced in.
fn apply_splices(changeset: &mut Changeset, way_id: i64, splices: Vec<Splice>, source: &Osm) {
    let key = (EntityType::Way, way_id);
    let mut change = match changeset.remove(&key) {
        Some(change) => change,
        None => Change {
            change_type: ChangeType::Modify,
            entity: Entity::Way(
                source
                    .get_way(way_id)
                    .expect("way disappeared during intersection pass"),
            ),
            refs: Vec::new(),
        },
    };
    if let Entity::Way(way) = &mut change.entity {
        *way = splice_refs(way.clone(), splices);
    }
    changeset.insert(change);
}

/// Resolves refs to coordinates, keeping the originating ref index. The
/// patch side may reference base nodes after deduplication.
fn resolve_points(refs: &[i64], primary: &Osm, fallback: &Osm) -> Vec<(usize, Coord)> {
    refs.iter()
        .enumerate()
        .filter_map(|(idx, &r)| {
            primary
                .nodes
                .index_of(r)
                .map(|n| primary.nodes.coord(n as usize))
                .or_else(|| {
                    fallback
                        .nodes
                        .index_of(r)
                        .map(|n| fallback.nodes.coord(n as usize))
                })
                .map(|c| (idx, c))
        })
        .collect()
}

/// Two-sided grade separation rule: a crossing only becomes a junction
/// when neither side is lifted or sunk relative to the other.
fn grade_compatible(a: &Tags, b: &Tags) -> bool {
    if tag_value(a, "bridge") != tag_value(b, "bridge") {
        return false;
    }
    if tag_value(a, "tunnel") != tag_value(b, "tunnel") {
        return false;
    }
    let layer = |tags: &Tags| {
        tag_value(tags, "layer")
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(0)
    };
    layer(a) == layer(b)
}

fn has_vertex_at(points: &[(usize, Coord)], p: Coord) -> bool {
    let (qx, qy) = (quantize(p.x), quantize(p.y));
    points
        .iter()
        .any(|&(_, c)| quantize(c.x) == qx && quantize(c.y) == qy)
}

fn segment_t(a: Coord, b: Coord, p: Coord) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    if dx.abs() >= dy.abs() {
        if dx == 0.0 {
            0.0
        } else {
            (p.x - a.x) / dx
        }
    } else {
        (p.y - a.y) / dy
    }
}

fn splice_refs(mut way: Way, mut splices: Vec<Splice>) -> Way {
    splices.sort_by(|a, b| {
        a.seg
            .cmp(&b.seg)
            .then(a.t.partial_cmp(&b.t).unwrap_or(std::cmp::Ordering::Equal))
    });
    let mut refs = Vec::with_capacity(way.refs.len() + splices.len());
    for (idx, &r) in way.refs.iter().enumerate() {
        refs.push(r);
        for splice in splices.iter().filter(|s| s.seg == idx) {
            refs.push(splice.node);
        }
    }
    way.refs = refs;
    way
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::changeset::{generate_changeset, ChangesetOptions};
    use crate::model::Node;

    fn highway(id: i64, refs: Vec<i64>) -> Way {
        Way {
            id,
            refs,
            tags: vec![("highway".into(), "residential".into())],
        }
    }

    fn node(id: i64, lon: f64, lat: f64) -> Node {
        Node {
            id,
            lon,
            lat,
            tags: Vec::new(),
        }
    }

    fn crossing_fixture(base_extra: Tags, patch_extra: Tags) -> (Osm, Osm) {
        let mut base = Osm::new();
        base.add_node(&node(1, 0.0, 0.0));
        base.add_node(&node(2, 10.0, 0.0));
        let mut h1 = highway(100, vec![1, 2]);
        h1.tags.extend(base_extra);
        base.add_way(&h1);
        base.build_indexes().unwrap();
        base.build_spatial_indexes().unwrap();

        let mut patch = Osm::new();
        patch.add_node(&node(11, 5.0, -1.0));
        patch.add_node(&node(12, 5.0, 1.0));
        let mut h2 = highway(200, vec![11, 12]);
        h2.tags.extend(patch_extra);
        patch.add_way(&h2);
        patch.build_indexes().unwrap();
        (base, patch)
    }

    #[test]
    fn test_crossing_creates_and_splices_node() {
        let (base, patch) = crossing_fixture(Vec::new(), Vec::new());
        let options = ChangesetOptions {
            create_intersections: true,
            ..Default::default()
        };
        let changeset = generate_changeset(&base, &patch, &options).unwrap();

        assert_eq!(changeset.stats.intersection_nodes_created, 1);
        assert!(changeset.stats.intersection_points_found >= 1);

        let new_id = base.next_free_id().max(patch.next_free_id());
        let node_change = changeset.get(&(EntityType::Node, new_id)).unwrap();
        let Entity::Node(created) = &node_change.entity else {
            panic!("expected node");
        };
        assert_eq!((created.lon, created.lat), (5.0, 0.0));

        let Entity::Way(h2) = &changeset.get(&(EntityType::Way, 200)).unwrap().entity
        else {
            panic!("expected way");
        };
        assert_eq!(h2.refs, vec![11, new_id, 12]);

        let h1_change = changeset.get(&(EntityType::Way, 100)).unwrap();
        assert_eq!(h1_change.change_type, ChangeType::Modify);
        let Entity::Way(h1) = &h1_change.entity else {
            panic!("expected way");
        };
        assert_eq!(h1.refs, vec![1, new_id, 2]);
    }

    #[test]
    fn test_bridge_skips_intersection() {
        let (base, patch) =
            crossing_fixture(vec![("bridge".into(), "yes".into())], Vec::new());
        let options = ChangesetOptions {
            create_intersections: true,
            ..Default::default()
        };
        let changeset = generate_changeset(&base, &patch, &options).unwrap();
        assert_eq!(changeset.stats.intersection_nodes_created, 0);
    }

    #[test]
    fn test_layer_mismatch_skips_intersection() {
        let (base, patch) = crossing_fixture(Vec::new(), vec![("layer".into(), "1".into())]);
        let options = ChangesetOptions {
            create_intersections: true,
            ..Default::default()
        };
        let changeset = generate_changeset(&base, &patch, &options).unwrap();
        assert_eq!(changeset.stats.intersection_nodes_created, 0);
    }

    #[test]
    fn test_shared_vertex_is_not_promoted() {
        let mut base = Osm::new();
        base.add_node(&node(1, 0.0, 0.0));
        base.add_node(&node(2, 10.0, 0.0));
        base.add_way(&highway(100, vec![1, 2]));
        base.build_indexes().unwrap();
        base.build_spatial_indexes().unwrap();

        // patch way ends exactly on the base way's first vertex
        let mut patch = Osm::new();
        patch.add_node(&node(11, 0.0, 0.0));
        patch.add_node(&node(12, 0.0, 5.0));
        patch.add_way(&highway(200, vec![11, 12]));
        patch.build_indexes().unwrap();

        let options = ChangesetOptions {
            create_intersections: true,
            ..Default::default()
        };
        let changeset = generate_changeset(&base, &patch, &options).unwrap();
        assert_eq!(changeset.stats.intersection_nodes_created, 0);
    }
}
