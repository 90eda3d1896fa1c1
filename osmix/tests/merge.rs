//! End-to-end merge scenarios: diff, dedupe and intersection passes
//! followed by apply.

use osmix::changeset::{apply_changeset, generate_changeset, ChangesetOptions};
use osmix::model::{EntityType, Node, Way};
use osmix::spatial;
use osmix::Osm;

fn node(id: i64, lon: f64, lat: f64) -> Node {
    Node {
        id,
        lon,
        lat,
        tags: Vec::new(),
    }
}

fn finalized(mut osm: Osm) -> Osm {
    osm.build_indexes().unwrap();
    osm.build_spatial_indexes().unwrap();
    osm
}

#[test]
fn direct_diff_counts_create_and_modify() {
    let mut base = Osm::new();
    base.add_node(&Node {
        id: 5,
        lon: 1.0,
        lat: 1.0,
        tags: vec![("amenity".into(), "cafe".into())],
    });
    let base = finalized(base);

    let mut patch = Osm::new();
    patch.add_node(&Node {
        id: 5,
        lon: 1.0,
        lat: 1.0,
        tags: vec![("amenity".into(), "cafe".into()), ("name".into(), "X".into())],
    });
    patch.add_node(&node(6, 2.0, 2.0));
    let patch = finalized(patch);

    let changeset = generate_changeset(&base, &patch, &ChangesetOptions::default()).unwrap();
    assert_eq!(changeset.stats.total_changes, 2);
    assert_eq!(changeset.stats.modifies, 1);
    assert_eq!(changeset.stats.creates, 1);

    let merged = apply_changeset(&base, &changeset).unwrap();
    let merged_node = merged.get_node(5).unwrap();
    assert!(merged_node
        .tags
        .iter()
        .any(|(k, v)| k == "name" && v == "X"));
    assert!(merged.get_node(6).is_some());
}

#[test]
fn dedupe_drops_patch_node_and_rewrites_ways() {
    let mut base = Osm::new();
    base.add_node(&node(1, 10.0, 20.0));
    let base = finalized(base);

    let mut patch = Osm::new();
    patch.add_node(&node(2, 10.0000001, 20.0000001));
    patch.add_node(&node(3, 10.001, 20.001));
    patch.add_way(&Way {
        id: 50,
        refs: vec![2, 3],
        tags: Vec::new(),
    });
    let patch = finalized(patch);

    let options = ChangesetOptions {
        deduplicate_nodes: true,
        ..Default::default()
    };
    let changeset = generate_changeset(&base, &patch, &options).unwrap();
    assert_eq!(changeset.stats.deduplicated_nodes, 1);
    assert!(changeset.stats.deduplicated_nodes_replaced >= 1);

    let merged = apply_changeset(&base, &changeset).unwrap();

    // node 2 is gone; way 50 references the base node instead
    assert!(merged.get_node(2).is_none());
    assert_eq!(merged.get_way(50).unwrap().refs, vec![1, 3]);

    // total node count dropped by exactly the deduplicated count
    let naive = apply_changeset(
        &base,
        &generate_changeset(&base, &patch, &ChangesetOptions::default()).unwrap(),
    )
    .unwrap();
    assert_eq!(
        merged.info().nodes,
        naive.info().nodes - changeset.stats.deduplicated_nodes
    );

    // no two remaining nodes share a location within the strict tolerance
    let tolerance = options.dedupe_match_tolerance_m;
    for i in 0..merged.nodes.len() {
        for j in (i + 1)..merged.nodes.len() {
            let d = spatial::distance_m(
                merged.nodes.lon(i),
                merged.nodes.lat(i),
                merged.nodes.lon(j),
                merged.nodes.lat(j),
            );
            assert!(d > tolerance, "nodes {i} and {j} are {d} m apart");
        }
    }
}

#[test]
fn intersection_pass_creates_junction_node() {
    let mut base = Osm::new();
    base.add_node(&node(1, 0.0, 0.0));
    base.add_node(&node(2, 10.0, 0.0));
    base.add_way(&Way {
        id: 100,
        refs: vec![1, 2],
        tags: vec![("highway".into(), "residential".into())],
    });
    let base = finalized(base);

    let mut patch = Osm::new();
    patch.add_node(&node(11, 5.0, -1.0));
    patch.add_node(&node(12, 5.0, 1.0));
    patch.add_way(&Way {
        id: 200,
        refs: vec![11, 12],
        tags: vec![("highway".into(), "residential".into())],
    });
    let patch = finalized(patch);

    let options = ChangesetOptions {
        create_intersections: true,
        ..Default::default()
    };
    let changeset = generate_changeset(&base, &patch, &options).unwrap();
    assert_eq!(changeset.stats.intersection_nodes_created, 1);

    let merged = apply_changeset(&base, &changeset).unwrap();

    let junction_id = 201;
    let junction = merged.get_node(junction_id).unwrap();
    assert_eq!((junction.lon, junction.lat), (5.0, 0.0));
    assert_eq!(merged.get_way(100).unwrap().refs, vec![1, junction_id, 2]);
    assert_eq!(merged.get_way(200).unwrap().refs, vec![11, junction_id, 12]);
}

#[test]
fn apply_is_stable_across_reruns_and_thread_counts() {
    use osmix::progress::Progress;
    use osmix::reader::{read_pbf, ReaderOptions};
    use osmix::writer::{write_pbf, WriterOptions};

    let mut base = Osm::new();
    for id in 1..40i64 {
        base.add_node(&node(id, id as f64 / 10.0, 0.0));
    }
    let base = finalized(base);

    let mut bytes = Vec::new();
    write_pbf(&base, &mut bytes, &WriterOptions::default(), &Progress::new()).unwrap();

    let sequential = read_pbf(&bytes[..], &ReaderOptions::default(), &Progress::new()).unwrap();
    let threaded = read_pbf(
        &bytes[..],
        &ReaderOptions {
            parse_concurrency: 3,
            ..Default::default()
        },
        &Progress::new(),
    )
    .unwrap();

    let mut patch = Osm::new();
    patch.add_node(&node(100, 5.0, 5.0));
    let patch = finalized(patch);

    let options = ChangesetOptions::default();
    let a = apply_changeset(
        &sequential,
        &generate_changeset(&sequential, &patch, &options).unwrap(),
    )
    .unwrap();
    let b = apply_changeset(
        &threaded,
        &generate_changeset(&threaded, &patch, &options).unwrap(),
    )
    .unwrap();

    assert_eq!(a.info(), b.info());
    let seq_a: Vec<(EntityType, i64)> = a.sorted_entities().map(|e| e.key()).collect();
    let seq_b: Vec<(EntityType, i64)> = b.sorted_entities().map(|e| e.key()).collect();
    assert_eq!(seq_a, seq_b);
}
