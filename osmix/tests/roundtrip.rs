//! PBF encode/decode round trips over in-memory buffers.

use osmix::model::{Entity, EntityType, Member, Node, Relation, Way};
use osmix::progress::Progress;
use osmix::reader::{read_pbf, ReaderOptions};
use osmix::writer::{write_pbf, WriterOptions};
use osmix::Osm;

fn node(id: i64, lon: f64, lat: f64) -> Node {
    Node {
        id,
        lon,
        lat,
        tags: Vec::new(),
    }
}

/// 4 nodes, 2 ways, 1 relation, with header metadata.
fn fixture() -> Osm {
    let mut osm = Osm::new();
    osm.header.writing_program = Some("osmix-fixture".to_owned());
    osm.header.bbox = Some([0.0, 0.0, 2.0, 1.0]);
    osm.header.replication_timestamp = Some(1_700_000_000);

    osm.add_node(&Node {
        id: 1,
        lon: 0.0,
        lat: 0.0,
        tags: vec![("name".into(), "first".into())],
    });
    osm.add_node(&node(2, 2.0, 0.0));
    osm.add_node(&node(3, 0.5, 0.5));
    osm.add_node(&node(4, 1.5, 0.5));
    osm.add_way(&Way {
        id: 10,
        refs: vec![1, 2],
        tags: vec![("highway".into(), "residential".into())],
    });
    osm.add_way(&Way {
        id: 11,
        refs: vec![3, 4],
        tags: Vec::new(),
    });
    osm.add_relation(&Relation {
        id: 20,
        members: vec![Member {
            mtype: EntityType::Way,
            mref: 10,
            role: "main".into(),
        }],
        tags: vec![("type".into(), "route".into())],
    });
    osm.build_indexes().unwrap();
    osm
}

fn encode(osm: &Osm, options: &WriterOptions) -> Vec<u8> {
    let mut buffer = Vec::new();
    write_pbf(osm, &mut buffer, options, &Progress::new()).unwrap();
    buffer
}

fn decode(bytes: &[u8], options: &ReaderOptions) -> Osm {
    read_pbf(bytes, options, &Progress::new()).unwrap()
}

#[test]
fn round_trip_preserves_entities_and_header() {
    let original = fixture();
    let bytes = encode(&original, &WriterOptions::default());
    let decoded = decode(&bytes, &ReaderOptions::default());

    let info = decoded.info();
    assert_eq!(info.nodes, 4);
    assert_eq!(info.ways, 2);
    assert_eq!(info.relations, 1);
    assert_eq!(decoded.get_way(10).unwrap().refs, vec![1, 2]);
    assert_eq!(
        decoded.header.writing_program.as_deref(),
        Some("osmix-fixture")
    );
    assert_eq!(decoded.header.replication_timestamp, Some(1_700_000_000));
    let bbox = decoded.header.bbox.unwrap();
    assert!((bbox[2] - 2.0).abs() < 1e-9);

    let original_entities: Vec<Entity> = original.sorted_entities().collect();
    let decoded_entities: Vec<Entity> = decoded.sorted_entities().collect();
    assert_eq!(original_entities, decoded_entities);

    // the second generation must be byte-for-byte stable
    let second = encode(&decoded, &WriterOptions::default());
    assert_eq!(bytes, second);
    let redecoded = decode(&second, &ReaderOptions::default());
    let redecoded_entities: Vec<Entity> = redecoded.sorted_entities().collect();
    assert_eq!(decoded_entities, redecoded_entities);
}

#[test]
fn export_is_sorted_by_id() {
    let mut osm = Osm::new();
    for id in [44i64, 2, 17, 9, 31] {
        osm.add_node(&node(id, id as f64 / 100.0, 0.0));
    }
    osm.build_indexes().unwrap();

    let bytes = encode(&osm, &WriterOptions::default());
    let decoded = decode(&bytes, &ReaderOptions::default());

    let ids: Vec<i64> = decoded
        .sorted_entities()
        .map(|entity| entity.id())
        .collect();
    assert_eq!(ids, vec![2, 9, 17, 31, 44]);
    for pair in ids.windows(2) {
        assert!(pair[0] < pair[1]);
    }
}

#[test]
fn parallel_decode_matches_sequential() {
    let original = fixture();
    let bytes = encode(&original, &WriterOptions::default());

    let sequential = decode(&bytes, &ReaderOptions::default());
    let parallel = decode(
        &bytes,
        &ReaderOptions {
            parse_concurrency: 4,
            ..Default::default()
        },
    );

    assert_eq!(sequential.info(), parallel.info());
    let a: Vec<Entity> = sequential.sorted_entities().collect();
    let b: Vec<Entity> = parallel.sorted_entities().collect();
    assert_eq!(a, b);
}

#[test]
fn tiny_blocks_and_raw_blobs_round_trip() {
    let original = fixture();
    let options = WriterOptions {
        compression: None,
        entities_per_block: 1,
    };
    let bytes = encode(&original, &options);
    let decoded = decode(&bytes, &ReaderOptions::default());

    assert_eq!(decoded.info(), original.info());
    let a: Vec<Entity> = original.sorted_entities().collect();
    let b: Vec<Entity> = decoded.sorted_entities().collect();
    assert_eq!(a, b);
}

#[test]
fn streaming_bbox_extract_filters_during_decode() {
    let original = fixture();
    let bytes = encode(&original, &WriterOptions::default());

    let extract = decode(
        &bytes,
        &ReaderOptions {
            extract_bbox: Some(osmix::model::bbox_rect(-0.1, -0.1, 1.0, 1.0)),
            ..Default::default()
        },
    );

    assert!(extract.get_node(1).is_some());
    assert!(extract.get_node(3).is_some());
    assert!(extract.get_node(2).is_none());
    assert_eq!(extract.get_way(10).unwrap().refs, vec![1]);
    assert_eq!(extract.get_way(11).unwrap().refs, vec![3]);
    let relation = extract.get_relation(20).unwrap();
    assert_eq!(relation.members.len(), 1);
}

#[test]
fn abort_flag_stops_the_decode() {
    let original = fixture();
    let bytes = encode(&original, &WriterOptions::default());

    let progress = Progress::new();
    progress.cancel();
    let result = read_pbf(&bytes[..], &ReaderOptions::default(), &progress);
    assert!(result.is_err());
}
