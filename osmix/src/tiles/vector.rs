//! Tile-local vector features grouped into nodes / ways / relations
//! layers. Serializing the result into MVT protobuf is the renderer's
//! concern, not ours.

use crate::model::Tags;
use crate::osm::Osm;
use crate::store::{RelationGeometry, StoreError};
use crate::tiles::clip::{clip_line, clip_ring};
use crate::tiles::{TILE_BUFFER, TILE_EXTENT};
use error_stack::Report;
use geo::{BoundingRect, Intersects, LineString, Polygon, Rect, Scale};
use rustc_hash::FxHashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Point,
    Line,
    Polygon,
}

#[derive(Debug, Clone)]
pub struct TileFeature {
    pub id: i64,
    pub kind: FeatureKind,
    /// Rings or line parts in tile coordinates. For polygons the first
    /// ring is the exterior.
    pub geometry: Vec<Vec<(i32, i32)>>,
    pub tags: Tags,
}

#[derive(Debug, Clone)]
pub struct TileLayer {
    pub name: &'static str,
    pub features: Vec<TileFeature>,
}

#[derive(Debug, Clone)]
pub struct VectorTile {
    pub layers: Vec<TileLayer>,
}

struct TileProjector {
    bbox: Rect,
}

impl TileProjector {
    fn project(&self, lon: f64, lat: f64) -> (i32, i32) {
        let extent = TILE_EXTENT as f64;
        let x = (lon - self.bbox.min().x) / self.bbox.width() * extent;
        // tile space grows downward
        let y = (self.bbox.max().y - lat) / self.bbox.height() * extent;
        (x.round() as i32, y.round() as i32)
    }

    fn project_line(&self, line: &LineString) -> Vec<(i32, i32)> {
        let mut out: Vec<(i32, i32)> = Vec::with_capacity(line.0.len());
        for c in &line.0 {
            let p = self.project(c.x, c.y);
            // projection collapses sub-pixel detail; drop the duplicates
            if out.last() != Some(&p) {
                out.push(p);
            }
        }
        out
    }
}

/// Surveyor's formula in tile coordinates. MVT exterior rings carry
/// positive area, interior rings negative.
fn surveyor_area(ring: &[(i32, i32)]) -> i64 {
    let mut sum = 0i64;
    for i in 0..ring.len() {
        let (x1, y1) = ring[i];
        let (x2, y2) = ring[(i + 1) % ring.len()];
        sum += x1 as i64 * y2 as i64 - x2 as i64 * y1 as i64;
    }
    sum
}

fn wind(mut ring: Vec<(i32, i32)>, exterior: bool) -> Vec<(i32, i32)> {
    let area = surveyor_area(&ring);
    if (exterior && area < 0) || (!exterior && area > 0) {
        ring.reverse();
    }
    ring
}

fn polygon_feature(
    id: i64,
    polygon: &Polygon,
    clip: &Rect,
    projector: &TileProjector,
    tags: Tags,
) -> Option<TileFeature> {
    let outer = clip_ring(polygon.exterior(), clip)?;
    let mut geometry = vec![wind(projector.project_line(&outer), true)];
    if geometry[0].len() < 3 {
        return None;
    }
    for interior in polygon.interiors() {
        if let Some(ring) = clip_ring(interior, clip) {
            let projected = wind(projector.project_line(&ring), false);
            if projected.len() >= 3 {
                geometry.push(projected);
            }
        }
    }
    Some(TileFeature {
        id,
        kind: FeatureKind::Polygon,
        geometry,
        tags,
    })
}

fn line_feature(
    id: i64,
    line: &LineString,
    clip: &Rect,
    projector: &TileProjector,
    tags: Tags,
) -> Option<TileFeature> {
    let geometry: Vec<Vec<(i32, i32)>> = clip_line(line, clip)
        .iter()
        .map(|part| projector.project_line(part))
        .filter(|part| part.len() >= 2)
        .collect();
    if geometry.is_empty() {
        return None;
    }
    Some(TileFeature {
        id,
        kind: FeatureKind::Line,
        geometry,
        tags,
    })
}

/// Encodes everything the spatial indexes find in `bbox` into the three
/// standard layers. Ways already drawn as members of a rendered relation
/// are left out of the ways layer.
pub fn encode_vector_tile(osm: &Osm, bbox: &Rect) -> Result<VectorTile, Report<StoreError>> {
    osm.ensure_ready()?;

    let clip = bbox.scale(1.0 + 2.0 * TILE_BUFFER as f64 / TILE_EXTENT as f64);
    let projector = TileProjector { bbox: *bbox };

    let mut rendered_ways: FxHashSet<i64> = FxHashSet::default();
    let mut relation_features = Vec::new();

    let relation_indexes = match osm.relations.has_spatial_index() {
        true => osm.relations.intersects(&clip),
        false => (0..osm.relations.len() as u32).collect(),
    };
    for i in relation_indexes {
        let i = i as usize;
        let Some(geometry) = osm
            .relations
            .geometry(i, &osm.nodes, &osm.ways, &osm.strings)
        else {
            continue;
        };
        let id = osm.relations.id(i);
        let tags = osm.relations.get_tags(i, &osm.strings);
        let mut rendered = false;
        match geometry {
            RelationGeometry::Rings(polygons) => {
                for polygon in &polygons {
                    if let Some(feature) =
                        polygon_feature(id, polygon, &clip, &projector, tags.clone())
                    {
                        relation_features.push(feature);
                        rendered = true;
                    }
                }
            }
            RelationGeometry::Lines(lines) => {
                for line in &lines {
                    if let Some(feature) = line_feature(id, line, &clip, &projector, tags.clone())
                    {
                        relation_features.push(feature);
                        rendered = true;
                    }
                }
            }
            RelationGeometry::Points(points) => {
                for point in points {
                    if !crate::model::rect_contains(&clip, point.x, point.y) {
                        continue;
                    }
                    relation_features.push(TileFeature {
                        id,
                        kind: FeatureKind::Point,
                        geometry: vec![vec![projector.project(point.x, point.y)]],
                        tags: tags.clone(),
                    });
                    rendered = true;
                }
            }
        }
        if rendered {
            for (mtype, mref, _) in osm.relations.raw_members(i) {
                if mtype == 1 {
                    rendered_ways.insert(mref);
                }
            }
        }
    }

    let mut way_features = Vec::new();
    let way_indexes = match osm.ways.has_spatial_index() {
        true => osm.ways.intersects(&clip),
        false => (0..osm.ways.len() as u32).collect(),
    };
    for i in way_indexes {
        let i = i as usize;
        if rendered_ways.contains(&osm.ways.id(i)) {
            continue;
        }
        let line = osm.ways.coordinates(i, &osm.nodes);
        if line.0.len() < 2 {
            continue;
        }
        if !line
            .bounding_rect()
            .map(|b| b.intersects(&clip))
            .unwrap_or(false)
        {
            continue;
        }
        let id = osm.ways.id(i);
        let tags = osm.ways.get_tags(i, &osm.strings);
        let refs = osm.ways.refs(i);
        let closed = refs.len() >= 4 && refs.first() == refs.last();
        let feature = if closed {
            polygon_feature(
                id,
                &Polygon::new(line, Vec::new()),
                &clip,
                &projector,
                tags,
            )
        } else {
            line_feature(id, &line, &clip, &projector, tags)
        };
        if let Some(feature) = feature {
            way_features.push(feature);
        }
    }

    let mut node_features = Vec::new();
    for i in osm.nodes.find_indexes_within_bbox(&clip) {
        let i = i as usize;
        let tags = osm.nodes.get_tags(i, &osm.strings);
        // untagged nodes are geometry carriers, not features
        if tags.is_empty() {
            continue;
        }
        node_features.push(TileFeature {
            id: osm.nodes.id(i),
            kind: FeatureKind::Point,
            geometry: vec![vec![projector.project(osm.nodes.lon(i), osm.nodes.lat(i))]],
            tags,
        });
    }

    Ok(VectorTile {
        layers: vec![
            TileLayer {
                name: "nodes",
                features: node_features,
            },
            TileLayer {
                name: "ways",
                features: way_features,
            },
            TileLayer {
                name: "relations",
                features: relation_features,
            },
        ],
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{bbox_rect, EntityType, Member, Node, Relation, Way};

    fn tile_fixture() -> Osm {
        let mut osm = Osm::new();
        for (id, lon, lat, tags) in [
            (1, 0.25, 0.25, vec![("amenity", "cafe")]),
            (2, 0.75, 0.25, vec![]),
            (3, 0.75, 0.75, vec![]),
            (4, 0.25, 0.75, vec![]),
        ] {
            osm.add_node(&Node {
                id,
                lon,
                lat,
                tags: tags
                    .into_iter()
                    .map(|(k, v): (&str, &str)| (k.to_owned(), v.to_owned()))
                    .collect(),
            });
        }
        osm.add_way(&Way {
            id: 10,
            refs: vec![2, 3],
            tags: vec![("highway".into(), "service".into())],
        });
        // closed square, counter-clockwise in lon/lat
        osm.add_way(&Way {
            id: 11,
            refs: vec![1, 2, 3, 4, 1],
            tags: vec![("building".into(), "yes".into())],
        });
        osm.build_indexes().unwrap();
        osm.build_spatial_indexes().unwrap();
        osm
    }

    fn layer<'a>(tile: &'a VectorTile, name: &str) -> &'a TileLayer {
        tile.layers.iter().find(|l| l.name == name).unwrap()
    }

    #[test]
    fn test_layers_and_projection() {
        let osm = tile_fixture();
        let tile = encode_vector_tile(&osm, &bbox_rect(0.0, 0.0, 1.0, 1.0)).unwrap();

        let nodes = layer(&tile, "nodes");
        assert_eq!(nodes.features.len(), 1, "only the tagged node is emitted");
        let (x, y) = nodes.features[0].geometry[0][0];
        assert_eq!((x, y), (1024, 3072));

        let ways = layer(&tile, "ways");
        assert_eq!(ways.features.len(), 2);
    }

    #[test]
    fn test_polygon_winding_is_positive_area() {
        let osm = tile_fixture();
        let tile = encode_vector_tile(&osm, &bbox_rect(0.0, 0.0, 1.0, 1.0)).unwrap();
        let ways = layer(&tile, "ways");
        let polygon = ways
            .features
            .iter()
            .find(|f| f.kind == FeatureKind::Polygon)
            .unwrap();
        assert!(surveyor_area(&polygon.geometry[0]) > 0);
    }

    #[test]
    fn test_relation_members_not_double_drawn() {
        let mut osm = tile_fixture();
        osm.add_relation(&Relation {
            id: 20,
            members: vec![Member {
                mtype: EntityType::Way,
                mref: 11,
                role: "outer".into(),
            }],
            tags: vec![("type".into(), "multipolygon".into())],
        });
        osm.build_indexes().unwrap();
        osm.build_spatial_indexes().unwrap();

        let tile = encode_vector_tile(&osm, &bbox_rect(0.0, 0.0, 1.0, 1.0)).unwrap();
        assert_eq!(layer(&tile, "relations").features.len(), 1);
        let ways = layer(&tile, "ways");
        assert!(ways.features.iter().all(|f| f.id != 11));
    }

    #[test]
    fn test_empty_tile() {
        let osm = tile_fixture();
        let tile = encode_vector_tile(&osm, &bbox_rect(50.0, 50.0, 51.0, 51.0)).unwrap();
        assert!(tile.layers.iter().all(|l| l.features.is_empty()));
    }
}
