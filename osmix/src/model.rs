//! OSM entity types

use geo::{coord, Coord, Rect};
use serde::{Deserialize, Serialize};

/// Coordinates are quantised to 1e-7 degrees so the PBF round trip is exact.
pub const COORD_SCALE: f64 = 1e7;

pub fn quantize(degrees: f64) -> i32 {
    (degrees * COORD_SCALE).round() as i32
}

pub fn dequantize(q: i32) -> f64 {
    q as f64 / COORD_SCALE
}

/// Ordered tag list. Order is preserved for storage but is not significant
/// for equality, see [`tags_equal`].
pub type Tags = Vec<(String, String)>;

pub fn tag_value<'a>(tags: &'a Tags, key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Order-insensitive tag equality. OSM keys are unique per entity, so a
/// length check plus one-sided containment is enough.
pub fn tags_equal(a: &Tags, b: &Tags) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(k, v)| b.iter().any(|(bk, bv)| bk == k && bv == v))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Node,
    Way,
    Relation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub lon: f64,
    pub lat: f64,
    pub tags: Tags,
}

impl Node {
    pub fn coord(&self) -> Coord {
        coord! { x: self.lon, y: self.lat }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Way {
    pub id: i64,
    pub refs: Vec<i64>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub mtype: EntityType,
    pub mref: i64,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: i64,
    pub members: Vec<Member>,
    pub tags: Tags,
}

/// The discriminated union over the three OSM primitives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

impl Entity {
    pub fn id(&self) -> i64 {
        match self {
            Entity::Node(n) => n.id,
            Entity::Way(w) => w.id,
            Entity::Relation(r) => r.id,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Entity::Node(_) => EntityType::Node,
            Entity::Way(_) => EntityType::Way,
            Entity::Relation(_) => EntityType::Relation,
        }
    }

    pub fn tags(&self) -> &Tags {
        match self {
            Entity::Node(n) => &n.tags,
            Entity::Way(w) => &w.tags,
            Entity::Relation(r) => &r.tags,
        }
    }

    pub fn key(&self) -> (EntityType, i64) {
        (self.entity_type(), self.id())
    }
}

/// Deep equality as used by change detection: ids, quantised coordinates,
/// refs/members in order, tags order-insensitive.
pub fn entities_equal(a: &Entity, b: &Entity) -> bool {
    match (a, b) {
        (Entity::Node(a), Entity::Node(b)) => {
            a.id == b.id
                && quantize(a.lon) == quantize(b.lon)
                && quantize(a.lat) == quantize(b.lat)
                && tags_equal(&a.tags, &b.tags)
        }
        (Entity::Way(a), Entity::Way(b)) => {
            a.id == b.id && a.refs == b.refs && tags_equal(&a.tags, &b.tags)
        }
        (Entity::Relation(a), Entity::Relation(b)) => {
            a.id == b.id && a.members == b.members && tags_equal(&a.tags, &b.tags)
        }
        _ => false,
    }
}

/// Builds a bbox from `[min_lon, min_lat, max_lon, max_lat]`.
pub fn bbox_rect(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Rect {
    Rect::new(
        coord! { x: min_lon, y: min_lat },
        coord! { x: max_lon, y: max_lat },
    )
}

/// Inclusive point-in-bbox check. `geo::Rect` edge semantics vary per
/// algorithm; extraction and tile queries require the closed interval.
pub fn rect_contains(rect: &Rect, lon: f64, lat: f64) -> bool {
    lon >= rect.min().x && lon <= rect.max().x && lat >= rect.min().y && lat <= rect.max().y
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tags_equal_is_order_insensitive() {
        let a: Tags = vec![("a".into(), "1".into()), ("b".into(), "2".into())];
        let b: Tags = vec![("b".into(), "2".into()), ("a".into(), "1".into())];
        let c: Tags = vec![("a".into(), "1".into())];
        assert!(tags_equal(&a, &b));
        assert!(!tags_equal(&a, &c));
    }

    #[test]
    fn test_quantize_round_trip() {
        for v in [0.0, 10.1234567, -179.9999999, 89.0000001] {
            assert_eq!(dequantize(quantize(v)), v);
        }
    }

    #[test]
    fn test_rect_contains_is_inclusive() {
        let rect = bbox_rect(0.0, 0.0, 1.0, 1.0);
        assert!(rect_contains(&rect, 0.0, 1.0));
        assert!(rect_contains(&rect, 1.0, 0.0));
        assert!(!rect_contains(&rect, 1.0000001, 0.5));
    }
}
