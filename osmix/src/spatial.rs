//! Spatial index building blocks shared by the stores.

use geo::{Distance, Haversine, Point, Rect};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::AABB;

/// Node tree entry: (lon, lat) tagged with the dense store index.
pub type PointEntry = GeomWithData<[f64; 2], u32>;
/// Way/relation tree entry: bbox tagged with the dense store index.
pub type BboxEntry = GeomWithData<Rectangle<[f64; 2]>, u32>;

pub fn point_entry(lon: f64, lat: f64, index: u32) -> PointEntry {
    GeomWithData::new([lon, lat], index)
}

pub fn bbox_entry(rect: &Rect, index: u32) -> BboxEntry {
    GeomWithData::new(
        Rectangle::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
        index,
    )
}

pub fn envelope(rect: &Rect) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

/// Great-circle distance in meters.
pub fn distance_m(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    Haversine::distance(Point::new(lon1, lat1), Point::new(lon2, lat2))
}

const METERS_PER_DEGREE: f64 = 111_320.0;

/// Search envelope around a point for a metric radius. The longitude span
/// widens towards the poles; the cosine is clamped so the envelope stays
/// finite.
pub fn radius_envelope(lon: f64, lat: f64, radius_m: f64) -> AABB<[f64; 2]> {
    let dlat = radius_m / METERS_PER_DEGREE;
    let dlon = radius_m / (METERS_PER_DEGREE * lat.to_radians().cos().max(0.01));
    AABB::from_corners([lon - dlon, lat - dlat], [lon + dlon, lat + dlat])
}

#[cfg(test)]
mod test {
    use super::*;
    use rstar::Envelope;

    #[test]
    fn test_distance_along_equator() {
        // one degree of longitude at the equator is about 111.2 km
        let d = distance_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 500.0, "got {d}");
    }

    #[test]
    fn test_radius_envelope_contains_point() {
        let env = radius_envelope(10.0, 50.0, 25.0);
        assert!(env.contains_point(&[10.0, 50.0]));
        assert!(env.lower()[0] < 10.0 && env.upper()[0] > 10.0);
    }
}
