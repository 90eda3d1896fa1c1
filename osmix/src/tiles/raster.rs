//! Direct-to-RGBA rasterization of the index, for preview rendering.

use crate::model::{tag_value, Tags};
use crate::osm::Osm;
use crate::store::{RelationGeometry, StoreError};
use error_stack::Report;
use geo::{BoundingRect, Intersects, LineString, Polygon, Rect};

const NODE_COLOR: [u8; 3] = [0xd3, 0x4d, 0x2a];
const WAY_COLOR: [u8; 3] = [0x4a, 0x6a, 0x8a];
const AREA_COLOR: [u8; 3] = [0x9a, 0xb8, 0x7a];

#[derive(Debug, Clone)]
pub struct RasterTile {
    pub width: u32,
    pub height: u32,
    /// RGBA8, row-major from the top-left corner.
    pub pixels: Vec<u8>,
}

impl RasterTile {
    fn new(width: u32, height: u32) -> Self {
        RasterTile {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    fn blend(&mut self, x: i64, y: i64, color: [u8; 3], alpha: u8) {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let src_a = alpha as u32;
        for channel in 0..3 {
            let dst = self.pixels[offset + channel] as u32;
            self.pixels[offset + channel] =
                ((color[channel] as u32 * src_a + dst * (255 - src_a)) / 255) as u8;
        }
        let dst_a = self.pixels[offset + 3] as u32;
        self.pixels[offset + 3] = (src_a + dst_a * (255 - src_a) / 255) as u8;
    }

    fn draw_line(&mut self, a: (f64, f64), b: (f64, f64), color: [u8; 3]) {
        let (mut x0, mut y0) = (a.0.round() as i64, a.1.round() as i64);
        let (x1, y1) = (b.0.round() as i64, b.1.round() as i64);
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.blend(x0, y0, color, 0xff);
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    /// Even-odd scanline fill of one ring.
    fn fill_ring(&mut self, ring: &[(f64, f64)], color: [u8; 3], alpha: u8) {
        let min_y = ring.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
        let max_y = ring.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
        let y0 = min_y.floor().max(0.0) as i64;
        let y1 = (max_y.ceil() as i64).min(self.height as i64 - 1);

        for y in y0..=y1 {
            let scan = y as f64 + 0.5;
            let mut crossings = Vec::new();
            for i in 0..ring.len() {
                let (x_a, y_a) = ring[i];
                let (x_b, y_b) = ring[(i + 1) % ring.len()];
                if (y_a <= scan) == (y_b <= scan) {
                    continue;
                }
                crossings.push(x_a + (scan - y_a) / (y_b - y_a) * (x_b - x_a));
            }
            crossings.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            for span in crossings.chunks_exact(2) {
                let x_start = span[0].round().max(0.0) as i64;
                let x_end = (span[1].round() as i64).min(self.width as i64 - 1);
                for x in x_start..=x_end {
                    self.blend(x, y, color, alpha);
                }
            }
        }
    }
}

struct PixelProjector {
    bbox: Rect,
    width: f64,
    height: f64,
}

impl PixelProjector {
    fn project(&self, lon: f64, lat: f64) -> (f64, f64) {
        (
            (lon - self.bbox.min().x) / self.bbox.width() * self.width,
            (self.bbox.max().y - lat) / self.bbox.height() * self.height,
        )
    }

    /// Size of a geographic bbox in pixels.
    fn pixel_span(&self, rect: &Rect) -> (f64, f64) {
        (
            rect.width() / self.bbox.width() * self.width,
            rect.height() / self.bbox.height() * self.height,
        )
    }
}

fn entity_color(tags: &Tags, fallback: [u8; 3]) -> [u8; 3] {
    tag_value(tags, "color")
        .or_else(|| tag_value(tags, "colour"))
        .and_then(parse_color)
        .unwrap_or(fallback)
}

fn parse_color(value: &str) -> Option<[u8; 3]> {
    if let Some(hex) = value.strip_prefix('#') {
        let expand = |h: &str| u8::from_str_radix(h, 16).ok().map(|v| v * 17);
        return match hex.len() {
            3 => Some([
                expand(&hex[0..1])?,
                expand(&hex[1..2])?,
                expand(&hex[2..3])?,
            ]),
            6 => Some([
                u8::from_str_radix(&hex[0..2], 16).ok()?,
                u8::from_str_radix(&hex[2..4], 16).ok()?,
                u8::from_str_radix(&hex[4..6], 16).ok()?,
            ]),
            _ => None,
        };
    }
    match value {
        "black" => Some([0x00, 0x00, 0x00]),
        "white" => Some([0xff, 0xff, 0xff]),
        "red" => Some([0xd3, 0x2a, 0x2a]),
        "green" => Some([0x2a, 0x8a, 0x2a]),
        "blue" => Some([0x2a, 0x4d, 0xd3]),
        "yellow" => Some([0xd3, 0xc3, 0x2a]),
        "gray" | "grey" => Some([0x80, 0x80, 0x80]),
        _ => None,
    }
}

/// True when the geometry collapses below one pixel; such entities take
/// the single-pixel fast path with coverage-scaled alpha.
fn subpixel_alpha(span: (f64, f64)) -> Option<u8> {
    if span.0 <= 1.0 && span.1 <= 1.0 {
        let coverage = (span.0.max(0.05) * span.1.max(0.05)).clamp(0.02, 1.0);
        Some((coverage * 255.0) as u8)
    } else {
        None
    }
}

fn draw_polyline(tile: &mut RasterTile, points: &[(f64, f64)], color: [u8; 3]) {
    for pair in points.windows(2) {
        tile.draw_line(pair[0], pair[1], color);
    }
}

fn draw_line_geometry(
    tile: &mut RasterTile,
    projector: &PixelProjector,
    line: &LineString,
    color: [u8; 3],
) {
    let Some(bbox) = line.bounding_rect() else {
        return;
    };
    let points: Vec<(f64, f64)> = line.0.iter().map(|c| projector.project(c.x, c.y)).collect();
    if let Some(alpha) = subpixel_alpha(projector.pixel_span(&bbox)) {
        let (x, y) = points[0];
        tile.blend(x.round() as i64, y.round() as i64, color, alpha);
        return;
    }
    draw_polyline(tile, &points, color);
}

fn draw_polygon_geometry(
    tile: &mut RasterTile,
    projector: &PixelProjector,
    polygon: &Polygon,
    color: [u8; 3],
) {
    let Some(bbox) = polygon.bounding_rect() else {
        return;
    };
    let outer: Vec<(f64, f64)> = polygon
        .exterior()
        .0
        .iter()
        .map(|c| projector.project(c.x, c.y))
        .collect();
    if let Some(alpha) = subpixel_alpha(projector.pixel_span(&bbox)) {
        let (x, y) = outer[0];
        tile.blend(x.round() as i64, y.round() as i64, color, alpha);
        return;
    }
    tile.fill_ring(&outer, color, 0xb0);
    draw_polyline(tile, &outer, color);
}

/// Renders everything intersecting `bbox` into a fresh RGBA buffer.
pub fn render_raster_tile(
    osm: &Osm,
    bbox: &Rect,
    width: u32,
    height: u32,
) -> Result<RasterTile, Report<StoreError>> {
    osm.ensure_ready()?;

    let mut tile = RasterTile::new(width, height);
    let projector = PixelProjector {
        bbox: *bbox,
        width: width as f64,
        height: height as f64,
    };

    let relation_indexes = match osm.relations.has_spatial_index() {
        true => osm.relations.intersects(bbox),
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
        let color = entity_color(&osm.relations.get_tags(i, &osm.strings), AREA_COLOR);
        match geometry {
            RelationGeometry::Rings(polygons) => {
                for polygon in &polygons {
                    draw_polygon_geometry(&mut tile, &projector, polygon, color);
                }
            }
            RelationGeometry::Lines(lines) => {
                for line in &lines {
                    draw_line_geometry(&mut tile, &projector, line, color);
                }
            }
            RelationGeometry::Points(points) => {
                for point in points {
                    let (x, y) = projector.project(point.x, point.y);
                    tile.blend(x.round() as i64, y.round() as i64, color, 0xff);
                }
            }
        }
    }

    let way_indexes = match osm.ways.has_spatial_index() {
        true => osm.ways.intersects(bbox),
        false => (0..osm.ways.len() as u32).collect(),
    };
    for i in way_indexes {
        let i = i as usize;
        let line = osm.ways.coordinates(i, &osm.nodes);
        if line.0.len() < 2 {
            continue;
        }
        if !line
            .bounding_rect()
            .map(|b| b.intersects(bbox))
            .unwrap_or(false)
        {
            continue;
        }
        let tags = osm.ways.get_tags(i, &osm.strings);
        let refs = osm.ways.refs(i);
        if refs.len() >= 4 && refs.first() == refs.last() {
            let color = entity_color(&tags, AREA_COLOR);
            draw_polygon_geometry(&mut tile, &projector, &Polygon::new(line, Vec::new()), color);
        } else {
            let color = entity_color(&tags, WAY_COLOR);
            draw_line_geometry(&mut tile, &projector, &line, color);
        }
    }

    for i in osm.nodes.find_indexes_within_bbox(bbox) {
        let i = i as usize;
        let tags = osm.nodes.get_tags(i, &osm.strings);
        if tags.is_empty() {
            continue;
        }
        let color = entity_color(&tags, NODE_COLOR);
        let (x, y) = projector.project(osm.nodes.lon(i), osm.nodes.lat(i));
        tile.blend(x.round() as i64, y.round() as i64, color, 0xff);
    }

    Ok(tile)
}
