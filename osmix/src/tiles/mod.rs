//! Tile encoders consuming a finalized index: tile-local vector features
//! and a direct RGBA rasterizer.

mod clip;
pub mod raster;
pub mod vector;

pub use raster::{render_raster_tile, RasterTile};
pub use vector::{encode_vector_tile, FeatureKind, TileFeature, TileLayer, VectorTile};

/// Tile-local integer coordinate span.
pub const TILE_EXTENT: u32 = 4096;
/// Clip margin around the tile, in extent units.
pub const TILE_BUFFER: u32 = 64;
