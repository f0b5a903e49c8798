//! Tile addressing and the geographic footprint of a tile request.

use std::fmt;

use crate::error::Error;
use crate::zoom::MAX_ZOOM;

/// SRID assumed when the caller does not supply one.
pub const DEFAULT_SRID: &str = "4326";

/// Buffer around each tile, in tiles, so shapes crossing an edge are still selected.
pub const TILE_BUFFER: f64 = 0.5;

/// Largest latitude representable in web mercator.
const MAX_MERCATOR_LATITUDE: f64 = 85.051_128_779_806_59;

/// A validated slippy map tile address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub zoom: u8,
}

impl TileCoord {
    /// Validates that `x` and `y` address a tile at `zoom`.
    pub fn new(x: u32, y: u32, zoom: u8) -> Result<TileCoord, Error> {
        if zoom > MAX_ZOOM {
            return Err(Error::InvalidTile(format!(
                "zoom {} is above the supported maximum of {}",
                zoom, MAX_ZOOM
            )));
        }

        let size = 1u64 << zoom;
        if u64::from(x) >= size || u64::from(y) >= size {
            return Err(Error::InvalidTile(format!(
                "tile {}/{} does not exist at zoom {}",
                x, y, zoom
            )));
        }

        Ok(TileCoord { x, y, zoom })
    }

    /// Bounding box of this tile, grown by `buffer` tiles on every side.
    ///
    /// Longitudes are extrapolated linearly past the antimeridian, latitudes are
    /// clamped to the web mercator limits.
    pub fn bounds(&self, buffer: f64) -> BoundingBox {
        let n = f64::from(1u32 << self.zoom);
        let lon = |x: f64| x / n * 360.0 - 180.0;
        let lat = |y: f64| {
            let y = y.clamp(0.0, n);
            (std::f64::consts::PI * (1.0 - 2.0 * y / n))
                .sinh()
                .atan()
                .to_degrees()
                .clamp(-MAX_MERCATOR_LATITUDE, MAX_MERCATOR_LATITUDE)
        };

        let x = f64::from(self.x);
        let y = f64::from(self.y);

        BoundingBox {
            west: lon(x - buffer),
            south: lat(y + 1.0 + buffer),
            east: lon(x + 1.0 + buffer),
            north: lat(y - buffer),
        }
    }

    /// Exact corners of the tile, without any buffer, as an independent check
    /// on [`TileCoord::bounds`].
    #[cfg(test)]
    pub(crate) fn corners(&self) -> BoundingBox {
        use slippy_map_tilenames::tile2lonlat;

        let (west, north) = tile2lonlat(self.x, self.y, self.zoom);
        let (east, south) = tile2lonlat(self.x + 1, self.y + 1, self.zoom);
        BoundingBox {
            west,
            south,
            east,
            north,
        }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

/// Longitude/latitude extent in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

/// Everything needed to render one tile.
#[derive(Clone, Debug, PartialEq)]
pub struct TileRequest {
    pub tile: TileCoord,
    /// SQL fragment selecting the source rows. Trusted input from the deployer.
    pub query: String,
    /// Name of the geometry column produced by `query`.
    pub geo_column: String,
    pub srid: String,
    pub compress: bool,
}

impl TileRequest {
    pub fn new(tile: TileCoord, query: impl Into<String>, geo_column: impl Into<String>) -> Self {
        TileRequest {
            tile,
            query: query.into(),
            geo_column: geo_column.into(),
            srid: String::from(DEFAULT_SRID),
            compress: true,
        }
    }

    pub fn with_srid(mut self, srid: impl Into<String>) -> Self {
        self.srid = srid.into();
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Search area for this request, including the half-tile buffer.
    pub fn bounding_box(&self) -> BoundingBox {
        self.tile.bounds(TILE_BUFFER)
    }
}
