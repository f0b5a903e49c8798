//! Vector tile encoding.
//!
//! Features arrive in longitude/latitude, get projected into the tile's
//! integer grid (web mercator, origin at the north-west corner, y pointing
//! south) and are written as a single MVT layer. Geometries are clipped to
//! the same half-tile buffer the query selects with, so renderers can still
//! draw across tile edges while far-away vertices stay representable.

use std::f64::consts::PI;
use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use geo_types::{Coord, Geometry, LineString, Polygon};
use mvt::{GeomData, GeomEncoder, GeomType, Tile};

use crate::error::Error;
use crate::feature::{Feature, FeatureCollection};
use crate::row::Value;
use crate::tile::{TileCoord, TILE_BUFFER};

/// Tile grid size used by virtually every MVT consumer.
pub const DEFAULT_EXTENT: u32 = 4096;

const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Point,
    Line,
    Polygon,
}

/// Projected parts of one feature, ready for the geometry encoder.
struct Shape {
    kind: Kind,
    parts: Vec<Vec<(f64, f64)>>,
}

/// Projects and serializes feature collections for one tile.
#[derive(Clone, Copy, Debug)]
pub struct TileEncoder {
    tile: TileCoord,
    extent: u32,
}

impl TileEncoder {
    pub fn new(tile: TileCoord) -> Self {
        TileEncoder {
            tile,
            extent: DEFAULT_EXTENT,
        }
    }

    pub fn with_extent(mut self, extent: u32) -> Self {
        self.extent = extent;
        self
    }

    /// Serializes `collection` as a one-layer tile, gzipped if `compress` is set.
    pub fn encode(&self, collection: &FeatureCollection, compress: bool) -> Result<Vec<u8>, Error> {
        let mut tile = Tile::new(self.extent);
        let mut layer = tile.create_layer(&collection.name);

        for feature in &collection.features {
            let geom_data = match self.encode_geometry(&feature.geometry)? {
                Some(geom_data) => geom_data,
                None => {
                    log::debug!("skipping feature that collapses at {}", self.tile);
                    continue;
                }
            };

            let mut mvt_feature = layer.into_feature(geom_data);
            add_tags(&mut mvt_feature, feature);
            layer = mvt_feature.into_layer();
        }

        tile.add_layer(layer)?;
        let data = tile.to_bytes()?;

        if compress {
            gzip(&data)
        } else {
            Ok(data)
        }
    }

    /// Position of a longitude/latitude pair in tile units.
    pub fn project(&self, lon: f64, lat: f64) -> (f64, f64) {
        let n = f64::from(1u32 << self.tile.zoom);
        let extent = f64::from(self.extent);
        let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();

        let world_x = (lon + 180.0) / 360.0 * n;
        let world_y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * n;

        (
            (world_x - f64::from(self.tile.x)) * extent,
            (world_y - f64::from(self.tile.y)) * extent,
        )
    }

    fn encode_geometry(&self, geometry: &Geometry<f64>) -> Result<Option<GeomData>, Error> {
        let mut shape = match self.shape(geometry)? {
            Some(shape) => shape,
            None => return Ok(None),
        };
        shape.parts.retain(|part| !part.is_empty());
        if shape.parts.is_empty() {
            return Ok(None);
        }

        let geom_type = match shape.kind {
            Kind::Point => GeomType::Point,
            Kind::Line => GeomType::Linestring,
            Kind::Polygon => GeomType::Polygon,
        };

        let mut encoder = GeomEncoder::new(geom_type);
        for part in &shape.parts {
            for (x, y) in part {
                encoder = encoder.point(*x, *y)?;
            }
            if shape.kind != Kind::Point {
                encoder = encoder.complete()?;
            }
        }

        Ok(Some(encoder.encode()?))
    }

    fn shape(&self, geometry: &Geometry<f64>) -> Result<Option<Shape>, Error> {
        let shape = match geometry {
            Geometry::Point(point) => Shape {
                kind: Kind::Point,
                parts: vec![self.point(point.0).into_iter().collect()],
            },
            Geometry::MultiPoint(points) => {
                let kept = points.iter().filter_map(|point| self.point(point.0));
                Shape {
                    kind: Kind::Point,
                    parts: vec![kept.collect()],
                }
            }
            Geometry::Line(line) => Shape {
                kind: Kind::Line,
                parts: self.lines(&LineString::from(vec![line.start, line.end])),
            },
            Geometry::LineString(line) => Shape {
                kind: Kind::Line,
                parts: self.lines(line),
            },
            Geometry::MultiLineString(lines) => Shape {
                kind: Kind::Line,
                parts: lines.iter().flat_map(|line| self.lines(line)).collect(),
            },
            Geometry::Polygon(polygon) => Shape {
                kind: Kind::Polygon,
                parts: self.polygon(polygon),
            },
            Geometry::MultiPolygon(polygons) => Shape {
                kind: Kind::Polygon,
                parts: polygons
                    .iter()
                    .flat_map(|polygon| self.polygon(polygon))
                    .collect(),
            },
            Geometry::Rect(rect) => Shape {
                kind: Kind::Polygon,
                parts: self.polygon(&rect.to_polygon()),
            },
            Geometry::Triangle(triangle) => Shape {
                kind: Kind::Polygon,
                parts: self.polygon(&triangle.to_polygon()),
            },
            Geometry::GeometryCollection(collection) => {
                if collection.0.is_empty() {
                    return Ok(None);
                }
                return Err(Error::UnsupportedGeometry(String::from(
                    "heterogeneous collection",
                )));
            }
        };

        Ok(Some(shape))
    }

    /// Area kept around the tile, in tile units. It matches the buffer the
    /// query selects rows with.
    fn window(&self) -> Window {
        let extent = f64::from(self.extent);
        let buffer = extent * TILE_BUFFER;
        Window {
            min: -buffer,
            max: extent + buffer,
        }
    }

    fn projected(&self, line: &LineString<f64>) -> Vec<(f64, f64)> {
        line.coords()
            .map(|coord| self.project(coord.x, coord.y))
            .collect()
    }

    fn point(&self, coord: Coord<f64>) -> Option<(f64, f64)> {
        let point = self.project(coord.x, coord.y);
        self.window()
            .contains(point)
            .then(|| (point.0.round(), point.1.round()))
    }

    /// The pieces of a line inside the window. A line that leaves and
    /// re-enters the window becomes several parts.
    fn lines(&self, line: &LineString<f64>) -> Vec<Vec<(f64, f64)>> {
        self.window()
            .clip_path(&self.projected(line))
            .into_iter()
            .map(|run| quantize(&run))
            .filter(|path| path.len() >= 2)
            .collect()
    }

    /// Exterior ring first, followed by holes. Collapsed rings are dropped, and
    /// a collapsed exterior drops the whole polygon.
    fn polygon(&self, polygon: &Polygon<f64>) -> Vec<Vec<(f64, f64)>> {
        let exterior = match self.ring(polygon.exterior(), true) {
            Some(ring) => ring,
            None => return Vec::new(),
        };

        let mut rings = vec![exterior];
        rings.extend(
            polygon
                .interiors()
                .iter()
                .filter_map(|interior| self.ring(interior, false)),
        );
        rings
    }

    /// MVT wants exterior rings clockwise and holes counter-clockwise in tile
    /// space, without the closing vertex.
    fn ring(&self, ring: &LineString<f64>, exterior: bool) -> Option<Vec<(f64, f64)>> {
        let mut projected = self.projected(ring);
        if projected.len() > 1 && projected.first() == projected.last() {
            projected.pop();
        }

        let mut path = quantize(&self.window().clip_ring(&projected));
        if path.len() > 1 && path.first() == path.last() {
            path.pop();
        }
        if path.len() < 3 {
            return None;
        }

        let area = signed_area(&path);
        if area == 0.0 {
            return None;
        }
        // With y pointing down a positive area is clockwise.
        if (area > 0.0) != exterior {
            path.reverse();
        }

        Some(path)
    }
}

/// Square clip window in tile units.
#[derive(Clone, Copy, Debug)]
struct Window {
    min: f64,
    max: f64,
}

impl Window {
    fn contains(&self, (x, y): (f64, f64)) -> bool {
        x >= self.min && x <= self.max && y >= self.min && y <= self.max
    }

    /// Liang-Barsky: the part of segment `a`-`b` inside the window.
    fn clip_segment(&self, a: (f64, f64), b: (f64, f64)) -> Option<((f64, f64), (f64, f64))> {
        let (dx, dy) = (b.0 - a.0, b.1 - a.1);
        let mut enter = 0.0_f64;
        let mut leave = 1.0_f64;

        for (p, q) in [
            (-dx, a.0 - self.min),
            (dx, self.max - a.0),
            (-dy, a.1 - self.min),
            (dy, self.max - a.1),
        ] {
            if p == 0.0 {
                if q < 0.0 {
                    return None;
                }
            } else if p < 0.0 {
                enter = enter.max(q / p);
            } else {
                leave = leave.min(q / p);
            }
        }
        if enter > leave {
            return None;
        }

        // Unclipped ends stay bit-identical so consecutive segments join up.
        let at = |t: f64| {
            if t <= 0.0 {
                a
            } else if t >= 1.0 {
                b
            } else {
                (a.0 + t * dx, a.1 + t * dy)
            }
        };
        Some((at(enter), at(leave)))
    }

    /// Splits an open path into the runs that lie inside the window.
    fn clip_path(&self, path: &[(f64, f64)]) -> Vec<Vec<(f64, f64)>> {
        let mut runs = Vec::new();
        let mut run: Vec<(f64, f64)> = Vec::new();

        for segment in path.windows(2) {
            match self.clip_segment(segment[0], segment[1]) {
                Some((start, end)) => {
                    if run.last() != Some(&start) {
                        if !run.is_empty() {
                            runs.push(std::mem::take(&mut run));
                        }
                        run.push(start);
                    }
                    run.push(end);
                    if end != segment[1] {
                        runs.push(std::mem::take(&mut run));
                    }
                }
                None => {
                    if !run.is_empty() {
                        runs.push(std::mem::take(&mut run));
                    }
                }
            }
        }
        if !run.is_empty() {
            runs.push(run);
        }

        runs
    }

    /// Sutherland-Hodgman against each edge in turn. Parts of the ring outside
    /// the window are replaced by runs along its border.
    fn clip_ring(&self, ring: &[(f64, f64)]) -> Vec<(f64, f64)> {
        let (min, max) = (self.min, self.max);

        let ring = clip_against_edge(ring, |p| p.0 >= min, |a, b| {
            (min, a.1 + (min - a.0) / (b.0 - a.0) * (b.1 - a.1))
        });
        let ring = clip_against_edge(&ring, |p| p.0 <= max, |a, b| {
            (max, a.1 + (max - a.0) / (b.0 - a.0) * (b.1 - a.1))
        });
        let ring = clip_against_edge(&ring, |p| p.1 >= min, |a, b| {
            (a.0 + (min - a.1) / (b.1 - a.1) * (b.0 - a.0), min)
        });
        clip_against_edge(&ring, |p| p.1 <= max, |a, b| {
            (a.0 + (max - a.1) / (b.1 - a.1) * (b.0 - a.0), max)
        })
    }
}

fn clip_against_edge<F, I>(ring: &[(f64, f64)], inside: F, intersect: I) -> Vec<(f64, f64)>
where
    F: Fn((f64, f64)) -> bool,
    I: Fn((f64, f64), (f64, f64)) -> (f64, f64),
{
    let mut clipped = Vec::with_capacity(ring.len());

    for (i, &current) in ring.iter().enumerate() {
        let previous = ring[(i + ring.len() - 1) % ring.len()];
        match (inside(previous), inside(current)) {
            (true, true) => clipped.push(current),
            (true, false) => clipped.push(intersect(previous, current)),
            (false, true) => {
                clipped.push(intersect(previous, current));
                clipped.push(current);
            }
            (false, false) => {}
        }
    }

    clipped
}

/// Rounds to the tile grid and removes repeated vertices.
fn quantize(path: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let mut quantized: Vec<(f64, f64)> =
        path.iter().map(|(x, y)| (x.round(), y.round())).collect();
    quantized.dedup();
    quantized
}

fn signed_area(ring: &[(f64, f64)]) -> f64 {
    let mut area = 0.0;
    for (i, (x1, y1)) in ring.iter().enumerate() {
        let (x2, y2) = ring[(i + 1) % ring.len()];
        area += x1 * y2 - x2 * y1;
    }
    area / 2.0
}

fn add_tags(mvt_feature: &mut mvt::Feature, feature: &Feature) {
    for (key, value) in &feature.properties {
        match value {
            Value::Bool(value) => mvt_feature.add_tag_bool(key, *value),
            Value::Int(value) => mvt_feature.add_tag_sint(key, *value),
            Value::Float(value) => mvt_feature.add_tag_double(key, *value),
            Value::Text(value) | Value::Wkt(value) => mvt_feature.add_tag_string(key, value),
            // MVT has no null; absent tags read back as null.
            Value::Null => {}
        }
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(Error::Compression)?;
    encoder.finish().map_err(Error::Compression)
}
