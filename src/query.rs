//! SQL generation for a single tile.
//!
//! The caller's query is wrapped as a subquery, filtered to the buffered tile
//! extent and decorated with bookkeeping columns. Two shapes of query exist:
//! a plain one that passes simplified rows through, and a clustered one that
//! additionally bins points into H3 cells and keeps one point per cell.
//!
//! Rows come back with the caller's columns plus the internal columns named
//! by the constants below; the feature converter relies on those names.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Error;
use crate::tile::{BoundingBox, TileRequest};
use crate::zoom::is_clustering;

/// `ST_GeometryType` of the source geometry.
pub const GEOMETRY_TYPE_COLUMN: &str = "__internal_geometry_type__";
/// Simplified geometry as WKT.
pub const GEOMETRY_TEXT_COLUMN: &str = "__internal_geometry_text__";
/// Per-row simplification tolerance.
pub const SIMPLIFY_COLUMN: &str = "__internal_geometry_simplify__";
/// H3 cell a point was binned into (clustered queries only).
pub const CELL_COLUMN: &str = "__internal_h3_index__";
/// Position of the row in the caller's result (clustered queries only).
pub const ROW_ORDINAL_COLUMN: &str = "__internal_row_ordinal__";
/// Number of source points represented by a row.
pub const CLUSTER_COUNT_COLUMN: &str = "h3ClusterCount";

/// Value of [`GEOMETRY_TYPE_COLUMN`] for single points.
pub const POINT_TYPE: &str = "ST_Point";
/// Value of [`GEOMETRY_TYPE_COLUMN`] for heterogeneous collections.
pub const COLLECTION_TYPE: &str = "ST_GeometryCollection";

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is valid")
});

/// Numeric inputs to query generation, all derived from the tile coordinate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueryParams {
    pub bbox: BoundingBox,
    pub tolerance: f64,
    pub cluster_resolution: u8,
}

/// Builds the SQL for a tile, choosing the clustered variant whenever the
/// resolution is below the H3 maximum.
pub fn build_query(request: &TileRequest, params: &QueryParams) -> Result<String, Error> {
    let source = SourceQuery::new(request, params)?;

    let sql = if is_clustering(params.cluster_resolution) {
        clustered_query(&source, params.cluster_resolution)
    } else {
        simple_query(&source)
    };

    Ok(sql)
}

/// Double-quotes an identifier after checking it against a conservative allow-list.
pub fn quote_ident(name: &str) -> Result<String, Error> {
    if !IDENTIFIER.is_match(name) {
        return Err(Error::InvalidParameter {
            name: "geoCol",
            reason: format!("`{}` is not a plain column name", name),
        });
    }

    Ok(format!("\"{}\"", name))
}

/// SRIDs are plain positive integers.
pub fn parse_srid(srid: &str) -> Result<u32, Error> {
    srid.trim()
        .parse::<u32>()
        .ok()
        .filter(|srid| *srid > 0)
        .ok_or_else(|| Error::InvalidParameter {
            name: "srid",
            reason: format!("`{}` is not a numeric SRID", srid),
        })
}

/// Fragments shared by both query shapes.
struct SourceQuery<'a> {
    query: &'a str,
    geo_col: String,
    envelope: String,
    zoom: u8,
    simplify: bool,
}

impl<'a> SourceQuery<'a> {
    fn new(request: &'a TileRequest, params: &QueryParams) -> Result<SourceQuery<'a>, Error> {
        let srid = parse_srid(&request.srid)?;
        let geo_col = quote_ident(&request.geo_column)?;

        if request.query.trim().is_empty() {
            return Err(Error::InvalidParameter {
                name: "query",
                reason: String::from("the source query is empty"),
            });
        }

        let bbox = &params.bbox;
        let envelope = format!(
            "ST_MakeEnvelope({}, {}, {}, {}, {})",
            bbox.west, bbox.south, bbox.east, bbox.north, srid
        );

        Ok(SourceQuery {
            query: request.query.trim().trim_end_matches(';'),
            geo_col,
            envelope,
            zoom: request.tile.zoom,
            simplify: params.tolerance > 0.0,
        })
    }

    /// CTEs `geometry_type` and `setup`: filter, tag and simplify.
    fn setup_ctes(&self, with_ordinal: bool) -> String {
        let ordinal = if with_ordinal {
            format!(",\n        row_number() OVER () AS {}", ROW_ORDINAL_COLUMN)
        } else {
            String::new()
        };

        // At high zooms the tolerance rounds to zero and simplifying is a no-op.
        let shape_text = if self.simplify {
            format!(
                "ST_AsText(ST_SimplifyPreserveTopology(t.{geo}, t.{tol}))",
                geo = self.geo_col,
                tol = SIMPLIFY_COLUMN
            )
        } else {
            format!("ST_AsText(t.{})", self.geo_col)
        };

        format!(
            "WITH geometry_type AS (
    SELECT
        t.*,
        ST_GeometryType(t.{geo}) AS {kind},
        ROUND((0.7 / (2 ^ {zoom}))::numeric, 3)::float8 AS {tol}{ordinal}
    FROM ({query}) t
    WHERE ST_Intersects({envelope}, t.{geo})
), setup AS (
    SELECT
        t.*,
        CASE
            WHEN t.{kind} = '{collection}'
            THEN ST_AsText(ST_CollectionExtract(ST_SimplifyPreserveTopology(t.{geo}, t.{tol})))
            WHEN t.{kind} = '{point}'
            THEN ST_AsText(t.{geo})
            ELSE {shape_text}
        END AS {text}
    FROM geometry_type t
)",
            geo = self.geo_col,
            kind = GEOMETRY_TYPE_COLUMN,
            zoom = self.zoom,
            tol = SIMPLIFY_COLUMN,
            ordinal = ordinal,
            query = self.query,
            envelope = self.envelope,
            collection = COLLECTION_TYPE,
            point = POINT_TYPE,
            shape_text = shape_text,
            text = GEOMETRY_TEXT_COLUMN,
        )
    }
}

/// Every matching row, simplified, each standing for exactly one source row.
/// Rows whose geometry simplified away are dropped.
fn simple_query(source: &SourceQuery) -> String {
    format!(
        "{setup}
SELECT s.*, 1 AS \"{count}\"
FROM setup s
WHERE s.{text} IS NOT NULL",
        setup = source.setup_ctes(false),
        count = CLUSTER_COUNT_COLUMN,
        text = GEOMETRY_TEXT_COLUMN,
    )
}

/// Shapes pass through; points collapse to one row per H3 cell.
///
/// Within a cell the row that came first in the caller's result is kept. That
/// order is only stable when the caller's query has an `ORDER BY`.
fn clustered_query(source: &SourceQuery, resolution: u8) -> String {
    format!(
        "{setup}, shapes AS (
    SELECT NULL::h3index AS {cell}, s.*, 1::bigint AS \"{count}\"
    FROM setup s
    WHERE s.{kind} <> '{point}' AND s.{text} IS NOT NULL
), indexed AS (
    SELECT h3_lat_lng_to_cell(s.{geo}, {resolution}) AS {cell}, s.*
    FROM setup s
    WHERE s.{kind} = '{point}'
), counted AS (
    SELECT i.*, count(*) OVER (PARTITION BY i.{cell}) AS \"{count}\"
    FROM indexed i
), points AS (
    SELECT DISTINCT ON (c.{cell}) c.*
    FROM counted c
    ORDER BY c.{cell}, c.{ordinal}
)
SELECT * FROM shapes
UNION ALL
SELECT * FROM points",
        setup = source.setup_ctes(true),
        cell = CELL_COLUMN,
        count = CLUSTER_COUNT_COLUMN,
        kind = GEOMETRY_TYPE_COLUMN,
        point = POINT_TYPE,
        text = GEOMETRY_TEXT_COLUMN,
        geo = source.geo_col,
        resolution = resolution,
        ordinal = ROW_ORDINAL_COLUMN,
    )
}
