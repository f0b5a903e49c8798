use std::io::Read;
use std::sync::Mutex;

use async_trait::async_trait;
use dynamic_tiler::query::{
    CELL_COLUMN, CLUSTER_COUNT_COLUMN, GEOMETRY_TEXT_COLUMN, GEOMETRY_TYPE_COLUMN,
    ROW_ORDINAL_COLUMN, SIMPLIFY_COLUMN,
};
use dynamic_tiler::row::{RawRow, Value};
use dynamic_tiler::{ExecutionError, QueryExecutor, TileCoord, TileRequest, TileService, TileSource};
use flate2::read::GzDecoder;
use mvt_reader::Reader;

/// Hands out canned rows and remembers the SQL it was asked to run.
struct CannedRows {
    rows: Vec<RawRow>,
    queries: Mutex<Vec<String>>,
}

impl CannedRows {
    fn new(rows: Vec<RawRow>) -> Self {
        CannedRows {
            rows,
            queries: Mutex::new(Vec::new()),
        }
    }

    fn last_query(&self) -> String {
        self.queries.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl QueryExecutor for CannedRows {
    async fn execute(&self, sql: &str) -> Result<Vec<RawRow>, ExecutionError> {
        self.queries.lock().unwrap().push(sql.to_owned());
        Ok(self.rows.clone())
    }
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

fn clustered_point(name: &str, wkt: &str, count: i64) -> RawRow {
    RawRow::new()
        .with(CELL_COLUMN, Value::Null)
        .with("name", name)
        .with("geom", Value::Null)
        .with(GEOMETRY_TYPE_COLUMN, "ST_Point")
        .with(SIMPLIFY_COLUMN, 0.022)
        .with(ROW_ORDINAL_COLUMN, 1i64)
        .with(GEOMETRY_TEXT_COLUMN, Value::Wkt(wkt.to_owned()))
        .with(CLUSTER_COUNT_COLUMN, count)
}

fn shape(name: &str, wkt: &str) -> RawRow {
    RawRow::new()
        .with(CELL_COLUMN, Value::Null)
        .with("name", name)
        .with("geom", Value::Null)
        .with(GEOMETRY_TYPE_COLUMN, "ST_Polygon")
        .with(SIMPLIFY_COLUMN, 0.022)
        .with(ROW_ORDINAL_COLUMN, 2i64)
        .with(GEOMETRY_TEXT_COLUMN, Value::Wkt(wkt.to_owned()))
        .with(CLUSTER_COUNT_COLUMN, 1i64)
}

#[tokio::test]
async fn empty_source_yields_empty_default_layer() {
    let service = TileService::new(CannedRows::new(Vec::new()));
    let tile = TileCoord::new(0, 0, 0).unwrap();
    let request = TileRequest::new(tile, "SELECT geom FROM t", "geom")
        .with_srid("4326")
        .with_compression(false);

    let data = service.render_mvt(&request).await.unwrap();

    let reader = Reader::new(data).unwrap();
    assert_eq!(vec![String::from("default")], reader.get_layer_names().unwrap());
    assert!(reader.get_features(0).unwrap().is_empty());

    let sql = service.executor().last_query();
    assert!(sql.contains("FROM (SELECT geom FROM t) t"));
    assert!(sql.contains("h3_lat_lng_to_cell(s.\"geom\", 2)"));
}

#[tokio::test]
async fn points_sharing_a_cell_become_one_feature() {
    // What the clustered query returns for three points in one resolution-5 cell.
    let rows = vec![clustered_point("first", "POINT(13.40 52.52)", 3)];
    let service = TileService::new(CannedRows::new(rows));
    let tile = TileCoord::new(17, 10, 5).unwrap();
    let request = TileRequest::new(tile, "SELECT name, geom FROM cafes", "geom")
        .with_compression(false);

    let data = service.render_mvt(&request).await.unwrap();

    let sql = service.executor().last_query();
    assert!(sql.contains("h3_lat_lng_to_cell(s.\"geom\", 5)"));
    assert!(sql.contains("count(*) OVER (PARTITION BY i.__internal_h3_index__)"));

    let reader = Reader::new(data).unwrap();
    let features = reader.get_features(0).unwrap();
    assert_eq!(1, features.len());

    let properties = features[0].properties.as_ref().unwrap();
    assert_eq!(
        Some(&mvt_reader::feature::Value::SInt(3)),
        properties.get(CLUSTER_COUNT_COLUMN)
    );
    assert_eq!(
        Some(&mvt_reader::feature::Value::String(String::from("first"))),
        properties.get("name")
    );
    assert_eq!(2, properties.len());
}

#[tokio::test]
async fn shapes_carry_no_cluster_count() {
    let rows = vec![
        shape("park", "POLYGON((13 52,14 52,14 53,13 53,13 52))"),
        clustered_point("cafe", "POINT(13.40 52.52)", 2),
    ];
    let service = TileService::new(CannedRows::new(rows));
    let tile = TileCoord::new(17, 10, 5).unwrap();
    let request = TileRequest::new(tile, "SELECT * FROM poi", "geom").with_compression(false);

    let data = service.render_mvt(&request).await.unwrap();
    let features = Reader::new(data).unwrap().get_features(0).unwrap();
    assert_eq!(2, features.len());

    let park = features[0].properties.as_ref().unwrap();
    assert_eq!(None, park.get(CLUSTER_COUNT_COLUMN));
    assert_eq!(1, park.len());

    let cafe = features[1].properties.as_ref().unwrap();
    assert_eq!(
        Some(&mvt_reader::feature::Value::SInt(2)),
        cafe.get(CLUSTER_COUNT_COLUMN)
    );
}

#[tokio::test]
async fn compression_only_wraps_the_tile() {
    let rows = vec![
        shape("park", "POLYGON((13 52,14 52,14 53,13 53,13 52))"),
        clustered_point("cafe", "POINT(13.40 52.52)", 1),
    ];
    let service = TileService::new(CannedRows::new(rows));
    let tile = TileCoord::new(17, 10, 5).unwrap();
    let request = TileRequest::new(tile, "SELECT * FROM poi", "geom");

    let compressed = service
        .render_mvt(&request.clone().with_compression(true))
        .await
        .unwrap();
    let plain = service
        .render_mvt(&request.with_compression(false))
        .await
        .unwrap();

    assert_ne!(plain, compressed);
    assert_eq!(plain, gunzip(&compressed));

    let queries = service.executor().queries.lock().unwrap();
    assert_eq!(queries[0], queries[1]);
}

#[tokio::test]
async fn high_zoom_passes_points_through() {
    let rows = vec![clustered_point("cafe", "POINT(13.40 52.52)", 1)];
    let service = TileService::new(CannedRows::new(rows));
    let tile = TileCoord::new(70416, 42985, 17).unwrap();
    let request = TileRequest::new(tile, "SELECT name, geom FROM cafes", "geom")
        .with_compression(false);

    service.render_mvt(&request).await.unwrap();

    let sql = service.executor().last_query();
    assert!(!sql.contains("h3_lat_lng_to_cell"));
    assert!(sql.contains("1 AS \"h3ClusterCount\""));
}
