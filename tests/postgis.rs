//! Runs generated queries against a real database. Needs PostGIS plus the
//! `h3` and `h3_postgis` extensions at `DATABASE_URL`:
//!
//! ```sh
//! DATABASE_URL=postgres://postgres@localhost/tiles cargo test -- --ignored
//! ```

use std::time::Duration;

use dynamic_tiler::query::{build_query, QueryParams, CLUSTER_COUNT_COLUMN, GEOMETRY_TYPE_COLUMN};
use dynamic_tiler::row::{RawRow, Value};
use dynamic_tiler::zoom::{cluster_resolution, simplification_tolerance};
use dynamic_tiler::{PgExecutor, QueryExecutor, TileCoord, TileRequest, TileService, TileSource};
use mvt_reader::feature::Value as TileValue;
use mvt_reader::Reader;
use sqlx::PgPool;

/// Three cafes a few metres apart and a park, in a stable order.
const CAFES_AND_PARK: &str = "SELECT id, name, ST_GeomFromText(wkt, 4326) AS geom
FROM (VALUES
    (1, 'a', 'POINT(13.40000 52.52000)'),
    (2, 'b', 'POINT(13.40001 52.52001)'),
    (3, 'c', 'POINT(13.40002 52.52000)'),
    (4, 'park', 'POLYGON((13.30 52.50, 13.35 52.50, 13.35 52.55, 13.30 52.55, 13.30 52.50))')
) AS v(id, name, wkt)
ORDER BY id";

async fn executor() -> PgExecutor {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL is set");
    PgExecutor::new(PgPool::connect(&url).await.unwrap())
}

fn berlin() -> TileRequest {
    TileRequest::new(TileCoord::new(17, 10, 5).unwrap(), CAFES_AND_PARK, "geom")
        .with_compression(false)
}

fn row_named<'a>(rows: &'a [RawRow], name: &str) -> &'a RawRow {
    rows.iter()
        .find(|row| row.get("name").and_then(Value::as_str) == Some(name))
        .unwrap_or_else(|| panic!("no row named {}", name))
}

#[tokio::test]
#[ignore = "needs PostGIS with the h3 extensions at DATABASE_URL"]
async fn points_in_one_cell_collapse_to_the_first_row() {
    let executor = executor().await;
    let request = berlin();
    let zoom = request.tile.zoom;
    let params = QueryParams {
        bbox: request.bounding_box(),
        tolerance: simplification_tolerance(zoom),
        cluster_resolution: cluster_resolution(zoom),
    };

    let sql = build_query(&request, &params).unwrap();
    let rows = executor.execute(&sql).await.unwrap();

    assert_eq!(2, rows.len());

    let cafe = row_named(&rows, "a");
    assert_eq!(Some(&Value::from("ST_Point")), cafe.get(GEOMETRY_TYPE_COLUMN));
    assert_eq!(Some(&Value::Int(3)), cafe.get(CLUSTER_COUNT_COLUMN));
    assert_eq!(Some(&Value::Int(1)), cafe.get("id"));

    let park = row_named(&rows, "park");
    assert_eq!(Some(&Value::Int(1)), park.get(CLUSTER_COUNT_COLUMN));
}

#[tokio::test]
#[ignore = "needs PostGIS with the h3 extensions at DATABASE_URL"]
async fn rendered_tile_holds_the_cluster_and_the_park() {
    let service = TileService::new(executor().await);

    let data = service.render_mvt(&berlin()).await.unwrap();

    let features = Reader::new(data).unwrap().get_features(0).unwrap();
    assert_eq!(2, features.len());

    let cafe = features
        .iter()
        .filter_map(|feature| feature.properties.as_ref())
        .find(|properties| {
            properties.get("name") == Some(&TileValue::String(String::from("a")))
        })
        .unwrap();
    assert_eq!(Some(&TileValue::SInt(3)), cafe.get(CLUSTER_COUNT_COLUMN));
}

#[tokio::test]
#[ignore = "needs PostGIS with the h3 extensions at DATABASE_URL"]
async fn high_zoom_keeps_every_point() {
    let service = TileService::new(executor().await);
    let tile = TileCoord::new(70414, 42985, 17).unwrap();
    let request = TileRequest::new(tile, CAFES_AND_PARK, "geom").with_compression(false);

    let data = service.render_mvt(&request).await.unwrap();

    let features = Reader::new(data).unwrap().get_features(0).unwrap();
    let counts: Vec<_> = features
        .iter()
        .filter_map(|feature| {
            feature
                .properties
                .as_ref()?
                .get(CLUSTER_COUNT_COLUMN)
                .cloned()
        })
        .collect();
    assert_eq!(vec![TileValue::SInt(1); 3], counts);
}

#[tokio::test]
#[ignore = "needs PostGIS with the h3 extensions at DATABASE_URL"]
async fn numeric_and_json_columns_become_properties() {
    let executor = executor().await;

    let rows = executor
        .execute("SELECT 12.5::numeric AS a, 7::numeric AS n, '{\"k\": 1}'::jsonb AS j")
        .await
        .unwrap();

    assert_eq!(Some(&Value::Float(12.5)), rows[0].get("a"));
    assert_eq!(Some(&Value::Int(7)), rows[0].get("n"));
    assert_eq!(Some(&Value::from("{\"k\":1}")), rows[0].get("j"));
}

#[tokio::test]
#[ignore = "needs PostGIS with the h3 extensions at DATABASE_URL"]
async fn abandoned_queries_are_cancelled_on_the_server() {
    let executor = executor().await;
    let sleep = "SELECT pg_sleep(30)";

    let abandoned =
        tokio::time::timeout(Duration::from_millis(300), executor.execute(sleep)).await;
    assert!(abandoned.is_err());

    let mut running = 1;
    for _ in 0..50 {
        running = sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM pg_stat_activity WHERE query = $1 AND state = 'active'",
        )
        .bind(sleep)
        .fetch_one(executor.pool())
        .await
        .unwrap();
        if running == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(0, running);
}
