//! Tile rendering pipeline: bounding box, query, rows, features, tile.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::encode::TileEncoder;
use crate::error::{Error, ExecutionError, Stage};
use crate::executor::QueryExecutor;
use crate::feature::{convert_rows_to_features, FeatureCollection};
use crate::query::{build_query, QueryParams};
use crate::row::RawRow;
use crate::tile::TileRequest;
use crate::zoom::{cluster_resolution, simplification_tolerance};
use crate::TileSource;

/// Hook that sees every feature collection right before it is encoded.
pub type FeatureObserver = Arc<dyn Fn(&FeatureCollection) + Send + Sync>;

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Renders tiles from queries run through `E`.
///
/// The service holds no per-request state and can serve any number of
/// requests concurrently.
pub struct TileService<E> {
    executor: E,
    query_timeout: Duration,
    observer: Option<FeatureObserver>,
}

impl<E: QueryExecutor> TileService<E> {
    pub fn new(executor: E) -> Self {
        TileService {
            executor,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            observer: None,
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_observer(mut self, observer: FeatureObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Renders one tile. Cancelling `cancel` aborts a running query.
    pub async fn render(
        &self,
        request: &TileRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, Error> {
        let tile = request.tile;
        let params = QueryParams {
            bbox: request.bounding_box(),
            tolerance: simplification_tolerance(tile.zoom),
            cluster_resolution: cluster_resolution(tile.zoom),
        };
        log::debug!("tile {} covers {:?}", tile, params.bbox);

        let sql = build_query(request, &params).map_err(Error::at(Stage::BuildQuery))?;
        log::debug!("tile {} query: {}", tile, sql);

        let rows = self
            .fetch(&sql, cancel)
            .await
            .map_err(|err| Error::at(Stage::FetchRows)(err.into()))?;
        log::debug!("tile {} fetched {} rows", tile, rows.len());

        let features = convert_rows_to_features(&rows, &request.geo_column)
            .map_err(Error::at(Stage::ConvertFeatures))?;
        let collection = FeatureCollection::new(features);

        if let Some(observer) = &self.observer {
            observer(&collection);
        }

        let data = TileEncoder::new(tile)
            .encode(&collection, request.compress)
            .map_err(Error::at(Stage::EncodeTile))?;
        log::debug!("tile {} encoded into {} bytes", tile, data.len());

        Ok(data)
    }

    async fn fetch(
        &self,
        sql: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawRow>, ExecutionError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            result = tokio::time::timeout(self.query_timeout, self.executor.execute(sql)) => {
                result.unwrap_or(Err(ExecutionError::TimedOut(self.query_timeout)))
            }
        }
    }
}

#[async_trait]
impl<E: QueryExecutor> TileSource for TileService<E> {
    async fn render_mvt(&self, request: &TileRequest) -> Result<Vec<u8>, Error> {
        self.render(request, &CancellationToken::new()).await
    }

    async fn render_mvt_cancellable(
        &self,
        request: &TileRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, Error> {
        self.render(request, cancel).await
    }
}
