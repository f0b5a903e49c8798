//! # Dynamic Tiler
//!
//! Mapbox Vector Tiles rendered on demand from arbitrary PostGIS queries.
//!
//! ## How a tile is made
//!
//! A [`TileRequest`] names a tile, a SQL fragment selecting source rows and
//! the geometry column within it. The tile's buffered extent, a zoom-dependent
//! simplification tolerance and an H3 clustering resolution are derived from
//! the tile coordinate. They feed a generated query that filters, simplifies
//! and (at low zooms) bins points into H3 cells, keeping one representative
//! point per cell along with the number of points it stands for. The rows that
//! come back are turned into features and encoded into a single layer named
//! `default`, optionally gzipped.
//!
//! ## Requirements
//!
//! The database needs PostGIS, and the `h3` and `h3_postgis` extensions for
//! point clustering (zoom levels below 15). Source geometries are expected in
//! longitude/latitude; other SRIDs are accepted for filtering but the tile
//! projection always assumes degrees.
//!
//! ## Trust model
//!
//! The SQL fragment is trusted input from whoever deploys the server and is
//! not parsed or validated. The SRID and the geometry column name are checked
//! against strict allow-lists before they reach the generated SQL.

#![deny(warnings)]

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// This is the main trait exported by this crate. The HTTP layer and the
/// cache only talk to tile producers through it.
#[async_trait]
pub trait TileSource: Send + Sync {
    /// Renders the Mapbox vector tile for a request.
    async fn render_mvt(&self, request: &TileRequest) -> Result<Vec<u8>, Error>;

    /// Like [`TileSource::render_mvt`], but gives up once `cancel` fires.
    ///
    /// Sources that hold server-side work should override this and stop that
    /// work too.
    async fn render_mvt_cancellable(
        &self,
        request: &TileRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, Error> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Execution(ExecutionError::Cancelled)),
            result = self.render_mvt(request) => result,
        }
    }
}

pub mod cache;
pub mod config;
pub mod encode;
pub mod error;
pub mod executor;
pub mod feature;
pub mod query;
pub mod row;
pub mod server;
pub mod service;
pub mod tile;
pub mod zoom;

pub use config::Config;
pub use error::{Error, ExecutionError, Stage};
pub use executor::{PgExecutor, QueryExecutor};
pub use service::TileService;
pub use tile::{TileCoord, TileRequest};
