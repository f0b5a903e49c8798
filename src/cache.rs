//! Tile caching.
//!
//! Every server keeps recent tiles in process. Optionally a [`TileStore`]
//! shared between servers sits behind that: it is consulted on a local miss
//! and filled in the background once a tile has been rendered.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::tile::TileRequest;

/// Content address of a request: everything that influences the tile bytes.
pub fn cache_key(request: &TileRequest) -> String {
    let tile = request.tile;
    let description = format!(
        "/mvt/{}/{}/{}?query={}&geoCol={}&srid={}&compress={}",
        tile.x,
        tile.y,
        tile.zoom,
        request.query,
        request.geo_column,
        request.srid,
        request.compress
    );

    hex::encode(Sha256::digest(description.as_bytes()))
}

/// Tile storage shared between server instances.
#[async_trait]
pub trait TileStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Bytes>, Error>;

    async fn store(&self, key: &str, data: Bytes) -> Result<(), Error>;
}

/// Tiles kept in Redis, expiring after `ttl`.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    ttl: Duration,
}

impl RedisStore {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(RedisStore { connection, ttl })
    }
}

#[async_trait]
impl TileStore for RedisStore {
    async fn load(&self, key: &str) -> Result<Option<Bytes>, Error> {
        let mut connection = self.connection.clone();
        let data: Option<Vec<u8>> = connection.get(key).await?;
        Ok(data.map(Bytes::from))
    }

    async fn store(&self, key: &str, data: Bytes) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        let () = connection.set_ex(key, data.to_vec(), self.ttl.as_secs()).await?;
        Ok(())
    }
}

/// Encoded tiles keyed by [`cache_key`], expiring after a fixed time.
#[derive(Clone)]
pub struct TileCache {
    tiles: Cache<String, Bytes>,
    shared: Option<Arc<dyn TileStore>>,
}

impl TileCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        TileCache {
            tiles: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            shared: None,
        }
    }

    pub fn with_shared_store(mut self, store: Arc<dyn TileStore>) -> Self {
        self.shared = Some(store);
        self
    }

    /// Returns the cached tile or stores the result of `compute`.
    ///
    /// Concurrent callers for the same key wait for a single computation.
    /// If the computing caller goes away, one of the waiters takes over.
    /// Errors are handed to every waiter and nothing is stored.
    ///
    /// A shared store is read before computing. Its failures count as a miss,
    /// and it is written from a detached task whose failure is only logged.
    pub async fn get_or_compute<F>(&self, key: String, compute: F) -> Result<Bytes, Arc<Error>>
    where
        F: Future<Output = Result<Bytes, Error>>,
    {
        let shared = self.shared.clone();
        let shared_key = key.clone();

        self.tiles
            .try_get_with(key, async move {
                let store = match shared {
                    Some(store) => store,
                    None => return compute.await,
                };

                match store.load(&shared_key).await {
                    Ok(Some(data)) => return Ok(data),
                    Ok(None) => {}
                    Err(err) => log::warn!("shared tile cache lookup failed: {}", err),
                }

                let data = compute.await?;
                let stored = data.clone();
                tokio::spawn(async move {
                    if let Err(err) = store.store(&shared_key, stored).await {
                        log::warn!("could not write tile to the shared cache: {}", err);
                    }
                });

                Ok(data)
            })
            .await
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.tiles.get(key).await
    }

    pub async fn invalidate_all(&self) {
        self.tiles.invalidate_all();
        self.tiles.run_pending_tasks().await;
    }
}
