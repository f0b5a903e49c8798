//! HTTP front end: `GET /mvt/{x}/{y}/{z}?query=..&geoCol=..&srid=..`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{request::Parts, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::cache::{cache_key, TileCache, TileStore};
use crate::config::Config;
use crate::error::Error;
use crate::tile::{TileCoord, TileRequest, DEFAULT_SRID};
use crate::TileSource;

const MVT_CONTENT_TYPE: &str = "application/x-protobuf";

/// Shared state of the tile route.
#[derive(Clone)]
pub struct AppState {
    source: Arc<dyn TileSource>,
    cache: TileCache,
    compress: bool,
    cache_control: HeaderValue,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(source: Arc<dyn TileSource>, config: &Config) -> Result<Self, Error> {
        let cache_control = HeaderValue::from_str(&config.cache_control)
            .map_err(|err| Error::Config(format!("invalid cache control header: {}", err)))?;

        Ok(AppState {
            source,
            cache: TileCache::new(config.cache_capacity, config.cache_ttl()),
            compress: !config.disable_gzip,
            cache_control,
            shutdown: CancellationToken::new(),
        })
    }

    /// Backs the in-process cache with a store shared between servers.
    pub fn with_shared_store(mut self, store: Arc<dyn TileStore>) -> Self {
        self.cache = self.cache.with_shared_store(store);
        self
    }

    /// Cancelling this token aborts every tile still being rendered.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TileParams {
    query: Option<String>,
    #[serde(rename = "geoCol")]
    geo_col: Option<String>,
    srid: Option<String>,
}

/// Router with the tile and health routes, wrapped in `cors`.
pub fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/mvt/{x}/{y}/{z}", get(serve_tile))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
        .layer(cors)
}

/// Binds to the configured port and serves until ctrl-c. Queries still
/// running at that point are cancelled.
pub async fn serve(config: &Config, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown_token();
    let cors = build_cors_layer(&config.allowed_origins);
    let app = router(state, cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("dynamic tiling server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                log::error!("could not listen for shutdown signal: {}", err);
            }
            shutdown.cancel();
        })
        .await
}

/// Accepts origins matching any pattern: `*` matches everything, a leading or
/// trailing `*` matches by suffix or prefix, anything else must match exactly.
pub fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let patterns = allowed_origins.to_vec();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _request: &Parts| {
                let origin = origin.to_str().unwrap_or("");
                patterns.iter().any(|pattern| origin_matches(pattern, origin))
            },
        ))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([
            header::ACCEPT,
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-csrf-token"),
        ])
        .expose_headers([header::LINK])
        .max_age(Duration::from_secs(300))
}

fn origin_matches(pattern: &str, origin: &str) -> bool {
    if pattern == "*" {
        true
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        origin.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        origin.ends_with(suffix)
    } else {
        origin == pattern
    }
}

async fn serve_tile(
    Path((x, y, z)): Path<(String, String, String)>,
    Query(params): Query<TileParams>,
    State(state): State<AppState>,
) -> Response {
    let request = match parse_request(&x, &y, &z, params, state.compress) {
        Ok(request) => request,
        Err(err) => {
            log::debug!("rejecting tile request {}/{}/{}: {}", z, x, y, err);
            return error_response(StatusCode::BAD_REQUEST);
        }
    };

    // Fires when the client goes away and this handler is dropped.
    let cancel = state.shutdown.child_token();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let source = Arc::clone(&state.source);
    let result = state
        .cache
        .get_or_compute(cache_key(&request), async {
            source
                .render_mvt_cancellable(&request, &cancel)
                .await
                .map(Bytes::from)
        })
        .await;

    match result {
        Ok(data) => tile_response(data, &state),
        Err(err) => {
            if err.is_cancellation() {
                log::debug!("tile {} was cancelled: {}", request.tile, err);
            } else {
                log::error!("failed to get tile {}: {}", request.tile, err);
            }

            if err.is_client_error() {
                error_response(StatusCode::BAD_REQUEST)
            } else {
                error_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

fn parse_request(
    x: &str,
    y: &str,
    z: &str,
    params: TileParams,
    compress: bool,
) -> Result<TileRequest, Error> {
    let number = |name: &str, value: &str| {
        value
            .parse::<u32>()
            .map_err(|_| Error::InvalidTile(format!("{} `{}` is not a tile index", name, value)))
    };

    let zoom = u8::try_from(number("z", z)?)
        .map_err(|_| Error::InvalidTile(format!("zoom `{}` is out of range", z)))?;
    let tile = TileCoord::new(number("x", x)?, number("y", y)?, zoom)?;

    let query = params
        .query
        .filter(|query| !query.trim().is_empty())
        .ok_or(Error::InvalidParameter {
            name: "query",
            reason: String::from("missing"),
        })?;
    let geo_col = params.geo_col.ok_or(Error::InvalidParameter {
        name: "geoCol",
        reason: String::from("missing"),
    })?;

    Ok(TileRequest::new(tile, query, geo_col)
        .with_srid(params.srid.unwrap_or_else(|| String::from(DEFAULT_SRID)))
        .with_compression(compress))
}

fn tile_response(data: Bytes, state: &AppState) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(MVT_CONTENT_TYPE));
    headers.insert(header::CACHE_CONTROL, state.cache_control.clone());
    if state.compress {
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }

    (StatusCode::OK, headers, Body::from(data)).into_response()
}

fn error_response(status: StatusCode) -> Response {
    let reason = status.canonical_reason().unwrap_or("Error");
    (status, reason).into_response()
}
