//! Zoom-dependent tuning: how hard to simplify shapes and how coarsely to
//! cluster points at a given zoom level.

/// Highest H3 resolution. At this resolution points are never merged.
pub const MAX_CLUSTER_RESOLUTION: u8 = 15;

/// Zoom level at and above which point clustering is switched off.
pub const CLUSTERING_MAX_ZOOM: u8 = 15;

/// Highest zoom level the mapping functions are defined for.
pub const MAX_ZOOM: u8 = 24;

/// Simplification tolerance in source units, `round(0.7 / 2^zoom, 3)`.
///
/// The same expression is evaluated by the database for the per-row tolerance
/// column, so the two must stay in lockstep.
pub fn simplification_tolerance(zoom: u8) -> f64 {
    let raw = 0.7 / 2f64.powi(zoom.into());
    (raw * 1000.0).round() / 1000.0
}

/// H3 resolution used to bin points at this zoom level.
pub fn cluster_resolution(zoom: u8) -> u8 {
    if zoom >= CLUSTERING_MAX_ZOOM {
        return MAX_CLUSTER_RESOLUTION;
    }

    let resolution = ((1.8 / 3.0) * f64::from(zoom) + 2.0).floor();
    resolution.min(f64::from(MAX_CLUSTER_RESOLUTION)) as u8
}

/// Whether points get merged into spatial cells at this resolution.
pub fn is_clustering(resolution: u8) -> bool {
    resolution < MAX_CLUSTER_RESOLUTION
}
