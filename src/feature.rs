//! Conversion of query rows into geographic features.

use geo_types::Geometry;
use wkt::{ToWkt, TryFromWkt};

use crate::error::Error;
use crate::query::{
    CELL_COLUMN, CLUSTER_COUNT_COLUMN, GEOMETRY_TEXT_COLUMN, GEOMETRY_TYPE_COLUMN, POINT_TYPE,
    ROW_ORDINAL_COLUMN, SIMPLIFY_COLUMN,
};
use crate::row::{RawRow, Value};

/// Name of the only layer in every tile.
pub const DEFAULT_LAYER: &str = "default";

/// Bookkeeping columns that never become properties.
const INTERNAL_COLUMNS: [&str; 5] = [
    GEOMETRY_TYPE_COLUMN,
    GEOMETRY_TEXT_COLUMN,
    SIMPLIFY_COLUMN,
    CELL_COLUMN,
    ROW_ORDINAL_COLUMN,
];

/// A geometry in source coordinates with its properties.
#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    pub geometry: Geometry<f64>,
    pub properties: Vec<(String, Value)>,
}

impl Feature {
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

/// A named group of features, encoded as one tile layer.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureCollection {
    pub name: String,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        FeatureCollection {
            name: String::from(DEFAULT_LAYER),
            features,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Converts every row into a feature, preserving row order.
///
/// Fails on the first row whose geometry text is missing or not valid WKT.
pub fn convert_rows_to_features(rows: &[RawRow], geo_column: &str) -> Result<Vec<Feature>, Error> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| convert_row(index, row, geo_column))
        .collect()
}

fn convert_row(index: usize, row: &RawRow, geo_column: &str) -> Result<Feature, Error> {
    let text = match row.get(GEOMETRY_TEXT_COLUMN) {
        Some(Value::Wkt(text)) | Some(Value::Text(text)) => text,
        Some(Value::Null) | None => {
            return Err(Error::GeometryParse {
                row: index,
                message: String::from("geometry text is missing"),
            })
        }
        Some(other) => {
            return Err(Error::GeometryParse {
                row: index,
                message: format!("expected WKT text, found {:?}", other),
            })
        }
    };

    let geometry =
        Geometry::<f64>::try_from_wkt_str(text).map_err(|err| Error::GeometryParse {
            row: index,
            message: err.to_string(),
        })?;

    let is_point = matches!(
        row.get(GEOMETRY_TYPE_COLUMN).and_then(Value::as_str),
        Some(POINT_TYPE)
    );

    let properties = row
        .iter()
        .filter(|(name, _)| !is_excluded(name, geo_column, is_point))
        .map(|(name, value)| (name.to_owned(), value.clone()))
        .collect();

    Ok(Feature {
        geometry,
        properties,
    })
}

/// The cluster count only means something for points.
fn is_excluded(name: &str, geo_column: &str, is_point: bool) -> bool {
    name == geo_column
        || INTERNAL_COLUMNS.contains(&name)
        || (!is_point && name == CLUSTER_COUNT_COLUMN)
}

/// Logs each feature as WKT plus JSON properties at debug level.
pub fn log_features(collection: &FeatureCollection) {
    log::debug!(
        "layer {} holds {} features",
        collection.name,
        collection.len()
    );

    for feature in &collection.features {
        let properties: serde_json::Map<String, serde_json::Value> = feature
            .properties
            .iter()
            .map(|(key, value)| {
                (
                    key.clone(),
                    serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();

        log::debug!(
            "{} {}",
            feature.geometry.wkt_string(),
            serde_json::Value::Object(properties)
        );
    }
}
