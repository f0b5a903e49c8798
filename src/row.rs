//! Dynamically typed result rows.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::query::GEOMETRY_TEXT_COLUMN;

/// A single column value of a result row.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Well-known text produced by the tile query.
    Wkt(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) | Value::Wkt(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// One result row: column names and values, in result column order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawRow {
    columns: Vec<(String, Value)>,
}

impl RawRow {
    pub fn new() -> Self {
        RawRow::default()
    }

    /// Appends a column. Later duplicates of a name shadow earlier ones on lookup.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.columns.push((name.into(), value.into()));
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .rev()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Decodes a PostgreSQL row column by column.
    ///
    /// Types without a natural property representation, such as raw
    /// geometries or H3 cells, decode to [`Value::Null`].
    pub fn from_pg_row(row: &PgRow) -> Result<RawRow, sqlx::Error> {
        let mut raw = RawRow::new();

        for (index, column) in row.columns().iter().enumerate() {
            let value = if row.try_get_raw(index)?.is_null() {
                Value::Null
            } else {
                decode_column(row, index, column.type_info().name())?
            };

            let value = match value {
                Value::Text(text) if column.name() == GEOMETRY_TEXT_COLUMN => Value::Wkt(text),
                other => other,
            };

            raw.push(column.name(), value);
        }

        Ok(raw)
    }
}

impl FromIterator<(String, Value)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        RawRow {
            columns: iter.into_iter().collect(),
        }
    }
}

fn decode_column(row: &PgRow, index: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    let value = match type_name {
        "BOOL" => Value::Bool(row.try_get(index)?),
        "INT2" => Value::Int(row.try_get::<i16, _>(index)?.into()),
        "INT4" => Value::Int(row.try_get::<i32, _>(index)?.into()),
        "INT8" => Value::Int(row.try_get(index)?),
        "FLOAT4" => Value::Float(row.try_get::<f32, _>(index)?.into()),
        "FLOAT8" => Value::Float(row.try_get(index)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" => Value::Text(row.try_get(index)?),
        "NUMERIC" => match row.try_get::<Decimal, _>(index) {
            Ok(number) => numeric_value(number),
            // NaN, infinities and numbers beyond 96 bits
            Err(err) => {
                log::debug!(
                    "column {} holds a numeric outside the decimal range: {}",
                    index,
                    err
                );
                Value::Null
            }
        },
        "JSON" | "JSONB" => {
            Value::Text(row.try_get::<serde_json::Value, _>(index)?.to_string())
        }
        "UUID" => Value::Text(row.try_get::<uuid::Uuid, _>(index)?.to_string()),
        "DATE" => Value::Text(row.try_get::<chrono::NaiveDate, _>(index)?.to_string()),
        "TIMESTAMP" => Value::Text(
            row.try_get::<chrono::NaiveDateTime, _>(index)?
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        ),
        "TIMESTAMPTZ" => Value::Text(
            row.try_get::<chrono::DateTime<chrono::Utc>, _>(index)?
                .to_rfc3339(),
        ),
        other => {
            log::debug!("column {} has unsupported type {}, using null", index, other);
            Value::Null
        }
    };

    Ok(value)
}

/// Integral numerics become integers and those a double holds exactly become
/// floats. Anything else keeps its decimal text so no digits are lost.
fn numeric_value(number: Decimal) -> Value {
    let number = number.normalize();
    if number.scale() == 0 {
        if let Some(int) = number.to_i64() {
            return Value::Int(int);
        }
    }

    match number.to_f64() {
        Some(float) if Decimal::from_f64(float) == Some(number) => Value::Float(float),
        _ => Value::Text(number.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_values() {
        assert_eq!(Value::Int(42), numeric_value(Decimal::new(4200, 2)));
        assert_eq!(Value::Int(-7), numeric_value(Decimal::new(-7, 0)));
        assert_eq!(Value::Float(4.5), numeric_value(Decimal::new(45, 1)));
        assert_eq!(Value::Float(-0.25), numeric_value(Decimal::new(-25, 2)));

        let precise: Decimal = "1234567890.123456789012345678".parse().unwrap();
        assert_eq!(
            Value::Text(String::from("1234567890.123456789012345678")),
            numeric_value(precise)
        );
    }

    #[test]
    fn test_row_lookup_keeps_order() {
        let row = RawRow::new()
            .with("id", 7i64)
            .with("name", "harbour")
            .with("open", true)
            .with("depth", Some(3.5))
            .with("note", None::<String>);

        let names: Vec<&str> = row.iter().map(|(name, _)| name).collect();
        assert_eq!(vec!["id", "name", "open", "depth", "note"], names);
        assert_eq!(Some(&Value::Int(7)), row.get("id"));
        assert_eq!(Some("harbour"), row.get("name").and_then(Value::as_str));
        assert!(row.get("note").unwrap().is_null());
        assert_eq!(None, row.get("missing"));
        assert_eq!(5, row.len());
    }

    #[test]
    fn test_values_serialize_as_plain_json() {
        let values = vec![
            Value::Null,
            Value::Bool(false),
            Value::Int(3),
            Value::Float(1.5),
            Value::Text(String::from("a")),
            Value::Wkt(String::from("POINT(1 2)")),
        ];
        assert_eq!(
            r#"[null,false,3,1.5,"a","POINT(1 2)"]"#,
            serde_json::to_string(&values).unwrap()
        );
    }
}
