use std::fmt;

/// Pipeline stage a tile failure happened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    BuildQuery,
    FetchRows,
    ConvertFeatures,
    EncodeTile,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::BuildQuery => "building the query",
            Stage::FetchRows => "fetching rows",
            Stage::ConvertFeatures => "converting rows to features",
            Stage::EncodeTile => "encoding the tile",
        };
        f.write_str(name)
    }
}

/// Failure of the query execution capability.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Query was cancelled.")]
    Cancelled,

    #[error("Query did not finish within {0:?}.")]
    TimedOut(std::time::Duration),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ExecutionError {
    /// PostgreSQL reports statements aborted by `statement_timeout` or a
    /// cancel request with SQLSTATE 57014.
    pub fn from_database(err: sqlx::Error) -> ExecutionError {
        let cancelled = err
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == "57014");

        if cancelled {
            ExecutionError::Cancelled
        } else {
            ExecutionError::Database(err)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid tile: {0}")]
    InvalidTile(String),

    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Row {row} does not hold valid WKT: {message}")]
    GeometryParse { row: usize, message: String },

    #[error("Could not encode the vector tile: {0}")]
    Encoding(#[from] mvt::Error),

    #[error("Cannot encode {0} geometries into a vector tile.")]
    UnsupportedGeometry(String),

    #[error("Could not gzip the vector tile: {0}")]
    Compression(#[source] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid YAML configuration: {0}")]
    ConfigYaml(#[from] serde_yaml::Error),

    #[error("Shared tile cache error: {0}")]
    SharedCache(#[from] redis::RedisError),

    #[error("Failed while {stage}: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn at(stage: Stage) -> impl FnOnce(Error) -> Error {
        move |source| Error::Stage {
            stage,
            source: Box::new(source),
        }
    }

    /// The stage a pipeline failure happened in, if known.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Innermost error, with stage annotations stripped.
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Cancellation is expected when clients go away and is not a hard failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.root(),
            Error::Execution(ExecutionError::Cancelled | ExecutionError::TimedOut(_))
        )
    }

    /// Whether the caller sent a request that can never succeed.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.root(),
            Error::InvalidTile(_) | Error::InvalidParameter { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_annotation() {
        let err = Error::at(Stage::FetchRows)(Error::Execution(ExecutionError::Cancelled));

        assert_eq!(Some(Stage::FetchRows), err.stage());
        assert!(err.is_cancellation());
        assert!(!err.is_client_error());
        assert_eq!(
            "Failed while fetching rows: Query was cancelled.",
            err.to_string()
        );
    }

    #[test]
    fn test_client_errors() {
        let err = Error::at(Stage::BuildQuery)(Error::InvalidParameter {
            name: "srid",
            reason: String::from("not numeric"),
        });
        assert!(err.is_client_error());
        assert!(!err.is_cancellation());

        let err = Error::GeometryParse {
            row: 0,
            message: String::from("bad"),
        };
        assert!(!err.is_client_error());
        assert_eq!(None, err.stage());
    }

    #[test]
    fn test_database_errors_are_not_cancellation() {
        let err = ExecutionError::from_database(sqlx::Error::RowNotFound);
        assert!(matches!(err, ExecutionError::Database(_)));
        assert!(!Error::from(err).is_cancellation());
    }
}
