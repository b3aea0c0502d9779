use chrono::NaiveDateTime;
use std::{
    error::Error,
    fmt::{Display, Formatter},
};

/// Result type used throughout the crate.
pub type ReshuffleResult<T> = Result<T, ReshuffleError>;

/// Everything that can go wrong while turning images into time series.
#[derive(Debug)]
pub enum ReshuffleError {
    /// A source file could not be found, opened, or read, or an output file could not be written.
    Io(std::io::Error),
    /// Error reported by SQLite while working with a cell archive or the grid file.
    Database(rusqlite::Error),
    /// A requested variable or an expected structural field does not exist in a source file.
    FieldLookup { field: String, context: String },
    /// A source file holds more than one overpass and none was selected.
    AmbiguousOverpass(Vec<String>),
    /// An image whose arrays don't fit its locations or the grid it is read on.
    MalformedImage { date: NaiveDateTime, reason: String },
    /// Images in one run mixed image level timestamps with per observation timestamps.
    LayoutInconsistency { date: NaiveDateTime },
    /// The image grid does not match the output grid and there is no target grid to resample to.
    MissingTargetGrid,
    /// Invalid configuration.
    Config(String),
    /// A cell archive stayed locked by another writer after all retries.
    WriteContention { cell: i32, attempts: u32 },
    /// An orthogonal append used a different set or ordering of locations than the archive has.
    LocationMismatch { cell: i32 },
    /// A worker thread panicked or hung up early.
    Worker(String),
}

impl ReshuffleError {
    /// Can this failure be treated as a missing date when errors are ignored?
    ///
    /// Configuration and layout problems describe the whole run, not a single date, so they are
    /// always fatal.
    pub fn is_skippable(&self) -> bool {
        use ReshuffleError::*;

        matches!(
            self,
            Io(_) | FieldLookup { .. } | AmbiguousOverpass(_) | MalformedImage { .. }
        )
    }

    pub(crate) fn field_lookup(field: impl Into<String>, context: impl Into<String>) -> Self {
        ReshuffleError::FieldLookup {
            field: field.into(),
            context: context.into(),
        }
    }
}

impl Display for ReshuffleError {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        use ReshuffleError::*;

        match self {
            Io(err) => write!(f, "I/O error: {}", err),
            Database(err) => write!(f, "database error: {}", err),
            FieldLookup { field, context } => {
                write!(f, "field {} does not exist in {}", field, context)
            }
            AmbiguousOverpass(found) => write!(
                f,
                "multiple overpasses found in file, please specify one to load: {}",
                found.join(", ")
            ),
            MalformedImage { date, reason } => write!(f, "malformed image at {}: {}", date, reason),
            LayoutInconsistency { date } => write!(
                f,
                "image at {} switches between a fixed image timestamp and individual \
                 timestamps for each observation",
                date
            ),
            MissingTargetGrid => write!(f, "target grid is required for spatial resampling"),
            Config(msg) => write!(f, "invalid configuration: {}", msg),
            WriteContention { cell, attempts } => write!(
                f,
                "could not write to file for cell {} after {} attempts",
                cell, attempts
            ),
            LocationMismatch { cell } => write!(
                f,
                "locations for cell {} do not match the locations already in the archive",
                cell
            ),
            Worker(msg) => write!(f, "worker failure: {}", msg),
        }
    }
}

impl Error for ReshuffleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReshuffleError::Io(err) => Some(err),
            ReshuffleError::Database(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReshuffleError {
    fn from(err: std::io::Error) -> Self {
        ReshuffleError::Io(err)
    }
}

impl From<rusqlite::Error> for ReshuffleError {
    fn from(err: rusqlite::Error) -> Self {
        ReshuffleError::Database(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_skippable_errors() {
        let io = ReshuffleError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(io.is_skippable());
        assert!(ReshuffleError::field_lookup("soil_moisture", "file.h5").is_skippable());
        assert!(ReshuffleError::AmbiguousOverpass(vec!["AM".into(), "PM".into()]).is_skippable());

        let date = chrono::NaiveDate::from_ymd(2020, 1, 1).and_hms(0, 0, 0);
        assert!(!ReshuffleError::LayoutInconsistency { date }.is_skippable());
        assert!(!ReshuffleError::MissingTargetGrid.is_skippable());
        assert!(!ReshuffleError::Config("bad".into()).is_skippable());
        assert!(ReshuffleError::MalformedImage {
            date,
            reason: "3 locations".into()
        }
        .is_skippable());
    }

    #[test]
    fn test_display_names_context() {
        let err = ReshuffleError::WriteContention {
            cell: 1289,
            attempts: 3,
        };
        assert!(err.to_string().contains("1289"));

        let err = ReshuffleError::field_lookup("Soil_Moisture_Retrieval_Data_PM", "a.h5");
        let msg = err.to_string();
        assert!(msg.contains("Soil_Moisture_Retrieval_Data_PM"));
        assert!(msg.contains("a.h5"));
    }
}
