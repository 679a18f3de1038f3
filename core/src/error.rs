//! Error types for the terrain navigation filters.
//!
//! Two families exist. [`TrnError`] is returned for conditions the caller must handle
//! before the filter can be used (bad configuration, initialization outside the map,
//! unreadable particle files). [`Rejection`] describes why a single measurement was not
//! incorporated; those are expected during normal operation and never leave the filter
//! in a partially updated state.

use thiserror::Error;

/// Fatal or caller-visible errors.
#[derive(Error, Debug)]
pub enum TrnError {
    #[error("initial position ({x:.2}, {y:.2}) is not inside the valid map region")]
    InitOutsideMap { x: f64, y: f64 },

    #[error("filter has not been initialized")]
    NotInitialized,

    #[error("pose time {current:.3} precedes last pose time {last:.3}")]
    NonMonotonicTime { last: f64, current: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("configuration file error: {0}")]
    ConfigFile(String),

    #[error("particle file error: {0}")]
    ParticleFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, TrnError>;

/// Reason a measurement update was discarded.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("filter has not been initialized")]
    NotInitialized,

    #[error("no sensor of this data type is mounted on the vehicle")]
    UnknownSensor,

    #[error("no beams projected validly")]
    NoValidBeams,

    #[error("submap request is out of the map bounds")]
    SubmapOutOfBounds,

    #[error("at least one hypothesis has no usable beam")]
    HypothesisWithoutBeams,

    #[error("no beam was usable under the active weighting mode")]
    NoUsableBeams,

    #[error("weights degenerated (zero sum or non-finite)")]
    DegenerateWeights,

    #[error("map returned no value for a beam and NaN regions are not allowed")]
    MapHole,

    #[error("innovation covariance could not be inverted")]
    SingularInnovation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        let err = TrnError::InitOutsideMap { x: 1.0, y: -2.5 };
        assert_eq!(
            err.to_string(),
            "initial position (1.00, -2.50) is not inside the valid map region"
        );
        let err = TrnError::NonMonotonicTime {
            last: 10.0,
            current: 9.5,
        };
        assert!(err.to_string().contains("9.500"));
        assert_eq!(
            Rejection::SubmapOutOfBounds.to_string(),
            "submap request is out of the map bounds"
        );
    }

    #[test]
    fn io_error_converts() {
        fn read() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"))?;
            Ok(())
        }
        assert!(matches!(read(), Err(TrnError::Io(_))));
    }
}
