//! Ride discomfort pipeline: sensor-window aggregation, hazard point storage,
//! severity-band queries and geofence proximity alerts.

use thiserror::Error;

pub mod bands;
pub mod config;
pub mod filter;
pub mod geo;
pub mod geofence;
pub mod math;
pub mod sample;
pub mod store;
pub mod watch;
pub mod window;

pub use bands::{points_in_band, BandTable, SeverityBand};
pub use config::PipelineConfig;
pub use filter::{CompareOp, Comparison, Field, RangeFilter};
pub use geo::{bearing, haversine_distance, LatLng};
pub use geofence::{
    evaluate, AlertBatch, AlertConfig, AlertEvent, AlertState, AlertZone, ZoneKey, ZoneStatus,
};
pub use math::{normalize, reduce, root_mean_square, ReduceMode};
pub use sample::{IngestBatch, Reading, Sample, SampleKind, WireEntry};
pub use store::{HazardStore, JsonlStore, MemoryStore, PointIter};
pub use watch::{spawn_watch, AlertGate, AlertSink, PositionError, PositionUpdate, WatchHandle};
pub use window::{
    aggregate_history, AxisVibration, EmptyWindowPolicy, HazardPoint, PendingCounts,
    SessionAggregator, Window, WindowConfig,
};

#[derive(Error, Debug)]
pub enum RmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("out-of-order sample in session '{session}': time {got} precedes {previous}")]
    OutOfOrderSample {
        session: String,
        previous: i64,
        got: i64,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("alert delivery failed: {0}")]
    AlertDelivery(String),
}

impl RmError {
    pub fn invalid(message: impl Into<String>) -> Self {
        RmError::InvalidInput(message.into())
    }

    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        RmError::StorageUnavailable(message.to_string())
    }

    /// Stable machine-readable name used in HTTP error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RmError::InvalidInput(_) => "InvalidInput",
            RmError::StorageUnavailable(_) => "StorageUnavailable",
            RmError::OutOfOrderSample { .. } => "OutOfOrderSample",
            RmError::Config(_) => "Config",
            RmError::AlertDelivery(_) => "AlertDelivery",
        }
    }
}
