//! Export-level errors carrying the stage they happened in.

use crate::annotation::AggregationError;
use crate::backend::BackendError;
use crate::converter::ConvertError;
use crate::fetch::FetchError;
use crate::sink::SinkError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Unknown export format: {0}")]
    UnknownFormat(String),

    #[error("Failed to prepare export of dataslice {dataslice_id}: {source}")]
    Metadata {
        dataslice_id: i64,
        #[source]
        source: BackendError,
    },

    #[error("Failed to fetch datarows for batch {batch}: {source}")]
    Datarows {
        batch: usize,
        #[source]
        source: BackendError,
    },

    #[error("Media unavailable in batch {batch}: {source}")]
    MediaUnavailable {
        batch: usize,
        #[source]
        source: FetchError,
    },

    #[error("Failed to aggregate sequence {sequence}: {source}")]
    Aggregation {
        sequence: usize,
        #[source]
        source: AggregationError,
    },

    #[error("Failed to convert datarow {datarow_id}: {source}")]
    Convert {
        datarow_id: i64,
        #[source]
        source: ConvertError,
    },

    #[error("Failed to serialize {path}: {source}")]
    Serialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Export output channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, ExportError>;
