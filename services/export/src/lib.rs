//! Dataverse Export - sequence-aware annotation export
//!
//! Exports a dataslice from the curation backend to a local folder. Datarows
//! are grouped into sequences, their per-sensor annotation fragments are
//! folded into one document per sequence, and media is downloaded alongside.
//! Besides the native sequence format, single-frame COCO, YOLO and VLM
//! layouts are supported.
//!
//! # Example
//!
//! ```rust,no_run
//! use dataverse_export::{
//!     AnnotationSource, ExportConfig, ExportFormat, ExportJob, Exporter, HttpBackend,
//!     HttpFetcher, LocalSink,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ExportConfig::from_env()?;
//!     let exporter = Exporter::new(
//!         Arc::new(HttpBackend::new(&config.backend)?),
//!         Arc::new(HttpFetcher::new(config.request_timeout())?),
//!         Arc::new(LocalSink::new("/data/export")),
//!         config,
//!     );
//!
//!     let summary = exporter
//!         .run(&ExportJob {
//!             dataslice_id: 42,
//!             target_folder: "/data/export".to_string(),
//!             format: ExportFormat::VisionAi,
//!             source: AnnotationSource::GroundTruth,
//!             is_sequential: true,
//!         })
//!         .await?;
//!     println!("{} files written", summary.files_written);
//!     Ok(())
//! }
//! ```

pub mod annotation;
pub mod backend;
pub mod config;
pub mod converter;
pub mod error;
pub mod exporter;
pub mod fetch;
pub mod format;
pub mod interval;
pub mod model;
pub mod sequence;
pub mod sink;

#[cfg(test)]
mod testing;

pub use annotation::{AnnotationSource, Fragment, VisionAiDocument};
pub use backend::{BackendApi, BackendError, DatarowSupplier, HttpBackend};
pub use config::{
    BackendConfig, ConfigError, ConfigValidationError, ExportConfig, FetchFailurePolicy,
    LoggingConfig, PipelineConfig,
};
pub use converter::{BoxConverter, ClassMap, ConvertedRecord, FrameConverter};
pub use error::{ExportError, Result};
pub use exporter::{ExportJob, ExportSummary, Exporter, PreparedExport};
pub use fetch::{FetchError, HttpFetcher, MediaFetcher, RetryPolicy};
pub use format::{ExportFormat, FormatProducer};
pub use interval::{gen_intervals, merge_intervals, FrameInterval};
pub use sequence::{Sequence, SequenceMap};
pub use sink::{LocalSink, Sink, SinkError};
