//! Export orchestration.
//!
//! [`Exporter::run`] prepares the export from backend metadata, then drives
//! the selected format's producer and a file-writing consumer concurrently
//! over a bounded channel:
//!
//! ```text
//! prepare -> FormatProducer --(bytes, path)--> consumer -> Sink
//! ```

use crate::annotation::AnnotationSource;
use crate::backend::{BackendApi, BackendError, DatarowSupplier, FlatParentQuery};
use crate::config::ExportConfig;
use crate::converter::{BoxConverter, FrameConverter};
use crate::error::{ExportError, Result};
use crate::fetch::{BatchDownloader, MediaFetcher, RetryPolicy};
use crate::format::{ExportFormat, ItemSender, ProducerContext};
use crate::sequence::{build_sequence_map, SequenceMap};
use crate::sink::{ExportItem, Sink};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument};

/// What to export and how
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub dataslice_id: i64,
    /// Export root on the local machine
    pub target_folder: String,
    pub format: ExportFormat,
    pub source: AnnotationSource,
    /// Keep frames of one sequence together instead of exporting each frame
    /// on its own
    pub is_sequential: bool,
}

/// Metadata resolved before any media is touched
#[derive(Debug, Clone)]
pub struct PreparedExport {
    pub class_names: Vec<String>,
    pub sequence_map: SequenceMap,
    /// Empty unless the format needs question text
    pub question_map: BTreeMap<i64, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub files_written: u64,
    pub media_dropped: u64,
}

pub struct Exporter {
    backend: Arc<dyn BackendApi>,
    fetcher: Arc<dyn MediaFetcher>,
    sink: Arc<dyn Sink>,
    converter: Arc<dyn FrameConverter>,
    config: ExportConfig,
    retry_policy: Option<RetryPolicy>,
}

impl Exporter {
    pub fn new(
        backend: Arc<dyn BackendApi>,
        fetcher: Arc<dyn MediaFetcher>,
        sink: Arc<dyn Sink>,
        config: ExportConfig,
    ) -> Self {
        Self {
            backend,
            fetcher,
            sink,
            converter: Arc::new(BoxConverter),
            config,
            retry_policy: None,
        }
    }

    /// Replace the single-frame annotation converter
    pub fn with_converter(mut self, converter: Arc<dyn FrameConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Override the retry schedule derived from the configuration
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Resolve class names, the sequence map and, for question-based
    /// formats, the question text of the dataslice's project.
    #[instrument(skip(self, job), fields(dataslice_id = job.dataslice_id, format = %job.format))]
    pub async fn prepare(&self, job: &ExportJob) -> Result<PreparedExport> {
        let metadata_error = |source: BackendError| ExportError::Metadata {
            dataslice_id: job.dataslice_id,
            source,
        };

        let dataslice = self
            .backend
            .get_dataslice(job.dataslice_id)
            .await
            .map_err(metadata_error)?;

        let query = FlatParentQuery {
            dataslice_id: job.dataslice_id,
            kind: dataslice.flat_parent_kind().to_string(),
        };
        let sequence_map =
            build_sequence_map(self.backend.flat_parent_pages(query), job.is_sequential)
                .await
                .map_err(metadata_error)?;

        let question_map = if job.format.needs_project() {
            self.backend
                .get_project(dataslice.project.id)
                .await
                .map_err(metadata_error)?
                .question_map()
        } else {
            BTreeMap::new()
        };

        info!(
            sequences = sequence_map.len(),
            frames = sequence_map.frame_count(),
            datarows = sequence_map.datarow_count(),
            "Export prepared"
        );

        Ok(PreparedExport {
            class_names: dataslice.class_names(),
            sequence_map,
            question_map,
        })
    }

    /// Drive the job's format producer into `tx`
    pub async fn producer(
        &self,
        job: &ExportJob,
        prepared: &PreparedExport,
        downloader: &BatchDownloader,
        tx: ItemSender,
    ) -> Result<()> {
        let datarows =
            DatarowSupplier::new(self.backend.as_ref(), self.config.backend.id_chunk_size);
        let ctx = ProducerContext {
            class_names: &prepared.class_names,
            sequence_map: &prepared.sequence_map,
            question_map: &prepared.question_map,
            target_folder: &job.target_folder,
            source: &job.source,
            is_sequential: job.is_sequential,
            batch_size: self.config.export.batch_size,
            datarows: &datarows,
            downloader,
            converter: self.converter.as_ref(),
        };
        job.format.producer().produce(&ctx, &tx).await
    }

    /// Write everything received on `rx` to the sink, at most
    /// `write_concurrency` files at a time. Returns the number of files written.
    pub async fn consumer(&self, rx: mpsc::Receiver<ExportItem>) -> Result<u64> {
        let concurrency = self.config.export.write_concurrency.max(1);
        let semaphore = Semaphore::new(concurrency);
        let mut batches = ReceiverStream::new(rx).ready_chunks(concurrency);
        let mut written = 0u64;

        while let Some(items) = batches.next().await {
            written += self.write_batch(&semaphore, items).await?;
        }
        Ok(written)
    }

    async fn write_batch(&self, semaphore: &Semaphore, items: Vec<ExportItem>) -> Result<u64> {
        let writes = items.iter().map(|item| async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| ExportError::ChannelClosed)?;
            self.sink.write(&item.path, &item.bytes).await?;
            Ok::<_, ExportError>(())
        });
        let results = futures::future::join_all(writes).await;
        for result in results {
            result?;
        }
        debug!(count = items.len(), "Wrote batch");
        Ok(items.len() as u64)
    }

    /// Run the whole export
    #[instrument(skip(self, job), fields(
        dataslice_id = job.dataslice_id,
        format = %job.format,
        source = job.source.name(),
        is_sequential = job.is_sequential
    ))]
    pub async fn run(&self, job: &ExportJob) -> Result<ExportSummary> {
        let prepared = self.prepare(job).await?;

        let mut downloader = BatchDownloader::new(self.fetcher.clone(), &self.config.export);
        if let Some(policy) = self.retry_policy {
            downloader = downloader.with_policy(policy);
        }

        let (tx, rx) = mpsc::channel(self.config.export.write_concurrency.max(1) * 2);
        let produce = self.producer(job, &prepared, &downloader, ItemSender::new(tx));
        let ((), files_written) = tokio::try_join!(produce, self.consumer(rx))?;

        let summary = ExportSummary {
            files_written,
            media_dropped: downloader.dropped(),
        };
        info!(
            files_written = summary.files_written,
            media_dropped = summary.media_dropped,
            "Export finished"
        );
        Ok(summary)
    }
}
