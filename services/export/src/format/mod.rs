//! Output formats.
//!
//! Every format implements [`FormatProducer`]: given the prepared export it
//! emits `(bytes, relative path)` items into the export channel. Formats are a
//! closed set resolved at compile time through [`ExportFormat::producer`].

mod coco;
mod visionai;
mod vlm;
mod yolo;

pub use coco::CocoProducer;
pub use visionai::VisionAiProducer;
pub use vlm::VlmProducer;
pub use yolo::YoloProducer;

use crate::annotation::AnnotationSource;
use crate::backend::DatarowSupplier;
use crate::converter::FrameConverter;
use crate::error::{ExportError, Result};
use crate::fetch::{BatchDownloader, MediaRequest};
use crate::model::{file_name_of, Datarow};
use crate::sequence::SequenceMap;
use crate::sink::ExportItem;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::debug;

/// Media folder of the single-frame formats
pub const IMAGE_DIR: &str = "images";

/// Registered output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    VisionAi,
    Coco,
    Yolo,
    Vlm,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 4] = [
        ExportFormat::VisionAi,
        ExportFormat::Coco,
        ExportFormat::Yolo,
        ExportFormat::Vlm,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            ExportFormat::VisionAi => "visionai",
            ExportFormat::Coco => "coco",
            ExportFormat::Yolo => "yolo",
            ExportFormat::Vlm => "vlm",
        }
    }

    /// Whether preparing this format needs the project's question ontology
    pub fn needs_project(&self) -> bool {
        matches!(self, ExportFormat::Vlm)
    }

    pub fn producer(&self) -> &'static dyn FormatProducer {
        match self {
            ExportFormat::VisionAi => &VisionAiProducer,
            ExportFormat::Coco => &CocoProducer,
            ExportFormat::Yolo => &YoloProducer,
            ExportFormat::Vlm => &VlmProducer,
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ExportFormat::ALL
            .into_iter()
            .find(|format| format.key() == s)
            .ok_or_else(|| ExportError::UnknownFormat(s.to_string()))
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Everything a producer reads while emitting
pub struct ProducerContext<'a> {
    pub class_names: &'a [String],
    pub sequence_map: &'a SequenceMap,
    /// Question text by class rank, filled for question-based projects
    pub question_map: &'a BTreeMap<i64, String>,
    /// Export root, used for absolute stream URIs in native documents
    pub target_folder: &'a str,
    pub source: &'a AnnotationSource,
    pub is_sequential: bool,
    pub batch_size: usize,
    pub datarows: &'a DatarowSupplier<'a>,
    pub downloader: &'a BatchDownloader,
    pub converter: &'a dyn FrameConverter,
}

impl ProducerContext<'_> {
    /// Every datarow id of the export in sequence map order
    pub fn all_datarow_ids(&self) -> Vec<i64> {
        self.sequence_map
            .iter()
            .flat_map(|sequence| &sequence.frames)
            .flat_map(|frame| frame.datarow_ids.iter().copied())
            .collect()
    }

    pub async fn fetch_datarows(&self, ids: &[i64], batch: usize) -> Result<Vec<Datarow>> {
        self.datarows
            .fetch(ids)
            .await
            .map_err(|source| ExportError::Datarows { batch, source })
    }
}

/// Sending half of the export channel
#[derive(Debug, Clone)]
pub struct ItemSender {
    tx: mpsc::Sender<ExportItem>,
}

impl ItemSender {
    pub fn new(tx: mpsc::Sender<ExportItem>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, item: ExportItem) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| ExportError::ChannelClosed)
    }

    /// Serialize `value` as JSON and send it
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T, path: String) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|source| ExportError::Serialize {
            path: path.clone(),
            source,
        })?;
        self.send(ExportItem::new(bytes, path)).await
    }

    pub async fn send_all(&self, items: impl IntoIterator<Item = (Bytes, String)>) -> Result<()> {
        for (bytes, path) in items {
            self.send(ExportItem::new(bytes, path)).await?;
        }
        Ok(())
    }
}

/// Emits the files of one output format
#[async_trait]
pub trait FormatProducer: Send + Sync {
    async fn produce(&self, ctx: &ProducerContext<'_>, tx: &ItemSender) -> Result<()>;
}

/// Split a file name into stem and extension, the extension keeping its dot.
///
/// A leading dot does not start an extension.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Extension of the media behind `url`, without any query string
pub fn media_extension(url: &str) -> &str {
    split_extension(file_name_of(url)).1
}

/// Hands out file names that never repeat within one export.
///
/// A repeated `name.ext` becomes `name(1).ext`, then `name(2).ext`, and so on.
#[derive(Debug, Default)]
pub struct UniqueNames {
    taken: HashSet<String>,
}

impl UniqueNames {
    pub fn claim(&mut self, name: &str) -> String {
        let (stem, extension) = split_extension(name);
        let mut candidate = name.to_string();
        let mut counter = 1;
        while self.taken.contains(&candidate) {
            candidate = format!("{}({}){}", stem, counter, extension);
            counter += 1;
        }
        self.taken.insert(candidate.clone());
        candidate
    }

    /// Unique image name for a datarow, from its upload name or its media URL
    pub fn claim_for(&mut self, datarow: &Datarow) -> String {
        let name = datarow
            .original_file_name()
            .unwrap_or_else(|| file_name_of(&datarow.url));
        self.claim(name)
    }
}

/// A fetched datarow of a single-frame export and its unique image name
#[derive(Debug, Clone)]
pub struct NamedImage {
    pub datarow: Datarow,
    pub file_name: String,
}

impl NamedImage {
    pub fn media_path(&self) -> String {
        format!("{}/{}", IMAGE_DIR, self.file_name)
    }
}

/// Walks the export's datarows in batches for the single-frame formats.
///
/// Each batch is fetched from the backend, named, downloaded to
/// `images/<unique name>` and sent. Only datarows whose media made it into
/// the export are handed back, so annotations never reference missing images.
pub struct ImageBatches<'c, 'a> {
    ctx: &'c ProducerContext<'a>,
    ids: Vec<i64>,
    batch: usize,
    names: UniqueNames,
}

impl<'c, 'a> ImageBatches<'c, 'a> {
    pub fn new(ctx: &'c ProducerContext<'a>) -> Self {
        Self {
            ctx,
            ids: ctx.all_datarow_ids(),
            batch: 0,
            names: UniqueNames::default(),
        }
    }

    pub async fn next_batch(&mut self, tx: &ItemSender) -> Result<Option<Vec<NamedImage>>> {
        let batch_size = self.ctx.batch_size.max(1);
        let start = self.batch * batch_size;
        if start >= self.ids.len() {
            return Ok(None);
        }
        let end = (start + batch_size).min(self.ids.len());
        let batch = self.batch;
        self.batch += 1;

        let datarows = self.ctx.fetch_datarows(&self.ids[start..end], batch).await?;
        let mut images = Vec::with_capacity(datarows.len());
        let mut requests = Vec::with_capacity(datarows.len());
        for datarow in datarows {
            let image = NamedImage {
                file_name: self.names.claim_for(&datarow),
                datarow,
            };
            requests.push(MediaRequest {
                url: image.datarow.url.clone(),
                path: image.media_path(),
            });
            images.push(image);
        }

        let media = self
            .ctx
            .downloader
            .download_batch(requests)
            .await
            .map_err(|source| ExportError::MediaUnavailable { batch, source })?;
        let fetched: HashSet<String> =
            media.iter().map(|(_, request)| request.path.clone()).collect();
        tx.send_all(media.into_iter().map(|(bytes, request)| (bytes, request.path)))
            .await?;

        images.retain(|image| fetched.contains(&image.media_path()));
        debug!(batch, images = images.len(), "Image batch exported");
        Ok(Some(images))
    }
}
