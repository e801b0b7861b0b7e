//! COCO detection export.
//!
//! Images are written under `images/` and every box of the selected source
//! lands in a single `annotations/coco.json`.

use super::{FormatProducer, ImageBatches, ItemSender, NamedImage, ProducerContext, IMAGE_DIR};
use crate::converter::{ClassMap, ConvertedRecord};
use crate::error::{ExportError, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument};

pub const COCO_LABEL_PATH: &str = "annotations/coco.json";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CocoImage {
    pub id: u64,
    pub file_name: String,
    pub coco_url: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CocoAnnotation {
    pub id: u64,
    pub image_id: u64,
    pub category_id: usize,
    pub bbox: [f64; 4],
    pub segmentation: Vec<Vec<f64>>,
    pub area: f64,
    pub iscrowd: u8,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CocoCategory {
    pub id: usize,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CocoDocument {
    pub images: Vec<CocoImage>,
    pub annotations: Vec<CocoAnnotation>,
    pub categories: Vec<CocoCategory>,
}

/// Accumulates one COCO document across image batches
struct CocoBuilder {
    image_root: String,
    images: Vec<CocoImage>,
    annotations: Vec<CocoAnnotation>,
    classes: ClassMap,
}

impl CocoBuilder {
    fn new(target_folder: &str, class_names: &[String]) -> Self {
        Self {
            image_root: format!("{}/{}", target_folder.trim_end_matches('/'), IMAGE_DIR),
            images: Vec::new(),
            annotations: Vec::new(),
            classes: ClassMap::from_names(class_names),
        }
    }

    fn add(&mut self, image: &NamedImage, records: Vec<ConvertedRecord>) {
        let image_id = self.images.len() as u64;
        self.images.push(CocoImage {
            id: image_id,
            file_name: image.file_name.clone(),
            coco_url: format!("{}/{}", self.image_root, image.file_name),
            width: image.datarow.image_width,
            height: image.datarow.image_height,
        });
        for record in records {
            self.annotations.push(CocoAnnotation {
                id: self.annotations.len() as u64,
                image_id,
                category_id: record.class_id,
                bbox: record.bbox,
                segmentation: record.segmentation,
                area: record.area,
                iscrowd: 0,
            });
        }
    }

    fn finish(self) -> CocoDocument {
        let categories = self
            .classes
            .names()
            .iter()
            .enumerate()
            .map(|(id, name)| CocoCategory {
                id,
                name: name.clone(),
            })
            .collect();
        CocoDocument {
            images: self.images,
            annotations: self.annotations,
            categories,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CocoProducer;

#[async_trait]
impl FormatProducer for CocoProducer {
    #[instrument(skip_all, fields(datarows = ctx.sequence_map.datarow_count()))]
    async fn produce(&self, ctx: &ProducerContext<'_>, tx: &ItemSender) -> Result<()> {
        let mut batches = ImageBatches::new(ctx);
        let mut coco = CocoBuilder::new(ctx.target_folder, ctx.class_names);

        while let Some(images) = batches.next_batch(tx).await? {
            for image in images {
                let datarow = &image.datarow;
                let fragment = datarow.fragment(ctx.source);
                let classes = std::mem::take(&mut coco.classes);
                let (records, classes) = ctx
                    .converter
                    .convert(
                        &fragment,
                        &datarow.sensor_name,
                        datarow.image_width,
                        datarow.image_height,
                        classes,
                    )
                    .map_err(|source| ExportError::Convert {
                        datarow_id: datarow.id,
                        source,
                    })?;
                coco.classes = classes;
                coco.add(&image, records);
            }
        }

        let document = coco.finish();
        info!(
            images = document.images.len(),
            annotations = document.annotations.len(),
            categories = document.categories.len(),
            "COCO export produced"
        );
        tx.send_json(&document, COCO_LABEL_PATH.to_string()).await
    }
}
