//! YOLO detection export.
//!
//! One `labels/<stem>.txt` per image with normalized center boxes, plus a
//! `classes.txt` listing class names in index order.

use super::{split_extension, FormatProducer, ImageBatches, ItemSender, ProducerContext};
use crate::converter::{ClassMap, ConvertError, ConvertedRecord};
use crate::error::{ExportError, Result};
use crate::sink::ExportItem;
use async_trait::async_trait;
use tracing::{info, instrument};

pub const LABEL_DIR: &str = "labels";
pub const CLASSES_FILE: &str = "classes.txt";

/// `labels/<image stem>.txt`
pub fn label_path(file_name: &str) -> String {
    format!("{}/{}.txt", LABEL_DIR, split_extension(file_name).0)
}

/// One `class cx cy w h` line per record, normalized to the image size
pub fn label_lines(
    records: &[ConvertedRecord],
    width: u32,
    height: u32,
) -> std::result::Result<String, ConvertError> {
    let lines = records
        .iter()
        .map(|record| {
            let [cx, cy, w, h] = record.normalized_box(width, height)?;
            Ok(format!(
                "{} {:.6} {:.6} {:.6} {:.6}",
                record.class_id, cx, cy, w, h
            ))
        })
        .collect::<std::result::Result<Vec<_>, ConvertError>>()?;
    Ok(lines.join("\n"))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YoloProducer;

#[async_trait]
impl FormatProducer for YoloProducer {
    #[instrument(skip_all, fields(datarows = ctx.sequence_map.datarow_count()))]
    async fn produce(&self, ctx: &ProducerContext<'_>, tx: &ItemSender) -> Result<()> {
        let mut batches = ImageBatches::new(ctx);
        let mut classes = ClassMap::from_names(ctx.class_names);
        let mut labels = 0usize;

        while let Some(images) = batches.next_batch(tx).await? {
            for image in images {
                let datarow = &image.datarow;
                let fragment = datarow.fragment(ctx.source);
                let convert_error = |source: ConvertError| ExportError::Convert {
                    datarow_id: datarow.id,
                    source,
                };
                let (records, next) = ctx
                    .converter
                    .convert(
                        &fragment,
                        &datarow.sensor_name,
                        datarow.image_width,
                        datarow.image_height,
                        classes,
                    )
                    .map_err(convert_error)?;
                classes = next;

                let content = label_lines(&records, datarow.image_width, datarow.image_height)
                    .map_err(convert_error)?;
                tx.send(ExportItem::new(content, label_path(&image.file_name)))
                    .await?;
                labels += 1;
            }
        }

        info!(labels, classes = classes.len(), "YOLO export produced");
        tx.send(ExportItem::new(
            classes.names().join("\n"),
            CLASSES_FILE,
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_path_uses_stem() {
        assert_eq!(label_path("front(1).jpg"), "labels/front(1).txt");
        assert_eq!(label_path("scan.v2.png"), "labels/scan.v2.txt");
    }

    #[test]
    fn test_label_lines() {
        let records = vec![
            ConvertedRecord {
                class_id: 1,
                class_name: "bus".to_string(),
                bbox: [40.0, 30.0, 20.0, 10.0],
                segmentation: Vec::new(),
                area: 200.0,
            },
            ConvertedRecord {
                class_id: 0,
                class_name: "car".to_string(),
                bbox: [0.0, 0.0, 100.0, 50.0],
                segmentation: Vec::new(),
                area: 5000.0,
            },
        ];
        assert_eq!(
            label_lines(&records, 100, 50).unwrap(),
            "1 0.500000 0.700000 0.200000 0.200000\n0 0.500000 0.500000 1.000000 1.000000"
        );
        assert_eq!(label_lines(&[], 100, 50).unwrap(), "");
        assert!(label_lines(&records, 0, 50).is_err());
    }
}
