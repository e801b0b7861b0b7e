//! Native sequence format.
//!
//! Media land at `<sequence:012>/data/<sensor>/<frame:012><ext>` and every
//! sequence gets one aggregated document at
//! `<sequence:012>/annotations/<source>/annotation.json`.

use super::{media_extension, FormatProducer, ItemSender, ProducerContext};
use crate::annotation::{aggregate_sequence, VisionAiDocument};
use crate::error::{ExportError, Result};
use crate::fetch::MediaRequest;
use crate::model::Datarow;
use crate::sequence::Sequence;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

pub const ANNOTATION_FILE: &str = "annotation.json";

/// Export folder of one sequence, with a trailing slash
pub fn sequence_folder(target_folder: &str, order: usize) -> String {
    format!("{}/{:012}/", target_folder.trim_end_matches('/'), order)
}

pub fn media_path(order: usize, datarow: &Datarow) -> String {
    format!(
        "{:012}/data/{}/{:012}{}",
        order,
        datarow.sensor_name,
        datarow.frame_id,
        media_extension(&datarow.url)
    )
}

pub fn annotation_path(order: usize, source_name: &str) -> String {
    format!("{:012}/annotations/{}/{}", order, source_name, ANNOTATION_FILE)
}

/// Where the producer is between flushes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushState {
    /// Collecting sequences into the pending batch
    Accumulating,
    /// The pending batch is complete; `exhausted` once the map has no more sequences
    FlushPending { exhausted: bool },
    Done,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VisionAiProducer;

impl VisionAiProducer {
    /// Sequential exports flush after each sequence so a document always sees
    /// its whole sequence. Otherwise sequences are singleton frames and are
    /// batched up to the batch size.
    fn batch_complete(ctx: &ProducerContext<'_>, pending: &[&Sequence]) -> bool {
        ctx.is_sequential
            || pending.iter().map(|s| s.datarow_count()).sum::<usize>() >= ctx.batch_size
    }

    #[instrument(skip(self, ctx, tx, pending), fields(sequences = pending.len()))]
    async fn flush(
        &self,
        ctx: &ProducerContext<'_>,
        tx: &ItemSender,
        pending: &[&Sequence],
        batch: usize,
    ) -> Result<()> {
        let ids: Vec<i64> = pending
            .iter()
            .flat_map(|sequence| &sequence.frames)
            .flat_map(|frame| frame.datarow_ids.iter().copied())
            .collect();
        let datarows = ctx.fetch_datarows(&ids, batch).await?;
        let by_id: HashMap<i64, &Datarow> = datarows.iter().map(|row| (row.id, row)).collect();

        let mut requests = Vec::with_capacity(datarows.len());
        for sequence in pending {
            for frame in &sequence.frames {
                for id in &frame.datarow_ids {
                    match by_id.get(id) {
                        Some(datarow) => requests.push(MediaRequest {
                            url: datarow.url.clone(),
                            path: media_path(sequence.order, datarow),
                        }),
                        None => warn!(datarow_id = id, "Datarow missing from backend response"),
                    }
                }
            }
        }

        let media = ctx
            .downloader
            .download_batch(requests)
            .await
            .map_err(|source| ExportError::MediaUnavailable { batch, source })?;
        let media_count = media.len();
        tx.send_all(media.into_iter().map(|(bytes, request)| (bytes, request.path)))
            .await?;

        for sequence in pending {
            let frame_groups: Vec<Vec<&Datarow>> = sequence
                .frames
                .iter()
                .map(|frame| {
                    frame
                        .datarow_ids
                        .iter()
                        .filter_map(|id| by_id.get(id).copied())
                        .collect::<Vec<_>>()
                })
                .filter(|group| !group.is_empty())
                .collect();
            if frame_groups.is_empty() {
                continue;
            }

            let folder = sequence_folder(ctx.target_folder, sequence.order);
            let visionai = aggregate_sequence(&frame_groups, &folder, ctx.source).map_err(
                |source| ExportError::Aggregation {
                    sequence: sequence.order,
                    source,
                },
            )?;
            tx.send_json(
                &VisionAiDocument { visionai },
                annotation_path(sequence.order, ctx.source.name()),
            )
            .await?;
        }

        debug!(batch, datarows = datarows.len(), media = media_count, "Flushed batch");
        Ok(())
    }
}

#[async_trait]
impl FormatProducer for VisionAiProducer {
    #[instrument(skip_all, fields(
        sequences = ctx.sequence_map.len(),
        is_sequential = ctx.is_sequential
    ))]
    async fn produce(&self, ctx: &ProducerContext<'_>, tx: &ItemSender) -> Result<()> {
        let mut sequences = ctx.sequence_map.iter();
        let mut pending: Vec<&Sequence> = Vec::new();
        let mut batch = 0usize;
        let mut state = FlushState::Accumulating;

        loop {
            state = match state {
                FlushState::Accumulating => match sequences.next() {
                    Some(sequence) => {
                        pending.push(sequence);
                        if Self::batch_complete(ctx, &pending) {
                            FlushState::FlushPending { exhausted: false }
                        } else {
                            FlushState::Accumulating
                        }
                    }
                    None => FlushState::FlushPending { exhausted: true },
                },
                FlushState::FlushPending { exhausted } => {
                    if !pending.is_empty() {
                        self.flush(ctx, tx, &pending, batch).await?;
                        pending.clear();
                        batch += 1;
                    }
                    if exhausted {
                        FlushState::Done
                    } else {
                        FlushState::Accumulating
                    }
                }
                FlushState::Done => break,
            };
        }

        info!(batches = batch, "Native export produced");
        Ok(())
    }
}
