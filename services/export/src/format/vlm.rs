//! Question/answer export for vision-language projects.

use super::{FormatProducer, ImageBatches, ItemSender, ProducerContext};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

pub const VLM_ANNOTATION_PATH: &str = "annotations/vlm_annotation.json";

/// One question and its answers keyed by annotation source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    #[serde(default)]
    pub question_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default)]
    pub answer: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `data` payload of a datarow's `vlm_items`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VlmRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VlmRecord {
    /// Parse `vlm_items.data`, `None` when absent or malformed
    pub fn from_items(
        vlm_items: Option<&Value>,
    ) -> Option<std::result::Result<Self, serde_json::Error>> {
        let data = vlm_items?.get("data")?;
        Some(serde_json::from_value(data.clone()))
    }

    /// Keep only the conversations answered by `source`, reduce each answer
    /// to that source and resolve question text by question id
    pub fn select_source(mut self, source: &str, questions: &BTreeMap<i64, String>) -> Self {
        self.conversations.retain(|c| c.answer.get(source).is_some_and(|a| !a.is_null()));
        for conversation in &mut self.conversations {
            conversation.answer.retain(|name, _| name == source);
            match conversation.question_id.and_then(|id| questions.get(&id)) {
                Some(question) => conversation.question = Some(question.clone()),
                None => debug!(
                    question_id = ?conversation.question_id,
                    "No question text for conversation"
                ),
            }
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VlmProducer;

#[async_trait]
impl FormatProducer for VlmProducer {
    #[instrument(skip_all, fields(datarows = ctx.sequence_map.datarow_count()))]
    async fn produce(&self, ctx: &ProducerContext<'_>, tx: &ItemSender) -> Result<()> {
        let mut batches = ImageBatches::new(ctx);
        let mut records = Vec::new();

        while let Some(images) = batches.next_batch(tx).await? {
            for image in images {
                let record = match VlmRecord::from_items(image.datarow.vlm_items.as_ref()) {
                    Some(Ok(record)) => record,
                    Some(Err(e)) => {
                        warn!(
                            datarow_id = image.datarow.id,
                            error = %e,
                            "Malformed vlm_items, skipping"
                        );
                        continue;
                    }
                    None => {
                        warn!(datarow_id = image.datarow.id, "Datarow has no vlm_items, skipping");
                        continue;
                    }
                };
                let mut record = record.select_source(ctx.source.name(), ctx.question_map);
                record.id = format!("{:012}", records.len());
                record.image = image.file_name;
                records.push(record);
            }
        }

        info!(records = records.len(), "VLM export produced");
        tx.send_json(&records, VLM_ANNOTATION_PATH.to_string()).await
    }
}
