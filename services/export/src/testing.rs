//! In-memory fakes and fixtures shared by the unit tests.

use crate::backend::{BackendApi, BackendError, FlatParentQuery};
use crate::fetch::{FetchError, MediaFetcher};
use crate::model::{Datarow, Dataslice, FlatParent, Keyed, MediaKind, Project};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Unannotated camera datarow with a signed media URL
pub(crate) fn datarow(id: i64, frame: i64, sensor: &str) -> Datarow {
    Datarow {
        id,
        frame_id: frame,
        sensor_name: sensor.to_string(),
        url: format!(
            "https://storage.local/dataset/data/000000000000/data/{}/{:012}.jpg?token=abc",
            sensor, frame
        ),
        original_url: format!("uploads/{}/{:012}.jpg", sensor, frame),
        image_width: 100,
        image_height: 50,
        kind: MediaKind::Image,
        frame_datarow_id: None,
        sequence_datarow_id: None,
        items: Default::default(),
        vlm_items: None,
    }
}

pub(crate) fn with_items(mut datarow: Datarow, items: serde_json::Value) -> Datarow {
    datarow.items = serde_json::from_value(items).unwrap();
    datarow
}

pub(crate) fn dataslice(id: i64, kind: &str, classes: &[&str]) -> Dataslice {
    let classes: Vec<_> = classes
        .iter()
        .enumerate()
        .map(|(rank, name)| serde_json::json!({"name": name, "rank": rank}))
        .collect();
    serde_json::from_value(serde_json::json!({
        "id": id,
        "type": kind,
        "project": {"id": 1, "ontology": {"classes": classes}}
    }))
    .unwrap()
}

fn pages<T: Keyed + Clone + Send + 'static>(
    mut records: Vec<T>,
    page_size: usize,
) -> BoxStream<'static, Result<Vec<T>, BackendError>> {
    records.sort_by_key(|record| record.key());
    let pages: Vec<Vec<T>> = records.chunks(page_size).map(<[T]>::to_vec).collect();
    stream::iter(pages.into_iter().map(Ok)).boxed()
}

/// Backend serving fixed records, paged by ascending id
pub(crate) struct InMemoryBackend {
    dataslice: Option<Dataslice>,
    project: Option<Project>,
    flat_parents: Vec<FlatParent>,
    datarows: Vec<Datarow>,
    page_size: usize,
    datarow_requests: AtomicUsize,
    project_requests: AtomicUsize,
}

impl InMemoryBackend {
    pub(crate) fn new() -> Self {
        Self {
            dataslice: None,
            project: None,
            flat_parents: Vec::new(),
            datarows: Vec::new(),
            page_size: 50,
            datarow_requests: AtomicUsize::new(0),
            project_requests: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub(crate) fn with_dataslice(mut self, dataslice: Dataslice) -> Self {
        self.project = Some(dataslice.project.clone());
        self.dataslice = Some(dataslice);
        self
    }

    pub(crate) fn with_project(mut self, project: Project) -> Self {
        self.project = Some(project);
        self
    }

    pub(crate) fn with_flat_parents(mut self, flat_parents: Vec<FlatParent>) -> Self {
        self.flat_parents = flat_parents;
        self
    }

    pub(crate) fn with_datarows(mut self, datarows: Vec<Datarow>) -> Self {
        self.datarows = datarows;
        self
    }

    /// Calls to `datarow_pages` so far
    pub(crate) fn datarow_requests(&self) -> usize {
        self.datarow_requests.load(Ordering::SeqCst)
    }

    pub(crate) fn project_requests(&self) -> usize {
        self.project_requests.load(Ordering::SeqCst)
    }
}

fn not_found(what: &str) -> BackendError {
    BackendError::Api {
        status: 404,
        body: format!("{} not found", what),
    }
}

#[async_trait]
impl BackendApi for InMemoryBackend {
    async fn get_dataslice(&self, dataslice_id: i64) -> Result<Dataslice, BackendError> {
        self.dataslice
            .clone()
            .filter(|dataslice| dataslice.id == dataslice_id)
            .ok_or_else(|| not_found("dataslice"))
    }

    async fn get_project(&self, project_id: i64) -> Result<Project, BackendError> {
        self.project_requests.fetch_add(1, Ordering::SeqCst);
        self.project
            .clone()
            .filter(|project| project.id == project_id)
            .ok_or_else(|| not_found("project"))
    }

    fn flat_parent_pages(
        &self,
        _query: FlatParentQuery,
    ) -> BoxStream<'_, Result<Vec<FlatParent>, BackendError>> {
        pages(self.flat_parents.clone(), self.page_size)
    }

    fn datarow_pages(&self, ids: Vec<i64>) -> BoxStream<'_, Result<Vec<Datarow>, BackendError>> {
        self.datarow_requests.fetch_add(1, Ordering::SeqCst);
        let wanted: HashSet<i64> = ids.into_iter().collect();
        let rows = self
            .datarows
            .iter()
            .filter(|row| wanted.contains(&row.id))
            .cloned()
            .collect();
        pages(rows, self.page_size)
    }
}

/// Fetcher answering every URL with its own bytes, except the failing ones
#[derive(Default)]
pub(crate) struct FakeFetcher {
    failing: HashSet<String>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl FakeFetcher {
    pub(crate) fn failing(urls: impl IntoIterator<Item = String>) -> Self {
        Self {
            failing: urls.into_iter().collect(),
            ..Self::default()
        }
    }

    pub(crate) fn attempts(&self, url: &str) -> usize {
        self.attempts.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MediaFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        *self.attempts.lock().unwrap().entry(url.to_string()).or_default() += 1;
        if self.failing.contains(url) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: 503,
            });
        }
        Ok(Bytes::copy_from_slice(url.as_bytes()))
    }
}
