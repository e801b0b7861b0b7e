//! Curation backend client.
//!
//! Exposes the handful of read endpoints the export needs behind the
//! [`BackendApi`] trait, implemented over HTTP by [`HttpBackend`]. List
//! endpoints are keyset-paginated on ascending id and surfaced as page
//! streams.

use crate::config::BackendConfig;
use crate::model::{Datarow, Dataslice, FlatParent, Keyed, Project};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Projection requested for exported datarows
pub const DATAROW_FIELDS: &str =
    "id,items,vlm_items,url,frame_id,image_width,image_height,sensor_name,original_url,type";

/// Projection requested for the flat-parent listing
pub const FLAT_PARENT_FIELDS: &str = "id,sequence_datarow_id,frame_datarow_id";

const SERVICE_ID_HEADER: &str = "X-Request-Service-Id";

/// Errors from the backend REST layer
#[derive(Error, Debug)]
pub enum BackendError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout)
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Backend API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to decode response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for header {0}")]
    InvalidHeader(&'static str),
}

/// Filter for the flat-parent listing of a dataslice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatParentQuery {
    pub dataslice_id: i64,
    /// Datarow type filter (`image`, `pcd` or `base`)
    pub kind: String,
}

/// Read access to the curation backend
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn get_dataslice(&self, dataslice_id: i64) -> Result<Dataslice, BackendError>;

    async fn get_project(&self, project_id: i64) -> Result<Project, BackendError>;

    /// Pages of `(id, sequence parent, frame parent)` for a dataslice
    fn flat_parent_pages(
        &self,
        query: FlatParentQuery,
    ) -> BoxStream<'_, Result<Vec<FlatParent>, BackendError>>;

    /// Pages of full datarows restricted to `ids`
    fn datarow_pages(&self, ids: Vec<i64>) -> BoxStream<'_, Result<Vec<Datarow>, BackendError>>;
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

/// HTTP client for the curation backend
pub struct HttpBackend {
    client: reqwest::Client,
    host: String,
    page_size: usize,
}

impl HttpBackend {
    /// Create a client with auth headers and timeout from configuration
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.access_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| BackendError::InvalidHeader("Authorization"))?;
            headers.insert(AUTHORIZATION, value);
        }
        if !config.service_id.is_empty() {
            let value = HeaderValue::from_str(&config.service_id)
                .map_err(|_| BackendError::InvalidHeader(SERVICE_ID_HEADER))?;
            headers.insert(SERVICE_ID_HEADER, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self::with_client(client, config))
    }

    /// Create a backend reusing an existing [`reqwest::Client`]
    pub fn with_client(client: reqwest::Client, config: &BackendConfig) -> Self {
        Self {
            client,
            host: config.host.trim_end_matches('/').to_string(),
            page_size: config.page_size,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, BackendError> {
        let response = self
            .client
            .get(format!("{}{}", self.host, path))
            .query(query)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| BackendError::Decode {
            path: path.to_string(),
            source,
        })
    }

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read body: {}>", e));
            return Err(BackendError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Walk a list endpoint with `id__gt` keyset pagination until an empty page
    fn paginate<T>(
        &self,
        path: &'static str,
        params: Vec<(&'static str, String)>,
    ) -> BoxStream<'_, Result<Vec<T>, BackendError>>
    where
        T: DeserializeOwned + Keyed + Send + 'static,
    {
        stream::try_unfold(Some(0i64), move |cursor| {
            let mut query = params.clone();
            async move {
                let Some(id_gt) = cursor else {
                    return Ok(None);
                };
                query.push(("order_by", "id".to_string()));
                query.push(("limit", self.page_size.to_string()));
                query.push(("id__gt", id_gt.to_string()));

                let page: Page<T> = self.get_json(path, &query).await?;
                debug!(path, id_gt, count = page.results.len(), "Fetched page");

                let last = page.results.last().map(Keyed::key);
                Ok(last.map(|last| (page.results, Some(last))))
            }
        })
        .boxed()
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    #[instrument(skip(self))]
    async fn get_dataslice(&self, dataslice_id: i64) -> Result<Dataslice, BackendError> {
        self.get_json(&format!("/api/dataslices/{}/", dataslice_id), &[])
            .await
    }

    #[instrument(skip(self))]
    async fn get_project(&self, project_id: i64) -> Result<Project, BackendError> {
        self.get_json(&format!("/api/projects/{}/", project_id), &[])
            .await
    }

    fn flat_parent_pages(
        &self,
        query: FlatParentQuery,
    ) -> BoxStream<'_, Result<Vec<FlatParent>, BackendError>> {
        self.paginate(
            "/api/datarows/flat-parent/",
            vec![
                ("dataslice_id", query.dataslice_id.to_string()),
                ("type", query.kind),
                ("fields", FLAT_PARENT_FIELDS.to_string()),
            ],
        )
    }

    fn datarow_pages(&self, ids: Vec<i64>) -> BoxStream<'_, Result<Vec<Datarow>, BackendError>> {
        let id_set = ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.paginate(
            "/api/datarows/",
            vec![
                ("id_set", id_set),
                ("fields", DATAROW_FIELDS.to_string()),
            ],
        )
    }
}

/// Yields full datarows for arbitrary id lists.
///
/// Ids are requested in chunks of `chunk_size` and datarows already yielded
/// by this supplier are skipped.
pub struct DatarowSupplier<'a> {
    backend: &'a dyn BackendApi,
    chunk_size: usize,
}

impl<'a> DatarowSupplier<'a> {
    pub fn new(backend: &'a dyn BackendApi, chunk_size: usize) -> Self {
        Self {
            backend,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Stream the datarows for `ids`, in backend order within each chunk
    pub fn stream(&self, ids: &[i64]) -> BoxStream<'a, Result<Datarow, BackendError>> {
        let backend = self.backend;
        let chunks: Vec<Vec<i64>> = ids.chunks(self.chunk_size).map(<[i64]>::to_vec).collect();
        let mut seen: HashSet<i64> = HashSet::new();

        stream::iter(chunks)
            .map(move |chunk| backend.datarow_pages(chunk))
            .flatten()
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, BackendError>)))
            .try_flatten()
            .try_filter(move |datarow| futures::future::ready(seen.insert(datarow.id)))
            .boxed()
    }

    /// Collect all datarows for `ids`
    pub async fn fetch(&self, ids: &[i64]) -> Result<Vec<Datarow>, BackendError> {
        self.stream(ids).try_collect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{datarow, InMemoryBackend};

    #[test]
    fn test_http_backend_trims_host() {
        let config = BackendConfig {
            host: "https://curation.example.com/".to_string(),
            access_token: Some("token".to_string()),
            service_id: "svc".to_string(),
            ..BackendConfig::default()
        };
        let backend = HttpBackend::new(&config).unwrap();
        assert_eq!(backend.host, "https://curation.example.com");
        assert_eq!(backend.page_size, 50);
    }

    #[test]
    fn test_invalid_token_rejected() {
        let config = BackendConfig {
            access_token: Some("bad\ntoken".to_string()),
            ..BackendConfig::default()
        };
        assert!(matches!(
            HttpBackend::new(&config),
            Err(BackendError::InvalidHeader("Authorization"))
        ));
    }

    #[test]
    fn test_page_decodes_without_results() {
        let page: Page<FlatParent> = serde_json::from_str(r#"{"count": 0}"#).unwrap();
        assert!(page.results.is_empty());
    }

    #[tokio::test]
    async fn test_supplier_chunks_and_dedups() {
        let backend = InMemoryBackend::new().with_page_size(2).with_datarows(
            (1..=5).map(|id| datarow(id, id, "camera1")).collect(),
        );
        let supplier = DatarowSupplier::new(&backend, 2);

        let rows = supplier.fetch(&[1, 2, 3, 2, 5, 5]).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 5]);
        assert_eq!(backend.datarow_requests(), 3);
    }
}
