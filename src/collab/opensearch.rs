//! OpenSearch k-NN index over the REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use super::{IndexDocument, SearchHit, SearchIndex, VectorField, EMBEDDING_DIM};
use crate::config::OpenSearchConfig;
use crate::error::{CorpusError, Result};

const SERVICE: &str = "opensearch";

/// [`SearchIndex`] talking to a single OpenSearch index.
#[derive(Debug, Clone)]
pub struct OpenSearchIndex {
    client: Client,
    base_url: String,
    index: String,
    username: Option<String>,
    password: Option<String>,
}

impl OpenSearchIndex {
    /// Build the HTTP client for `config`.
    pub fn new(config: &OpenSearchConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| CorpusError::external(SERVICE, e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            index: config.index.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{path}", self.base_url, self.index)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        self.authorized(request)
            .send()
            .await
            .map_err(|e| CorpusError::external(SERVICE, e.to_string()))
    }

    async fn exists(&self) -> Result<bool> {
        let response = self.send(self.client.head(self.url(""))).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(CorpusError::external(SERVICE, format!("HEAD index returned {status}"))),
        }
    }
}

/// Index settings and mapping: cosine k-NN over the four vector fields.
#[must_use]
pub fn index_body() -> Value {
    let vector = json!({ "type": "knn_vector", "dimension": EMBEDDING_DIM });
    let mut properties = serde_json::Map::new();
    properties.insert("video_id".into(), json!({ "type": "keyword" }));
    properties.insert("annotation_id".into(), json!({ "type": "keyword" }));
    properties.insert("annotation_value".into(), json!({ "type": "text" }));
    for field in VectorField::ALL {
        properties.insert(field.field_name().into(), vector.clone());
    }

    json!({
        "settings": {
            "index": {
                "knn": true,
                "knn.space_type": "cosinesimil"
            }
        },
        "mappings": { "properties": properties }
    })
}

/// Body of a k-NN query against one vector field.
#[must_use]
pub fn knn_query(field: VectorField, vector: &[f32], k: usize) -> Value {
    json!({
        "size": k,
        "_source": { "excludes": VectorField::ALL.map(VectorField::field_name) },
        "query": {
            "knn": {
                field.field_name(): { "vector": vector, "k": k }
            }
        }
    })
}

#[async_trait]
impl SearchIndex for OpenSearchIndex {
    #[instrument(skip(self), fields(index = %self.index))]
    async fn ensure_index(&self) -> Result<()> {
        if self.exists().await? {
            return Ok(());
        }
        let response = self
            .send(self.client.put(self.url("")).json(&index_body()))
            .await?;
        check(response).await?;
        info!("Created index {}", self.index);
        Ok(())
    }

    #[instrument(skip(self, document), fields(id = %document.id()))]
    async fn upsert(&self, document: &IndexDocument) -> Result<()> {
        let url = self.url(&format!("/_doc/{}?refresh=true", document.id()));
        let response = self.send(self.client.put(url).json(document)).await?;
        check(response).await?;
        debug!("Indexed {}", document.id());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<()> {
        let url = self.url(&format!("/_doc/{id}?refresh=true"));
        let response = self.send(self.client.delete(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Index document {id} already absent");
            return Ok(());
        }
        check(response).await.map(|_| ())
    }

    #[instrument(skip(self, vector), fields(field = %field))]
    async fn knn_search(&self, field: VectorField, vector: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let response = self
            .send(
                self.client
                    .post(self.url("/_search"))
                    .json(&knn_query(field, vector, k)),
            )
            .await?;
        let body = check(response).await?;
        let parsed: SearchResponse = serde_json::from_value(body)?;
        Ok(parsed.hits.hits.into_iter().map(SearchHit::from).collect())
    }
}

async fn check(response: Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| CorpusError::external(SERVICE, format!("invalid response body: {e}")))?;
    if status.is_success() {
        Ok(body)
    } else {
        let reason = body
            .pointer("/error/reason")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        Err(CorpusError::external(SERVICE, format!("{status}: {reason}")))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Debug, Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score", default)]
    score: f32,
    #[serde(rename = "_source", default)]
    source: HitSource,
}

#[derive(Debug, Default, Deserialize)]
struct HitSource {
    video_id: Option<String>,
    annotation_id: Option<String>,
    annotation_value: Option<String>,
}

impl From<RawHit> for SearchHit {
    fn from(hit: RawHit) -> Self {
        Self {
            id: hit.id,
            score: hit.score,
            video_id: hit.source.video_id,
            annotation_id: hit.source.annotation_id,
            annotation_value: hit.source.annotation_value,
        }
    }
}
