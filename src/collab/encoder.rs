//! HTTP client for the embedding service.
//!
//! The service exposes `POST /encode/text` (`{"text": ...}`) and
//! `POST /encode/image` (`{"path": ...}`, a file readable by the service),
//! both answering `{"embedding": [f32; 512]}`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use super::Encoder;
use crate::config::EncoderConfig;
use crate::error::{CorpusError, Result};

const SERVICE: &str = "encoder";

#[derive(Debug, Clone)]
pub struct HttpEncoder {
    client: Client,
    base_url: String,
    dimension: usize,
}

#[derive(Debug, Deserialize)]
struct EncodeResponse {
    embedding: Vec<f32>,
}

impl HttpEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CorpusError::external(SERVICE, e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            dimension: config.dimension,
        })
    }

    async fn encode(&self, route: &str, body: serde_json::Value) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(format!("{}/encode/{route}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| CorpusError::external(SERVICE, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CorpusError::external(
                SERVICE,
                format!("/encode/{route} returned {status}"),
            ));
        }
        let parsed: EncodeResponse = response
            .json()
            .await
            .map_err(|e| CorpusError::external(SERVICE, format!("invalid response: {e}")))?;
        check_dimension(parsed.embedding, self.dimension)
    }
}

fn check_dimension(vector: Vec<f32>, expected: usize) -> Result<Vec<f32>> {
    if vector.len() == expected {
        Ok(vector)
    } else {
        Err(CorpusError::external(
            SERVICE,
            format!("expected a {expected}-d vector, got {}", vector.len()),
        ))
    }
}

#[async_trait]
impl Encoder for HttpEncoder {
    #[instrument(skip(self))]
    async fn text_encode(&self, text: &str) -> Result<Vec<f32>> {
        self.encode("text", json!({ "text": text })).await
    }

    #[instrument(skip(self))]
    async fn image_encode(&self, image: &Path) -> Result<Vec<f32>> {
        self.encode("image", json!({ "path": image.to_string_lossy() }))
            .await
    }
}
