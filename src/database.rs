use crate::error::{RagError, Result};
use anyhow::Context;
use async_trait::async_trait;
use log::{debug, info};
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder, Distance, FieldType,
    Filter, PointStruct, ScoredPoint, SearchPointsBuilder, UpsertPointsBuilder, Value,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use std::env;

/// Default collection name when `QDRANT_COLLECTION` is unset
pub const DEFAULT_COLLECTION: &str = "rag-chatbot";

const CONTENT_KEY: &str = "content";
const URL_KEY: &str = "url";

/// A chunk ready to be written to the index
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    /// Unique point id (UUID v4)
    pub id: String,
    pub vector: Vec<f32>,
    /// The chunk text
    pub content: String,
    /// URL of the page the chunk came from
    pub url: String,
}

/// A chunk returned by a similarity query
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub content: String,
    pub url: String,
    pub score: f32,
}

/// Nearest-neighbour store for chunk embeddings
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Write records to the index
    async fn upsert(&self, records: Vec<ChunkRecord>) -> Result<()>;

    /// Return up to `top_k` chunks from `url`, most similar first
    async fn query(&self, vector: Vec<f32>, url: &str, top_k: u64) -> Result<Vec<RetrievedChunk>>;
}

/// Configuration for Qdrant
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
}

impl QdrantConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let url = env::var("QDRANT_URL").context("QDRANT_URL is not set")?;
        let api_key = env::var("QDRANT_API_KEY").ok().filter(|k| !k.is_empty());
        let collection =
            env::var("QDRANT_COLLECTION").unwrap_or_else(|_| DEFAULT_COLLECTION.to_string());

        Ok(QdrantConfig {
            url,
            api_key,
            collection,
        })
    }
}

/// Client for interacting with Qdrant
pub struct QdrantClient {
    client: Qdrant,
    collection: String,
}

impl QdrantClient {
    /// Create a new Qdrant client
    pub fn new(config: QdrantConfig) -> anyhow::Result<Self> {
        let config_builder = Qdrant::from_url(&config.url);
        let config_builder = if let Some(api_key) = config.api_key {
            config_builder.api_key(api_key)
        } else {
            config_builder
        };

        let client = config_builder
            .build()
            .with_context(|| format!("Failed to connect to Qdrant at {}", config.url))?;

        Ok(QdrantClient {
            client,
            collection: config.collection,
        })
    }

    /// Name of the collection this client reads and writes
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Create the collection and its `url` payload index unless the collection already exists
    pub async fn ensure_collection(&self, dimension: usize) -> anyhow::Result<()> {
        if self
            .client
            .collection_exists(self.collection.clone())
            .await
            .with_context(|| format!("Failed to check collection {}", self.collection))?
        {
            info!("Using existing collection: {}", self.collection);
            return Ok(());
        }

        info!(
            "Creating collection {} ({} dimensions, cosine)",
            self.collection, dimension
        );

        self.client
            .create_collection(
                CreateCollectionBuilder::new(self.collection.clone()).vectors_config(
                    VectorParamsBuilder::new(dimension as u64, Distance::Cosine),
                ),
            )
            .await
            .with_context(|| format!("Failed to create collection {}", self.collection))?;

        self.client
            .create_field_index(CreateFieldIndexCollectionBuilder::new(
                self.collection.clone(),
                URL_KEY,
                FieldType::Keyword,
            ))
            .await
            .with_context(|| format!("Failed to index `url` in {}", self.collection))?;

        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantClient {
    async fn upsert(&self, records: Vec<ChunkRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let count = records.len();
        let points: Vec<PointStruct> = records.into_iter().map(to_point).collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(self.collection.clone(), points).wait(true))
            .await
            .map_err(|e| RagError::IndexWrite(e.to_string()))?;

        debug!("Upserted {} points into {}", count, self.collection);
        Ok(())
    }

    async fn query(&self, vector: Vec<f32>, url: &str, top_k: u64) -> Result<Vec<RetrievedChunk>> {
        let request = SearchPointsBuilder::new(self.collection.clone(), vector, top_k)
            .filter(url_filter(url))
            .with_payload(true);

        let response = self
            .client
            .search_points(request)
            .await
            .map_err(|e| RagError::IndexQuery(e.to_string()))?;

        let chunks = response
            .result
            .into_iter()
            .filter_map(|point| from_scored_point(point, url))
            .collect();

        Ok(chunks)
    }
}

/// Build a point whose payload carries the chunk text and its source URL
fn to_point(record: ChunkRecord) -> PointStruct {
    let payload: HashMap<String, Value> = HashMap::from([
        (CONTENT_KEY.to_string(), Value::from(record.content)),
        (URL_KEY.to_string(), Value::from(record.url)),
    ]);

    PointStruct::new(record.id, record.vector, payload)
}

/// Exact match on the `url` payload field
fn url_filter(url: &str) -> Filter {
    Filter::must([Condition::matches(URL_KEY, url.to_string())])
}

/// Points without a text payload are skipped
fn from_scored_point(point: ScoredPoint, queried_url: &str) -> Option<RetrievedChunk> {
    let content = point.payload.get(CONTENT_KEY)?.as_str()?.to_string();
    let url = point
        .payload
        .get(URL_KEY)
        .and_then(|v| v.as_str())
        .cloned()
        .unwrap_or_else(|| queried_url.to_string());

    Some(RetrievedChunk {
        content,
        url,
        score: point.score,
    })
}
