//! ============================================================================
//! Qdrant Index - Knowledge chunks in a Qdrant collection
//! ============================================================================
//! Self-hosted alternative to Pinecone. Payload fields mirror the Pinecone
//! metadata (`fileName`, `text`, `chunk`), so search results look the same
//! whichever backend is configured.
//! ============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    value::Kind, vectors_config, CollectionInfo, Condition, CreateCollectionBuilder, Distance,
    Filter, ListValue, PointStruct, SearchPointsBuilder, Struct, UpsertPointsBuilder, Value,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::{Map, Number};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{SimilarityMatch, VectorQuery, VectorRecord, FILE_NAME_FIELD};
use super::vector::VectorIndex;
use crate::error::{MemoryError, Result};

/// Qdrant-backed vector index
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    dimensions: usize,
}

impl QdrantIndex {
    /// Connect to Qdrant and make sure the collection exists with vectors of
    /// length `dimensions`
    pub async fn new(
        url: &str,
        api_key: Option<&str>,
        collection: &str,
        dimensions: usize,
    ) -> Result<Self> {
        debug!("Connecting to Qdrant at {}", url);

        let mut builder = Qdrant::from_url(url);
        if let Some(key) = api_key {
            builder = builder.api_key(key.to_string());
        }
        let client = builder
            .build()
            .map_err(|e| qdrant_err("create Qdrant client", e))?;

        let index = Self {
            client,
            collection: collection.to_string(),
            dimensions,
        };
        index.ensure_collection().await?;
        Ok(index)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| qdrant_err("check collection existence", e))?;

        if !exists {
            info!(
                "Creating collection: {} ({} dimensions)",
                self.collection, self.dimensions
            );
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection).vectors_config(
                        VectorParamsBuilder::new(self.dimensions as u64, Distance::Cosine),
                    ),
                )
                .await
                .map_err(|e| qdrant_err("create collection", e))?;
        } else {
            let info = self
                .client
                .collection_info(&self.collection)
                .await
                .map_err(|e| qdrant_err("read collection info", e))?;
            if let Some(size) = info.result.and_then(vector_size) {
                if size != self.dimensions as u64 {
                    return Err(MemoryError::Config(format!(
                        "Collection {} holds {}-dimension vectors but the embedding model returns {} (set QDRANT_COLLECTION or EMBEDDING_DIMENSIONS)",
                        self.collection, size, self.dimensions
                    )));
                }
            }
            debug!("Collection {} already exists", self.collection);
        }
        Ok(())
    }

    /// Check if Qdrant is reachable
    pub async fn health_check(&self) -> bool {
        match self.client.health_check().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Qdrant health check failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn query(&self, query: &VectorQuery) -> Result<Vec<SimilarityMatch>> {
        let filter = Filter::must([Condition::matches(
            FILE_NAME_FIELD,
            query.file_name.clone(),
        )]);

        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, query.vector.clone(), query.top_k)
                    .filter(filter)
                    .with_payload(true),
            )
            .await
            .map_err(|e| qdrant_err("search knowledge chunks", e))?;

        Ok(response
            .result
            .into_iter()
            .map(|point| SimilarityMatch {
                document: payload_to_json(point.payload),
                score: point.score,
            })
            .collect())
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<usize> {
        let count = records.len();
        if count == 0 {
            return Ok(0);
        }

        let points: Vec<PointStruct> = records
            .into_iter()
            .map(|record| {
                let payload: HashMap<String, Value> = record
                    .metadata
                    .into_iter()
                    .map(|(k, v)| (k, json_to_value(v)))
                    .collect();
                PointStruct::new(point_id(&record.id).to_string(), record.values, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await
            .map_err(|e| qdrant_err("upsert knowledge chunks", e))?;

        debug!("Upserted {} points into {}", count, self.collection);
        Ok(count)
    }

    fn backend_name(&self) -> &'static str {
        "qdrant"
    }
}

/// Vector size of a collection with a single unnamed vector
fn vector_size(info: CollectionInfo) -> Option<u64> {
    match info.config?.params?.vectors_config?.config? {
        vectors_config::Config::Params(params) => Some(params.size),
        vectors_config::Config::ParamsMap(_) => None,
    }
}

fn qdrant_err(action: &str, e: impl std::fmt::Display) -> MemoryError {
    MemoryError::VectorIndex(format!("Failed to {}: {}", action, e))
}

/// Qdrant only accepts UUIDs or integers as ids; derive a stable UUID
fn point_id(record_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, record_id.as_bytes())
}

fn payload_to_json(payload: HashMap<String, Value>) -> Map<String, serde_json::Value> {
    payload
        .into_iter()
        .map(|(k, v)| (k, value_to_json(v)))
        .collect()
}

fn value_to_json(value: Value) -> serde_json::Value {
    match value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::Number(i.into()),
        Some(Kind::DoubleValue(d)) => Number::from_f64(d)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.into_iter().map(value_to_json).collect())
        }
        Some(Kind::StructValue(s)) => serde_json::Value::Object(payload_to_json(s.fields)),
    }
}

fn json_to_value(value: serde_json::Value) -> Value {
    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Kind::IntegerValue(i),
            None => Kind::DoubleValue(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Kind::StringValue(s),
        serde_json::Value::Array(items) => Kind::ListValue(ListValue {
            values: items.into_iter().map(json_to_value).collect(),
        }),
        serde_json::Value::Object(map) => Kind::StructValue(Struct {
            fields: map.into_iter().map(|(k, v)| (k, json_to_value(v))).collect(),
        }),
    };
    Value { kind: Some(kind) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::EMBEDDING_DIM;
    use qdrant_client::qdrant::{CollectionConfig, CollectionParams, VectorParams, VectorsConfig};
    use serde_json::json;

    #[test]
    fn test_payload_json_roundtrip() {
        let original = json!({
            "fileName": "ada.txt",
            "chunk": 2,
            "score": 0.5,
            "tags": ["math", "engines"],
            "extra": {"nested": true, "none": null}
        });
        let back = value_to_json(json_to_value(original.clone()));
        assert_eq!(back, original);
    }

    fn collection_with_size(size: u64) -> CollectionInfo {
        CollectionInfo {
            config: Some(CollectionConfig {
                params: Some(CollectionParams {
                    vectors_config: Some(VectorsConfig {
                        config: Some(vectors_config::Config::Params(VectorParams {
                            size,
                            distance: Distance::Cosine.into(),
                            ..Default::default()
                        })),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_vector_size_from_collection_info() {
        assert_eq!(vector_size(collection_with_size(768)), Some(768));
        assert_eq!(vector_size(CollectionInfo::default()), None);
    }

    #[test]
    fn test_point_id_is_stable() {
        assert_eq!(point_id("ada.txt-0"), point_id("ada.txt-0"));
        assert_ne!(point_id("ada.txt-0"), point_id("ada.txt-1"));
    }

    // Requires a running Qdrant instance
    #[tokio::test]
    #[ignore]
    async fn test_upsert_and_filtered_search() {
        let index = QdrantIndex::new("http://localhost:6334", None, "companion_test", EMBEDDING_DIM)
            .await
            .unwrap();

        let mut metadata = Map::new();
        metadata.insert(FILE_NAME_FIELD.into(), json!("ada.txt"));
        metadata.insert("text".into(), json!("Analytical engine notes"));
        index
            .upsert(vec![VectorRecord {
                id: "ada.txt-0".into(),
                values: vec![0.1; EMBEDDING_DIM],
                metadata,
            }])
            .await
            .unwrap();

        let matches = index
            .query(&VectorQuery {
                vector: vec![0.1; EMBEDDING_DIM],
                top_k: 3,
                file_name: "ada.txt".into(),
            })
            .await
            .unwrap();
        assert!(!matches.is_empty());
        assert_eq!(matches[0].file_name(), Some("ada.txt"));
    }
}
