//! Process-local, read-mostly cache of schema versions for one pipeline.
//!
//! Internal sources resolve to the single latest declared version. External
//! sources resolve through the 5-byte wire envelope: the referenced version
//! is served from the cache, and on a miss it is fetched from the remote
//! registry, compatibility-checked against the current latest, installed as
//! the new latest, and returned. Incompatible versions are never installed.
//!
//! Reads are concurrent; writes on a cache miss take a per-id lock so a burst
//! of records carrying a new schema id produces exactly one remote fetch.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use setl_core::capability::SchemaRegistryRemote;
use setl_core::definition::PipelineDefinition;
use setl_core::schema::{
    extract_schema_id, Schema, SchemaConfigType, SchemaError, SchemaVersion,
};

pub struct SchemaCache {
    pipeline_id: String,
    schemas: DashMap<String, Schema>,
    /// `(source_id, version_id)` → installed version.
    versions: DashMap<(String, u32), Arc<SchemaVersion>>,
    /// Exactly one latest version per source at any time. "Latest" for
    /// external sources means last installed.
    latest: DashMap<String, u32>,
    remote: Option<Arc<dyn SchemaRegistryRemote>>,
    /// Per-schema-id fetch locks; single-flight on miss.
    fetch_locks: DashMap<(String, u32), Arc<tokio::sync::Mutex<()>>>,
}

impl SchemaCache {
    /// Seed the cache from a validated pipeline definition. Cache entries are
    /// populated lazily past this seed and invalidated only at restart.
    pub fn from_definition(
        definition: &PipelineDefinition,
        remote: Option<Arc<dyn SchemaRegistryRemote>>,
    ) -> Self {
        let cache = Self {
            pipeline_id: definition.pipeline_id.clone(),
            schemas: DashMap::new(),
            versions: DashMap::new(),
            latest: DashMap::new(),
            remote,
            fetch_locks: DashMap::new(),
        };

        for topic in &definition.ingestor.topics {
            cache.schemas.insert(
                topic.id.clone(),
                Schema {
                    pipeline_id: definition.pipeline_id.clone(),
                    source_id: topic.id.clone(),
                    config_type: topic.schema_type,
                    data_format: topic.data_format,
                },
            );
        }
        for (source_id, _) in definition.schema_versions.iter() {
            if let Some(version) = definition.schema_version(source_id) {
                cache
                    .versions
                    .insert((source_id.clone(), version.version_id), Arc::new(version.clone()));
                cache.latest.insert(source_id.clone(), version.version_id);
            }
        }
        cache
    }

    pub fn get_schema(&self, source_id: &str) -> Result<Schema, SchemaError> {
        self.schemas
            .get(source_id)
            .map(|s| s.clone())
            .ok_or_else(|| SchemaError::NotFound {
                source_id: source_id.to_string(),
                version_id: None,
            })
    }

    pub fn get_version(
        &self,
        source_id: &str,
        version_id: u32,
    ) -> Result<Arc<SchemaVersion>, SchemaError> {
        self.versions
            .get(&(source_id.to_string(), version_id))
            .map(|v| Arc::clone(&v))
            .ok_or_else(|| SchemaError::NotFound {
                source_id: source_id.to_string(),
                version_id: Some(version_id),
            })
    }

    pub fn latest_version(&self, source_id: &str) -> Result<Arc<SchemaVersion>, SchemaError> {
        let version_id = self
            .latest
            .get(source_id)
            .map(|v| *v)
            .ok_or_else(|| SchemaError::NotFound {
                source_id: source_id.to_string(),
                version_id: None,
            })?;
        self.get_version(source_id, version_id)
    }

    /// Resolve the schema version governing `payload` and return it together
    /// with the record body.
    ///
    /// Internal sources return the latest declared version and the whole
    /// payload. External sources parse the wire envelope and return the body
    /// starting at byte 5; an unknown version id triggers a remote fetch and
    /// install.
    pub async fn resolve_for_record<'a>(
        &self,
        source_id: &str,
        payload: &'a [u8],
    ) -> Result<(Arc<SchemaVersion>, &'a [u8]), SchemaError> {
        let schema = self.get_schema(source_id)?;
        match schema.config_type {
            SchemaConfigType::Internal => {
                let version = self.latest_version(source_id)?;
                Ok((version, payload))
            }
            SchemaConfigType::External => {
                let (schema_id, body) = extract_schema_id(payload)?;
                if let Ok(version) = self.get_version(source_id, schema_id) {
                    return Ok((version, body));
                }
                let version = self.fetch_and_install(source_id, schema_id).await?;
                Ok((version, body))
            }
        }
    }

    async fn fetch_and_install(
        &self,
        source_id: &str,
        schema_id: u32,
    ) -> Result<Arc<SchemaVersion>, SchemaError> {
        let lock = self
            .fetch_locks
            .entry((source_id.to_string(), schema_id))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another waiter may have installed it while we queued on the lock.
        if let Ok(version) = self.get_version(source_id, schema_id) {
            return Ok(version);
        }

        let remote = self.remote.as_ref().ok_or_else(|| SchemaError::NotFound {
            source_id: source_id.to_string(),
            version_id: Some(schema_id),
        })?;

        debug!("fetching schema id {schema_id} for source {source_id}");
        let fields = remote
            .get(schema_id)
            .await?
            .ok_or_else(|| SchemaError::NotFound {
                source_id: source_id.to_string(),
                version_id: Some(schema_id),
            })?;
        if fields.is_empty() {
            return Err(SchemaError::NotFound {
                source_id: source_id.to_string(),
                version_id: Some(schema_id),
            });
        }

        let candidate = SchemaVersion {
            pipeline_id: self.pipeline_id.clone(),
            source_id: source_id.to_string(),
            version_id: schema_id,
            fields,
        };

        // Incompatible versions are rejected, never installed.
        if let Ok(current) = self.latest_version(source_id) {
            current.check_compatible(&candidate)?;
        }

        let installed = Arc::new(candidate);
        self.versions
            .insert((source_id.to_string(), schema_id), Arc::clone(&installed));
        self.latest.insert(source_id.to_string(), schema_id);
        info!(
            "installed schema version {schema_id} as latest for source {source_id}"
        );
        Ok(installed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use setl_core::definition::PipelineDefinition;
    use setl_core::schema::{wrap_schema_id, Field, FieldType};

    use super::*;

    struct FakeRegistry {
        known: Vec<(u32, Vec<Field>)>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl SchemaRegistryRemote for FakeRegistry {
        async fn get(&self, schema_id: u32) -> Result<Option<Vec<Field>>, SchemaError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .known
                .iter()
                .find(|(id, _)| *id == schema_id)
                .map(|(_, fields)| fields.clone()))
        }
    }

    fn external_definition() -> PipelineDefinition {
        PipelineDefinition::from_yaml(
            r#"
pipeline_id: p1
ingestor:
  kafka_connection:
    brokers: localhost:9092
  topics:
    - name: events
      id: events
      consumer_group: g1
      partitions: 1
      schema_type: external
schema_registry:
  url: http://registry.local:8081
sink:
  type: clickhouse
  source_id: events
  table: events
  mapping:
    - column: event_id
      column_type: string
      source_field: event_id
schema_versions: {}
"#,
        )
        .unwrap()
    }

    fn fields_v1() -> Vec<Field> {
        vec![
            Field::new("event_id", FieldType::String),
            Field::new("user_id", FieldType::String),
        ]
    }

    fn fields_v2() -> Vec<Field> {
        let mut fields = fields_v1();
        fields.push(Field::new("email", FieldType::String));
        fields
    }

    #[tokio::test]
    async fn external_miss_fetches_installs_and_serves_from_cache() {
        let registry = Arc::new(FakeRegistry {
            known: vec![(1101, fields_v1())],
            fetches: AtomicUsize::new(0),
        });
        let cache = SchemaCache::from_definition(&external_definition(), Some(registry.clone()));

        let payload = wrap_schema_id(1101, br#"{"event_id":"e1","user_id":"u1"}"#);
        let (version, body) = cache.resolve_for_record("events", &payload).await.unwrap();
        assert_eq!(version.version_id, 1101);
        assert_eq!(body, br#"{"event_id":"e1","user_id":"u1"}"#);

        // Second resolution is a pure cache hit.
        cache.resolve_for_record("events", &payload).await.unwrap();
        assert_eq!(registry.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(cache.latest_version("events").unwrap().version_id, 1101);
    }

    #[tokio::test]
    async fn compatible_successor_becomes_latest() {
        let registry = Arc::new(FakeRegistry {
            known: vec![(1101, fields_v1()), (1102, fields_v2())],
            fetches: AtomicUsize::new(0),
        });
        let cache = SchemaCache::from_definition(&external_definition(), Some(registry));

        let first = wrap_schema_id(1101, b"{}");
        let second = wrap_schema_id(1102, b"{}");
        cache.resolve_for_record("events", &first).await.unwrap();
        cache.resolve_for_record("events", &second).await.unwrap();
        assert_eq!(cache.latest_version("events").unwrap().version_id, 1102);
        // Both versions stay resolvable.
        assert!(cache.get_version("events", 1101).is_ok());
        assert!(cache.get_version("events", 1102).is_ok());
    }

    #[tokio::test]
    async fn incompatible_version_is_never_installed() {
        let incompatible = vec![Field::new("event_id", FieldType::Int64)];
        let registry = Arc::new(FakeRegistry {
            known: vec![(1101, fields_v1()), (1103, incompatible)],
            fetches: AtomicUsize::new(0),
        });
        let cache = SchemaCache::from_definition(&external_definition(), Some(registry));

        cache
            .resolve_for_record("events", &wrap_schema_id(1101, b"{}"))
            .await
            .unwrap();
        let err = cache
            .resolve_for_record("events", &wrap_schema_id(1103, b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::Incompatible { .. }));
        assert!(cache.get_version("events", 1103).is_err());
        assert_eq!(cache.latest_version("events").unwrap().version_id, 1101);
    }

    #[tokio::test]
    async fn unknown_id_is_schema_not_found() {
        let registry = Arc::new(FakeRegistry {
            known: vec![],
            fetches: AtomicUsize::new(0),
        });
        let cache = SchemaCache::from_definition(&external_definition(), Some(registry));

        let err = cache
            .resolve_for_record("events", &wrap_schema_id(1103, b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::NotFound { version_id: Some(1103), .. }));
    }

    #[tokio::test]
    async fn zero_field_version_is_schema_not_found() {
        let registry = Arc::new(FakeRegistry {
            known: vec![(7, Vec::new())],
            fetches: AtomicUsize::new(0),
        });
        let cache = SchemaCache::from_definition(&external_definition(), Some(registry));
        let err = cache
            .resolve_for_record("events", &wrap_schema_id(7, b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::NotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_misses_fetch_once() {
        let registry = Arc::new(FakeRegistry {
            known: vec![(1101, fields_v1())],
            fetches: AtomicUsize::new(0),
        });
        let cache = Arc::new(SchemaCache::from_definition(
            &external_definition(),
            Some(registry.clone()),
        ));

        let payload = Arc::new(wrap_schema_id(1101, b"{}"));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let payload = Arc::clone(&payload);
                tokio::spawn(async move {
                    cache.resolve_for_record("events", &payload).await.map(|_| ())
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(registry.fetches.load(Ordering::SeqCst), 1);
    }
}
