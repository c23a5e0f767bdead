use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use canon_core::{Entity, EntityDocument, IngestCallback, WorkKind};
use canon_storage::{DocumentArchive, DocumentSource, Store};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::EngineError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestRunSummary {
    pub fetched: usize,
    pub failed: usize,
}

/// Fetches entity documents, archives the raw bytes, and stores the entities.
pub struct Ingestor {
    store: Arc<dyn Store>,
    source: Arc<dyn DocumentSource>,
    archive: DocumentArchive,
    retry_delay: Duration,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn DocumentSource>,
        archive: DocumentArchive,
    ) -> Self {
        Self {
            store,
            source,
            archive,
            retry_delay: Duration::from_secs(600),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Fetch `uri` and upsert the entity it describes, marking it for evaluation.
    pub async fn ingest_uri(&self, uri: &str, canonical: Option<&str>) -> Result<Entity, EngineError> {
        self.ingest_inner(uri, canonical)
            .instrument(info_span!("ingest", uri))
            .await
    }

    async fn ingest_inner(&self, uri: &str, canonical: Option<&str>) -> Result<Entity, EngineError> {
        let store = self.store.as_ref();
        let fetched = self.source.fetch(uri).await?;
        let archived = self
            .archive
            .store(&fetched)
            .await
            .map_err(|err| EngineError::Archive(format!("{err:#}")))?;
        let document = EntityDocument::parse(&fetched.body)?;

        let mut known = None;
        for iri in canonical
            .into_iter()
            .chain([uri])
            .chain(document.iris.iter().map(String::as_str))
        {
            if let Some(existing) = store.entity_by_iri(iri).await? {
                known = Some(existing.id);
                break;
            }
        }
        let id = known.unwrap_or_else(Uuid::new_v4);
        let mut entity = document.into_entity(id, Some(uri), store.now());
        if let Some(canonical) = canonical {
            if !entity.iris.iter().any(|i| i == canonical) {
                entity.iris.insert(0, canonical.to_string());
            }
        }
        store.put_entity(&entity).await?;
        store.mark_dirty(entity.id, WorkKind::Entity).await?;
        info!(
            entity = %entity.id,
            kind = %entity.kind,
            archived = %archived.relative_path.display(),
            deduplicated = archived.deduplicated,
            "entity ingested"
        );
        Ok(entity)
    }

    /// Drain the due entries of the earliest queued anchor; `None` when nothing is due.
    pub async fn run_queue_once(&self) -> Result<Option<IngestRunSummary>, EngineError> {
        let store = self.store.as_ref();
        let now = store.now();
        let Some(anchor) = store.next_ingest_anchor(now).await? else {
            return Ok(None);
        };
        let entries = store.ingest_entries(anchor, now).await?;
        let uris: BTreeSet<String> = entries.into_iter().map(|e| e.uri).collect();
        let mut summary = IngestRunSummary::default();

        for uri in uris {
            let pending = store.ingest_entries_for_uri(&uri, now).await?;
            match self.ingest_uri(&uri, None).await {
                Ok(entity) => {
                    let mut callback = IngestCallback::default();
                    for entry in &pending {
                        callback.merge(&entry.callback);
                    }
                    if callback.evaluate {
                        store.mark_dirty(entity.id, WorkKind::Entity).await?;
                    }
                    for id in &callback.reevaluate {
                        store.mark_dirty(*id, WorkKind::Entity).await?;
                    }
                    for id in &callback.regenerate {
                        store.mark_dirty(*id, WorkKind::Stub).await?;
                    }
                    for entry in &pending {
                        store.remove_ingest(entry.anchor, &entry.uri).await?;
                    }
                    summary.fetched += 1;
                }
                Err(err @ EngineError::Store(_)) => return Err(err),
                Err(err) => {
                    let until = now
                        + chrono::Duration::from_std(self.retry_delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(600));
                    warn!(%uri, error = %err, %until, "ingest failed; rescheduling");
                    for entry in &pending {
                        store.delay_ingest(entry.anchor, &entry.uri, until).await?;
                    }
                    summary.failed += 1;
                }
            }
        }
        Ok(Some(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canon_core::IngestEntry;
    use canon_storage::{DirtyTracker, EntityStore, FixtureSource, IngestQueue, MemoryStore};
    use tempfile::tempdir;

    const BIG_BEN: &str = r#"{
        "iris": ["http://dbpedia.org/resource/Big_Ben"],
        "kind": "place",
        "literals": {"http://www.w3.org/2000/01/rdf-schema#label": ["Big Ben"]}
    }"#;

    fn ingestor(store: &Arc<MemoryStore>, fixtures: FixtureSource) -> (Ingestor, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let ingestor = Ingestor::new(
            store.clone(),
            Arc::new(fixtures),
            DocumentArchive::new(dir.path()),
        );
        (ingestor, dir)
    }

    #[tokio::test]
    async fn ingest_upserts_by_identifier() {
        let store = Arc::new(MemoryStore::new());
        let fixtures = FixtureSource::new();
        fixtures
            .insert("http://dbpedia.org/resource/Big_Ben", BIG_BEN)
            .await;
        let (ingestor, _dir) = ingestor(&store, fixtures);

        let first = ingestor
            .ingest_uri("http://dbpedia.org/resource/Big_Ben", Some("http://example.org/big-ben"))
            .await
            .expect("ingest");
        let second = ingestor
            .ingest_uri("http://dbpedia.org/resource/Big_Ben", None)
            .await
            .expect("again");
        assert_eq!(first.id, second.id);
        assert_eq!(first.iris[0], "http://example.org/big-ben");
        assert_eq!(first.label(), Some("Big Ben"));
        assert!(store.is_dirty(first.id, WorkKind::Entity).await.expect("dirty"));
        assert_eq!(store.entity_ids().await.expect("ids").len(), 1);
    }

    #[tokio::test]
    async fn queue_run_applies_callbacks_and_clears_entries() {
        let store = Arc::new(MemoryStore::new());
        let fixtures = FixtureSource::new();
        fixtures
            .insert("http://dbpedia.org/resource/Big_Ben", BIG_BEN)
            .await;
        let (ingestor, _dir) = ingestor(&store, fixtures);

        let requester = Uuid::new_v4();
        let stub = Uuid::new_v4();
        let entry = IngestEntry {
            anchor: requester,
            uri: "http://dbpedia.org/resource/Big_Ben".to_string(),
            scheduled_at: store.now(),
            callback: IngestCallback {
                reevaluate: BTreeSet::from([requester]),
                regenerate: BTreeSet::from([stub]),
                ..IngestCallback::default()
            },
        };
        assert!(store.queue_ingest(&entry, false).await.expect("queue"));
        assert!(!store.queue_ingest(&entry, false).await.expect("dup"));

        let summary = ingestor.run_queue_once().await.expect("run").expect("due");
        assert_eq!(summary, IngestRunSummary { fetched: 1, failed: 0 });
        assert!(store.is_dirty(requester, WorkKind::Entity).await.expect("dirty"));
        assert!(store.is_dirty(stub, WorkKind::Stub).await.expect("dirty"));
        assert!(ingestor.run_queue_once().await.expect("run").is_none());
    }

    #[tokio::test]
    async fn failed_fetch_is_delayed_not_dropped() {
        let store = Arc::new(MemoryStore::new());
        let (ingestor, _dir) = ingestor(&store, FixtureSource::new());
        let entry = IngestEntry {
            anchor: Uuid::new_v4(),
            uri: "http://dbpedia.org/resource/Missing".to_string(),
            scheduled_at: store.now(),
            callback: IngestCallback::default(),
        };
        store.queue_ingest(&entry, false).await.expect("queue");

        let summary = ingestor.run_queue_once().await.expect("run").expect("due");
        assert_eq!(summary.failed, 1);
        assert!(ingestor.run_queue_once().await.expect("run").is_none());
        let later = store.now() + chrono::Duration::seconds(601);
        assert_eq!(
            store
                .ingest_entries(entry.anchor, later)
                .await
                .expect("entries")
                .len(),
            1
        );
    }
}
