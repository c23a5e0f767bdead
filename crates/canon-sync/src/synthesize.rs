use std::collections::BTreeSet;
use std::sync::Arc;

use canon_core::{EntityId, MatchType, Stub, StubId, WorkKind};
use canon_plugins::{GenerateContext, Generator, MatchedSet};
use canon_storage::{ExpansionPolicy, IndexedDocument, SearchIndex, Store};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::EngineError;

#[derive(Debug, Clone, PartialEq)]
pub enum Generated {
    Persisted { stub: Stub, created: bool },
    Deleted { existed: bool },
}

/// Refreshes counters and keeps the search document of one stub current.
#[derive(Clone)]
pub struct Indexer {
    store: Arc<dyn Store>,
    index: Arc<dyn SearchIndex>,
}

impl Indexer {
    pub fn new(store: Arc<dyn Store>, index: Arc<dyn SearchIndex>) -> Self {
        Self { store, index }
    }

    /// Returns whether a document is now present for `id`.
    pub async fn index(&self, id: StubId) -> Result<bool, EngineError> {
        if self.store.refresh_ref_counts(id).await?.is_none() {
            self.index.delete_document(id).await?;
            return Ok(false);
        }
        let Some(stored) = self.store.stub(id).await? else {
            self.index.delete_document(id).await?;
            return Ok(false);
        };
        let stub = stored.stub;
        if stub.title.is_none() {
            warn!(stub = %id, "stub has no title; not indexed");
            self.index.delete_document(id).await?;
            return Ok(false);
        }
        let document = IndexedDocument {
            id,
            kind: stub.kind,
            visible: stub.visible,
            parent: stub.parent,
            tags: stub.tags.iter().cloned().collect(),
            full_text: stub.full_text.clone(),
        };
        self.index.index_document(&document).await?;
        debug!(stub = %id, kind = %stub.kind, "stub indexed");
        Ok(true)
    }

    pub async fn commit(&self) -> Result<(), EngineError> {
        self.index.commit().await?;
        Ok(())
    }
}

/// Runs generators over an anchor's mapping set and persists the stub.
pub struct SynthesisEngine {
    store: Arc<dyn Store>,
    indexer: Indexer,
    generators: Vec<Box<dyn Generator>>,
    policy: ExpansionPolicy,
}

impl SynthesisEngine {
    pub fn new(
        store: Arc<dyn Store>,
        indexer: Indexer,
        generators: Vec<Box<dyn Generator>>,
        policy: ExpansionPolicy,
    ) -> Self {
        Self {
            store,
            indexer,
            generators,
            policy,
        }
    }

    /// Regenerate `anchor`; with `defer_index` the search update is queued instead.
    pub async fn generate(&self, anchor: StubId, defer_index: bool) -> Result<Generated, EngineError> {
        self.generate_inner(anchor, defer_index)
            .instrument(info_span!("generate", stub = %anchor))
            .await
    }

    async fn generate_inner(&self, anchor: StubId, defer_index: bool) -> Result<Generated, EngineError> {
        let store = self.store.as_ref();
        let records = store.mappings_for_anchor(anchor).await?;
        let matched = MatchedSet::load(store, records).await?;
        let members: Vec<EntityId> = matched
            .members(&self.policy.transient_sources)
            .iter()
            .filter_map(|m| m.record.resource_entity)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if members.is_empty() {
            let existed = store.delete_stub(anchor).await?;
            self.indexer.index.delete_document(anchor).await?;
            if existed {
                info!("stub has no remaining members; deleted");
            }
            return Ok(Generated::Deleted { existed });
        }

        let ctx = GenerateContext {
            store,
            policy: &self.policy,
        };
        let mut stub = Stub::draft(anchor);
        for generator in &self.generators {
            generator.generate(&ctx, &matched, &mut stub).await?;
        }
        stub.normalize_references();
        if stub.title.is_none() {
            warn!("synthesized stub has no title");
        }

        let created = store.stub(anchor).await?.is_none();
        let stored = store.put_stub(&stub).await?;

        if created {
            let mut followers: BTreeSet<EntityId> = members.iter().copied().collect();
            followers.extend(
                matched
                    .of_type(MatchType::ExactMatch)
                    .iter()
                    .filter_map(|m| m.entity.as_ref().map(|e| e.id)),
            );
            for entity in followers {
                store.mark_dirty(entity, WorkKind::Entity).await?;
            }
        }
        for related in &stored.stub.related_stubs {
            store.mark_dirty(*related, WorkKind::Index).await?;
        }
        if defer_index {
            store.mark_dirty(anchor, WorkKind::Index).await?;
        } else {
            self.indexer.index(anchor).await?;
        }
        info!(kind = %stored.stub.kind, members = members.len(), created, "stub generated");
        Ok(Generated::Persisted {
            stub: stored.stub,
            created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canon_core::{default_anchor_for, vocab, Entity, EntityKind, StubKind};
    use canon_plugins::{generator_for_name, DEFAULT_GENERATORS};
    use canon_storage::{
        DirtyTracker, EntityStore, MappingStore, MappingTable, MemoryIndex, MemoryStore, StubStore,
    };

    fn synthesis(store: &Arc<MemoryStore>, index: &Arc<MemoryIndex>) -> SynthesisEngine {
        let generators = DEFAULT_GENERATORS
            .iter()
            .filter_map(|name| generator_for_name(name))
            .collect();
        SynthesisEngine::new(
            store.clone(),
            Indexer::new(store.clone(), index.clone()),
            generators,
            ExpansionPolicy::default(),
        )
    }

    async fn anchored(store: &MemoryStore, entity: &Entity) -> StubId {
        store.put_entity(entity).await.expect("put");
        let anchor = default_anchor_for(entity.id);
        MappingStore::for_entity(entity)
            .commit(store, anchor, None)
            .await
            .expect("commit");
        anchor
    }

    #[tokio::test]
    async fn generates_indexes_and_marks_members_on_first_persist() {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryIndex::new());
        let tower = Entity::new(EntityKind::Place, "http://a.example/big_ben")
            .with_literal(vocab::RDFS_LABEL, "Big Ben");
        let anchor = anchored(&store, &tower).await;

        let generated = synthesis(&store, &index)
            .generate(anchor, false)
            .await
            .expect("generate");
        let Generated::Persisted { stub, created } = generated else {
            panic!("expected a persisted stub");
        };
        assert!(created);
        assert_eq!(stub.kind, StubKind::Place);
        assert_eq!(stub.title.as_deref(), Some("Big Ben"));
        assert_eq!(stub.refs.adjusted, 0);
        assert!(index.document(anchor).await.is_some());
        assert!(store.is_dirty(tower.id, WorkKind::Entity).await.expect("dirty"));
    }

    #[tokio::test]
    async fn deferred_indexing_marks_index_work() {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryIndex::new());
        let tower = Entity::new(EntityKind::Place, "http://a.example/big_ben")
            .with_literal(vocab::RDFS_LABEL, "Big Ben");
        let anchor = anchored(&store, &tower).await;
        synthesis(&store, &index)
            .generate(anchor, true)
            .await
            .expect("generate");
        assert!(index.document(anchor).await.is_none());
        assert!(store.is_dirty(anchor, WorkKind::Index).await.expect("dirty"));
    }

    #[tokio::test]
    async fn regeneration_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryIndex::new());
        let tower = Entity::new(EntityKind::Place, "http://a.example/big_ben")
            .with_literal(vocab::RDFS_LABEL, "Big Ben")
            .with_literal(vocab::RDFS_COMMENT, "Clock tower");
        let anchor = anchored(&store, &tower).await;
        let engine = synthesis(&store, &index);
        engine.generate(anchor, false).await.expect("first");
        let first = store.stub(anchor).await.expect("read").expect("stub").stub;
        engine.generate(anchor, false).await.expect("second");
        let second = store.stub(anchor).await.expect("read").expect("stub").stub;
        assert_eq!(
            serde_json::to_vec(&first).expect("json"),
            serde_json::to_vec(&second).expect("json")
        );
    }

    #[tokio::test]
    async fn stub_without_members_is_deleted() {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryIndex::new());
        let tower = Entity::new(EntityKind::Place, "http://a.example/big_ben")
            .with_literal(vocab::RDFS_LABEL, "Big Ben");
        let anchor = anchored(&store, &tower).await;
        let engine = synthesis(&store, &index);
        engine.generate(anchor, false).await.expect("generate");

        store
            .remove_entity_mappings(anchor, tower.id)
            .await
            .expect("remove");
        let generated = engine.generate(anchor, false).await.expect("regenerate");
        assert_eq!(generated, Generated::Deleted { existed: true });
        assert!(store.stub(anchor).await.expect("read").is_none());
        assert!(index.document(anchor).await.is_none());
    }
}
