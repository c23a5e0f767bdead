//! In-process store. Every operation runs under one lock, so each is atomic.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use canon_core::{
    Entity, EntityId, IngestEntry, MappingRecord, MatchType, Nonce, PendingItem, RefCounts,
    StatusReport, Stub, StoredStub, StubId, TrackerCounts, WorkKind,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    check_commit, diff_mappings, DirtyTracker, EntityStore, IngestQueue, MappingDiff,
    MappingTable, Store, StoreError, StubClaim, StubStore,
};

#[derive(Debug, Clone)]
struct MappingRow {
    anchor: StubId,
    record: MappingRecord,
}

#[derive(Debug, Clone)]
struct TrackerRow {
    dirty: bool,
    nonce: Nonce,
    seq: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    entities: HashMap<EntityId, Entity>,
    iris: HashMap<String, EntityId>,
    default_anchors: HashMap<EntityId, StubId>,
    mappings: Vec<MappingRow>,
    stubs: HashMap<StubId, StoredStub>,
    tracker: HashMap<(Uuid, WorkKind), TrackerRow>,
    tracker_seq: u64,
    ingest: Vec<IngestEntry>,
}

impl MemoryState {
    fn ref_counts(&self, stub: &Stub) -> RefCounts {
        let tag = stub.id.to_string();
        let inbound = self
            .stubs
            .values()
            .filter(|other| other.stub.id != stub.id && other.stub.tags.contains(&tag))
            .count() as u32;
        let structural_in = self
            .stubs
            .values()
            .filter(|other| other.stub.id != stub.id && other.stub.structural_refs.contains(&stub.id))
            .count() as u32;
        RefCounts::compute(
            inbound,
            stub.outbound(),
            stub.structural_refs.len() as u32 + structural_in,
            stub.score,
        )
    }

    fn mark_dirty(&mut self, id: Uuid, kind: WorkKind) -> Nonce {
        self.tracker_seq += 1;
        let nonce = Nonce::generate();
        self.tracker.insert(
            (id, kind),
            TrackerRow {
                dirty: true,
                nonce: nonce.clone(),
                seq: self.tracker_seq,
            },
        );
        nonce
    }
}

/// Store backed by process memory; used for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn put_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut stored = entity.clone();
        let previous = state
            .entities
            .get(&entity.id)
            .map(|p| (p.created_at, p.iris.clone()));
        if let Some((created_at, stale)) = previous {
            stored.created_at = created_at;
            for iri in stale {
                if state.iris.get(&iri) == Some(&entity.id) {
                    state.iris.remove(&iri);
                }
            }
        }
        for iri in &stored.iris {
            state.iris.insert(iri.clone(), stored.id);
        }
        state.entities.insert(stored.id, stored);
        Ok(())
    }

    async fn entity(&self, id: EntityId) -> Result<Option<Entity>, StoreError> {
        Ok(self.state.lock().await.entities.get(&id).cloned())
    }

    async fn entity_by_iri(&self, iri: &str) -> Result<Option<Entity>, StoreError> {
        let state = self.state.lock().await;
        if let Some(id) = canon_core::parse_uuid_urn(iri) {
            if let Some(entity) = state.entities.get(&id) {
                return Ok(Some(entity.clone()));
            }
        }
        Ok(state
            .iris
            .get(iri)
            .and_then(|id| state.entities.get(id))
            .cloned())
    }

    async fn entity_ids(&self) -> Result<Vec<EntityId>, StoreError> {
        let state = self.state.lock().await;
        let mut entities: Vec<&Entity> = state.entities.values().collect();
        entities.sort_by_key(|e| (e.created_at, e.id));
        Ok(entities.into_iter().map(|e| e.id).collect())
    }

    async fn default_anchor(
        &self,
        entity: EntityId,
        candidate: StubId,
    ) -> Result<StubId, StoreError> {
        let mut state = self.state.lock().await;
        Ok(*state.default_anchors.entry(entity).or_insert(candidate))
    }
}

#[async_trait]
impl MappingTable for MemoryStore {
    async fn mappings_for_anchor(&self, anchor: StubId) -> Result<Vec<MappingRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .mappings
            .iter()
            .filter(|row| row.anchor == anchor)
            .map(|row| row.record.clone())
            .collect())
    }

    async fn claims_for(
        &self,
        resource: &str,
        entity: Option<EntityId>,
    ) -> Result<Vec<StubClaim>, StoreError> {
        let state = self.state.lock().await;
        let anchors: BTreeSet<StubId> = state
            .mappings
            .iter()
            .filter(|row| row.record.match_type == MatchType::ExactMatch)
            .filter(|row| {
                row.record.resource == resource
                    || (entity.is_some() && row.record.resource_entity == entity)
            })
            .map(|row| row.anchor)
            .collect();
        Ok(anchors
            .into_iter()
            .map(|stub| StubClaim {
                stub,
                created_at: state.stubs.get(&stub).map(|s| s.created_at),
            })
            .collect())
    }

    async fn anchor_of_entity(&self, entity: EntityId) -> Result<Option<StubId>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .mappings
            .iter()
            .find(|row| {
                !row.record.local
                    && row.record.match_type == MatchType::ExactMatch
                    && row.record.resource_entity == Some(entity)
                    && row.record.related_entity == Some(entity)
            })
            .map(|row| row.anchor))
    }

    async fn apply_mappings(
        &self,
        anchor: StubId,
        previous: Option<StubId>,
        related: EntityId,
        records: &[MappingRecord],
    ) -> Result<MappingDiff, StoreError> {
        check_commit(related, records)?;
        let mut state = self.state.lock().await;
        let in_scope = |row: &MappingRow| {
            !row.record.local
                && row.record.related_entity == Some(related)
                && (row.anchor == anchor || Some(row.anchor) == previous)
        };
        let existing: Vec<(usize, StubId, MappingRecord)> = state
            .mappings
            .iter()
            .enumerate()
            .filter(|(_, row)| in_scope(row))
            .map(|(i, row)| (i, row.anchor, row.record.clone()))
            .collect();
        let desired: Vec<(StubId, MappingRecord)> =
            records.iter().map(|r| (anchor, r.clone())).collect();
        let (delete, insert) = diff_mappings(&existing, &desired);
        let doomed: BTreeSet<usize> = delete.iter().copied().collect();
        let mut index = 0usize;
        state.mappings.retain(|_| {
            let keep = !doomed.contains(&index);
            index += 1;
            keep
        });
        for (anchor, record) in &insert {
            state.mappings.push(MappingRow {
                anchor: *anchor,
                record: record.clone(),
            });
        }
        Ok(MappingDiff {
            inserted: insert.len(),
            deleted: delete.len(),
        })
    }

    async fn map_resource(
        &self,
        anchor: StubId,
        source: &str,
        local: bool,
        records: &[MappingRecord],
    ) -> Result<MappingDiff, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.mappings.len();
        state.mappings.retain(|row| {
            !(row.anchor == anchor && row.record.source == source && row.record.local == local)
        });
        let deleted = before - state.mappings.len();
        for record in records {
            let mut record = record.clone();
            record.source = source.to_string();
            record.local = local;
            state.mappings.push(MappingRow { anchor, record });
        }
        Ok(MappingDiff {
            inserted: records.len(),
            deleted,
        })
    }

    async fn remove_entity_mappings(
        &self,
        anchor: StubId,
        related: EntityId,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.mappings.len();
        state
            .mappings
            .retain(|row| !(row.anchor == anchor && row.record.related_entity == Some(related)));
        Ok(before - state.mappings.len())
    }

    async fn remove_mapping(&self, anchor: StubId, resource: &str) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.mappings.len();
        state
            .mappings
            .retain(|row| !(row.anchor == anchor && row.record.resource == resource));
        Ok(before - state.mappings.len())
    }
}

#[async_trait]
impl StubStore for MemoryStore {
    async fn put_stub(&self, stub: &Stub) -> Result<StoredStub, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut stub = stub.clone();
        stub.refs = state.ref_counts(&stub);
        let created_at = state
            .stubs
            .get(&stub.id)
            .map(|s| s.created_at)
            .unwrap_or(now);
        let stored = StoredStub {
            stub,
            created_at,
            updated_at: now,
        };
        state.stubs.insert(stored.stub.id, stored.clone());
        Ok(stored)
    }

    async fn stub(&self, id: StubId) -> Result<Option<StoredStub>, StoreError> {
        Ok(self.state.lock().await.stubs.get(&id).cloned())
    }

    async fn delete_stub(&self, id: StubId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state
            .mappings
            .retain(|row| row.anchor != id || row.record.related_entity.is_none());
        state.tracker.remove(&(id, WorkKind::Stub));
        Ok(state.stubs.remove(&id).is_some())
    }

    async fn refresh_ref_counts(&self, id: StubId) -> Result<Option<RefCounts>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.stubs.get(&id) else {
            return Ok(None);
        };
        let counts = state.ref_counts(&stored.stub);
        if let Some(stored) = state.stubs.get_mut(&id) {
            stored.stub.refs = counts;
        }
        Ok(Some(counts))
    }

    async fn stub_ids(&self) -> Result<Vec<StubId>, StoreError> {
        let state = self.state.lock().await;
        let mut ids: Vec<StubId> = state.stubs.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl DirtyTracker for MemoryStore {
    async fn mark_dirty(&self, id: Uuid, kind: WorkKind) -> Result<Nonce, StoreError> {
        Ok(self.state.lock().await.mark_dirty(id, kind))
    }

    async fn mark_clean(
        &self,
        id: Uuid,
        kind: WorkKind,
        nonce: &Nonce,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.tracker.get_mut(&(id, kind)) {
            Some(row) if row.dirty && &row.nonce == nonce => {
                row.dirty = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending(
        &self,
        kind: Option<WorkKind>,
        limit: usize,
    ) -> Result<Vec<PendingItem>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<(&(Uuid, WorkKind), &TrackerRow)> = state
            .tracker
            .iter()
            .filter(|((_, k), row)| row.dirty && kind.map_or(true, |want| *k == want))
            .collect();
        rows.sort_by_key(|(_, row)| row.seq);
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|((id, kind), row)| PendingItem {
                id: *id,
                kind: *kind,
                nonce: row.nonce.clone(),
            })
            .collect())
    }

    async fn is_dirty(&self, id: Uuid, kind: WorkKind) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tracker
            .get(&(id, kind))
            .map(|row| row.dirty)
            .unwrap_or(false))
    }

    async fn reset(&self, kind: WorkKind) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut ids: Vec<Uuid> = match kind {
            WorkKind::Entity => state.entities.keys().copied().collect(),
            WorkKind::Stub | WorkKind::Index => state.stubs.keys().copied().collect(),
        };
        ids.sort();
        for id in &ids {
            state.mark_dirty(*id, kind);
        }
        Ok(ids.len() as u64)
    }
}

#[async_trait]
impl IngestQueue for MemoryStore {
    async fn queue_ingest(&self, entry: &IngestEntry, always: bool) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .ingest
            .iter_mut()
            .find(|e| e.anchor == entry.anchor && e.uri == entry.uri)
        {
            if !always {
                return Ok(false);
            }
            *existing = entry.clone();
            return Ok(true);
        }
        state.ingest.push(entry.clone());
        Ok(true)
    }

    async fn next_ingest_anchor(&self, now: DateTime<Utc>) -> Result<Option<Uuid>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .ingest
            .iter()
            .filter(|e| e.scheduled_at <= now)
            .min_by_key(|e| (e.scheduled_at, e.anchor))
            .map(|e| e.anchor))
    }

    async fn ingest_entries(
        &self,
        anchor: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<IngestEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .ingest
            .iter()
            .filter(|e| e.anchor == anchor && e.scheduled_at <= now)
            .cloned()
            .collect())
    }

    async fn ingest_entries_for_uri(
        &self,
        uri: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<IngestEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .ingest
            .iter()
            .filter(|e| e.uri == uri && e.scheduled_at <= now)
            .cloned()
            .collect())
    }

    async fn remove_ingest(&self, anchor: Uuid, uri: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.ingest.retain(|e| !(e.anchor == anchor && e.uri == uri));
        Ok(())
    }

    async fn delay_ingest(
        &self,
        anchor: Uuid,
        uri: &str,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for entry in state
            .ingest
            .iter_mut()
            .filter(|e| e.anchor == anchor && e.uri == uri)
        {
            entry.scheduled_at = until;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn status(&self) -> Result<StatusReport, StoreError> {
        let state = self.state.lock().await;
        let mut tracker: BTreeMap<String, TrackerCounts> = BTreeMap::new();
        for ((_, kind), row) in &state.tracker {
            let counts = tracker.entry(kind.as_str().to_string()).or_default();
            if row.dirty {
                counts.dirty += 1;
            } else {
                counts.clean += 1;
            }
        }
        let mut entities: BTreeMap<String, u64> = BTreeMap::new();
        for entity in state.entities.values() {
            *entities.entry(entity.kind.as_str().to_string()).or_default() += 1;
        }
        let mut stubs: BTreeMap<String, u64> = BTreeMap::new();
        for stored in state.stubs.values() {
            *stubs.entry(stored.stub.kind.as_str().to_string()).or_default() += 1;
        }
        let anchors: BTreeSet<Uuid> = state.ingest.iter().map(|e| e.anchor).collect();
        Ok(StatusReport {
            tracker,
            entities,
            stubs,
            indexed_documents: 0,
            ingest_pending: state.ingest.len() as u64,
            ingest_anchors: anchors.len() as u64,
        })
    }
}
