//! Working set of mapping evidence for one evaluation, and its commit to the store.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use canon_core::{
    parse_uuid_urn, vocab, Entity, EntityId, IngestCallback, IngestEntry, MappingRecord,
    MappingSet, MatchType, StubId,
};
use tracing::debug;

use crate::{MappingDiff, Store, StoreError};

/// Bounds and trust rules for following provider-asserted equivalences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionPolicy {
    /// IRI prefixes of providers whose equivalence assertions are followed.
    pub allow_list: Vec<String>,
    pub max_depth: usize,
    pub max_count: usize,
    pub transient_sources: Vec<String>,
}

impl Default for ExpansionPolicy {
    fn default() -> Self {
        Self {
            allow_list: vocab::DEFAULT_EQUIVALENCE_ALLOW_LIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_depth: 3,
            max_count: 64,
            transient_sources: vocab::DEFAULT_TRANSIENT_SOURCES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ExpansionPolicy {
    pub fn allows(&self, iri: &str) -> bool {
        self.allow_list.iter().any(|prefix| iri.starts_with(prefix.as_str()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpansionSummary {
    pub added: usize,
    pub queued: usize,
    /// The depth or count bound stopped expansion early.
    pub truncated: bool,
}

/// Evidence gathered while evaluating one entity, ordered by [`MappingSet`] rules.
#[derive(Debug, Clone)]
pub struct MappingStore {
    related: EntityId,
    set: MappingSet,
    entities: HashMap<String, Entity>,
}

impl MappingStore {
    /// Seeded with the entity itself as an exactMatch.
    pub fn for_entity(entity: &Entity) -> Self {
        let mut store = Self {
            related: entity.id,
            set: MappingSet::new(),
            entities: HashMap::new(),
        };
        store.add_entity(entity, MatchType::ExactMatch, 100);
        store
    }

    pub fn related(&self) -> EntityId {
        self.related
    }

    pub fn add(&mut self, record: MappingRecord) {
        self.set.add(record.with_related(self.related));
    }

    /// One record per resource, sharing source, type, confidence, title and priority.
    pub fn add_resources<'a>(
        &mut self,
        resources: impl IntoIterator<Item = &'a str>,
        source: Option<&str>,
        match_type: MatchType,
        confidence: u8,
        title: Option<&str>,
        priority: u32,
    ) {
        for resource in resources {
            let mut record = MappingRecord::new(resource, match_type, confidence)
                .with_priority(priority)
                .with_title(title.map(str::to_string));
            if let Some(source) = source {
                record.source = source.to_string();
            }
            self.add(record);
        }
    }

    /// Add a record that resolves to `entity`, caching the entity.
    pub fn add_entity(&mut self, entity: &Entity, match_type: MatchType, confidence: u8) {
        self.add(MappingRecord::for_entity(entity, match_type, confidence));
        self.cache(entity);
    }

    fn cache(&mut self, entity: &Entity) {
        for iri in &entity.iris {
            self.entities.insert(iri.clone(), entity.clone());
        }
        self.entities.insert(entity.urn(), entity.clone());
    }

    pub fn set(&self) -> &MappingSet {
        &self.set
    }

    pub fn records(&self) -> impl Iterator<Item = &MappingRecord> {
        self.set.records()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn filter_by_type(&self, match_type: MatchType) -> Vec<&MappingRecord> {
        self.set.filter_by_type(match_type)
    }

    pub fn remove_by_source(&mut self, source: &str, max_priority: u32) -> Vec<MappingRecord> {
        self.set.remove_by_source(source, max_priority)
    }

    pub fn entity_for(&self, record: &MappingRecord) -> Option<&Entity> {
        self.entities.get(&record.resource).or_else(|| {
            record
                .resource_entity
                .and_then(|id| self.entities.get(&canon_core::uuid_urn(id)))
        })
    }

    fn has_resource(&self, resource: &str) -> bool {
        self.records().any(|r| r.resource == resource)
            || self
                .entities
                .get(resource)
                .is_some_and(|e| self.records().any(|r| r.resource_entity == Some(e.id)))
    }

    /// Resolve every record's resource to a stored entity where one exists.
    pub async fn resolve(&mut self, store: &dyn Store) -> Result<(), StoreError> {
        let mut records = std::mem::take(&mut self.set).into_records();
        for record in &mut records {
            if let Some(entity) = self.entity_for(record).cloned() {
                record.resource_entity = Some(entity.id);
                continue;
            }
            if let Some(entity) = store.entity_by_iri(&record.resource).await? {
                record.resource_entity = Some(entity.id);
                self.cache(&entity);
            }
        }
        self.set = MappingSet::from_records(records);
        Ok(())
    }

    /// Follow allow-listed `owl:sameAs` assertions of resolved records.
    ///
    /// Equivalents found locally join with the producing record's type, confidence
    /// and priority; unknown ones are queued for ingest under `anchor` with a
    /// callback that re-evaluates this entity once they arrive.
    pub async fn expand_equivalences(
        &mut self,
        store: &dyn Store,
        policy: &ExpansionPolicy,
        anchor: StubId,
    ) -> Result<ExpansionSummary, StoreError> {
        let mut summary = ExpansionSummary::default();
        let mut work: VecDeque<(MappingRecord, usize)> =
            self.records().cloned().map(|r| (r, 0)).collect();
        let mut visited: HashSet<String> = self.records().map(|r| r.resource.clone()).collect();

        while let Some((record, depth)) = work.pop_front() {
            let Some(entity) = self.entity_for(&record).cloned() else {
                continue;
            };
            for iri in entity.same_as() {
                if !visited.insert(iri.clone()) || !policy.allows(iri) || self.has_resource(iri) {
                    continue;
                }
                if summary.added + summary.queued >= policy.max_count {
                    summary.truncated = true;
                    return Ok(summary);
                }
                match store.entity_by_iri(iri).await? {
                    Some(equivalent) => {
                        let added = MappingRecord::for_entity(
                            &equivalent,
                            record.match_type,
                            record.confidence,
                        )
                        .with_priority(record.priority);
                        self.add(added.clone());
                        self.cache(&equivalent);
                        summary.added += 1;
                        if depth + 1 < policy.max_depth {
                            work.push_back((added, depth + 1));
                        } else if !equivalent.same_as().is_empty() {
                            summary.truncated = true;
                        }
                    }
                    None => {
                        let entry = IngestEntry {
                            anchor,
                            uri: iri.clone(),
                            scheduled_at: store.now(),
                            callback: IngestCallback {
                                reevaluate: BTreeSet::from([self.related]),
                                ..IngestCallback::default()
                            },
                        };
                        store.queue_ingest(&entry, false).await?;
                        self.add(
                            MappingRecord::new(iri.as_str(), record.match_type, record.confidence)
                                .with_priority(record.priority),
                        );
                        summary.queued += 1;
                    }
                }
            }
        }
        debug!(
            related = %self.related,
            added = summary.added,
            queued = summary.queued,
            "equivalences expanded"
        );
        Ok(summary)
    }

    /// Persist the set under `anchor`, replacing this entity's rows there and under `previous`.
    pub async fn commit(
        &self,
        store: &dyn Store,
        anchor: StubId,
        previous: Option<StubId>,
    ) -> Result<MappingDiff, StoreError> {
        let records: Vec<MappingRecord> = self.records().cloned().collect();
        store
            .apply_mappings(anchor, previous.filter(|p| *p != anchor), self.related, &records)
            .await
    }
}

/// Stub currently standing for `iri`: the stub itself, the anchor of the entity
/// it names, or else the earliest stub claiming it as an exactMatch.
pub async fn stub_for_resource(store: &dyn Store, iri: &str) -> Result<Option<StubId>, StoreError> {
    if let Some(id) = parse_uuid_urn(iri) {
        if store.stub(id).await?.is_some() {
            return Ok(Some(id));
        }
    }
    let entity = store.entity_by_iri(iri).await?;
    if let Some(entity) = &entity {
        if let Some(anchor) = store.anchor_of_entity(entity.id).await? {
            return Ok(Some(anchor));
        }
    }
    let mut claims = store.claims_for(iri, entity.map(|e| e.id)).await?;
    claims.sort_by(|a, b| {
        a.created_at
            .is_none()
            .cmp(&b.created_at.is_none())
            .then(a.created_at.cmp(&b.created_at))
            .then(a.stub.cmp(&b.stub))
    });
    Ok(claims.first().map(|c| c.stub))
}
