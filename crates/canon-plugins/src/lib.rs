//! Matcher and generator plugin contracts plus the built-in implementations.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use canon_core::{Entity, MappingRecord, MappingSet, MatchType, SimilarityScorer, Stub, StubId};
use canon_storage::{ExpansionPolicy, MappingStore, SearchIndex, Store, StoreError};
use thiserror::Error;

pub mod generators;
pub mod matchers;

pub use generators::{
    DepictionGenerator, GeoGenerator, RefsGenerator, ScoreGenerator, SummaryGenerator,
    TypeGenerator,
};
pub use matchers::{SearchMatcher, TimeMatcher};

pub const CRATE_NAME: &str = "canon-plugins";

/// Matcher names in default execution order.
pub const DEFAULT_MATCHERS: &[&str] = &["search", "time"];
/// Generator names in default execution order.
pub const DEFAULT_GENERATORS: &[&str] = &["type", "summary", "geo", "refs", "score", "depiction"];

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{matcher}: {message}")]
    Provider {
        matcher: &'static str,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{generator}: {message}")]
    Facet {
        generator: &'static str,
        message: String,
    },
}

/// Collaborators a matcher may consult while evaluating one entity.
pub struct MatchContext<'a> {
    pub store: &'a dyn Store,
    pub index: &'a dyn SearchIndex,
    pub scorer: &'a SimilarityScorer,
}

#[async_trait]
pub trait Matcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Append evidence about `entity` to `mappings`.
    async fn evaluate(
        &self,
        ctx: &MatchContext<'_>,
        entity: &Entity,
        mappings: &mut MappingStore,
    ) -> Result<(), MatcherError>;
}

pub struct GenerateContext<'a> {
    pub store: &'a dyn Store,
    pub policy: &'a ExpansionPolicy,
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Populate one facet of `stub` from its matched entities.
    async fn generate(
        &self,
        ctx: &GenerateContext<'_>,
        matched: &MatchedSet,
        stub: &mut Stub,
    ) -> Result<(), GeneratorError>;
}

/// A mapping record with the entity it resolves to, when it resolves.
#[derive(Debug, Clone)]
pub struct MatchedEntity {
    pub record: MappingRecord,
    pub entity: Option<Entity>,
}

/// An anchor's mapping set, filtered per match type and resolved to entities.
#[derive(Debug, Clone, Default)]
pub struct MatchedSet {
    by_type: BTreeMap<MatchType, Vec<MatchedEntity>>,
}

impl MatchedSet {
    pub async fn load(store: &dyn Store, records: Vec<MappingRecord>) -> Result<Self, StoreError> {
        let set = MappingSet::from_records(records);
        let mut by_type = BTreeMap::new();
        for match_type in MatchType::ALL {
            let mut matched = Vec::new();
            for record in set.filter_by_type(match_type) {
                let entity = match record.resource_entity {
                    Some(id) => store.entity(id).await?,
                    None => store.entity_by_iri(&record.resource).await?,
                };
                matched.push(MatchedEntity {
                    record: record.clone(),
                    entity,
                });
            }
            if !matched.is_empty() {
                by_type.insert(match_type, matched);
            }
        }
        Ok(Self { by_type })
    }

    pub fn of_type(&self, match_type: MatchType) -> &[MatchedEntity] {
        self.by_type
            .get(&match_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resolved exactMatch entities, one per entity id, in mapping order.
    pub fn exact_entities(&self) -> Vec<&Entity> {
        let mut seen = BTreeSet::new();
        self.of_type(MatchType::ExactMatch)
            .iter()
            .filter_map(|m| m.entity.as_ref())
            .filter(|e| seen.insert(e.id))
            .collect()
    }

    /// Exact members that stand for genuinely ingested entities.
    pub fn members(&self, transient_sources: &[String]) -> Vec<&MatchedEntity> {
        self.of_type(MatchType::ExactMatch)
            .iter()
            .filter(|m| !m.record.is_transient(transient_sources))
            .collect()
    }
}

pub fn matcher_for_name(name: &str) -> Option<Box<dyn Matcher>> {
    match name {
        "search" => Some(Box::new(SearchMatcher::default())),
        "time" => Some(Box::new(TimeMatcher)),
        _ => None,
    }
}

pub fn generator_for_name(name: &str) -> Option<Box<dyn Generator>> {
    match name {
        "type" => Some(Box::new(TypeGenerator)),
        "summary" => Some(Box::new(SummaryGenerator)),
        "geo" => Some(Box::new(GeoGenerator)),
        "refs" => Some(Box::new(RefsGenerator::default())),
        "score" => Some(Box::new(ScoreGenerator)),
        "depiction" => Some(Box::new(DepictionGenerator)),
        _ => None,
    }
}

/// Whether `iri` is the `urn:uuid:` IRI of `stub` itself.
pub(crate) fn is_own_iri(stub: StubId, iri: &str) -> bool {
    canon_core::parse_uuid_urn(iri) == Some(stub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canon_core::{vocab, EntityKind};
    use canon_storage::{EntityStore, MemoryStore};

    #[test]
    fn registry_lookup_knows_builtins() {
        for name in DEFAULT_MATCHERS {
            assert_eq!(matcher_for_name(name).map(|m| m.name()), Some(*name));
        }
        for name in DEFAULT_GENERATORS {
            assert_eq!(generator_for_name(name).map(|g| g.name()), Some(*name));
        }
        assert!(matcher_for_name("gazetteer").is_none());
    }

    #[tokio::test]
    async fn matched_set_resolves_and_filters() {
        let store = MemoryStore::new();
        let a = Entity::new(EntityKind::Place, "http://a.example/1").with_literal(vocab::RDFS_LABEL, "A");
        store.put_entity(&a).await.expect("put");
        let records = vec![
            MappingRecord::for_entity(&a, MatchType::ExactMatch, 100).with_related(a.id),
            MappingRecord::new("http://b.example/2", MatchType::ExactMatch, 90).with_related(a.id),
            MappingRecord::new("urn:x-canon:time:1859", MatchType::BroadMatch, 50).with_related(a.id),
        ];
        let matched = MatchedSet::load(&store, records).await.expect("load");
        assert_eq!(matched.of_type(MatchType::ExactMatch).len(), 2);
        assert_eq!(matched.exact_entities().len(), 1);
        assert_eq!(matched.members(&[]).len(), 1);
        assert_eq!(matched.of_type(MatchType::BroadMatch).len(), 1);
        assert!(matched.of_type(MatchType::CloseMatch).is_empty());
    }
}
