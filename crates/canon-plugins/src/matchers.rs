use async_trait::async_trait;
use canon_core::{
    time_period_iri, uuid_urn, vocab, Entity, EntityKind, MappingSet, MatchType, StubKind,
    WeightedText, WorkKind, INTERNAL_SOURCE,
};
use canon_storage::{MappingStore, SearchQuery};
use tracing::{debug, info};

use crate::{MatchContext, Matcher, MatcherError};

/// Confidence given to the broadMatch between an entity and its year period.
const TIME_PERIOD_CONFIDENCE: u8 = 50;

/// Full-text nearest-neighbour lookup over already-synthesized stubs.
#[derive(Debug, Clone)]
pub struct SearchMatcher {
    pub limit: usize,
}

impl Default for SearchMatcher {
    fn default() -> Self {
        Self { limit: 10 }
    }
}

fn kinds_conflict(entity: Option<StubKind>, stub: StubKind) -> bool {
    entity.is_some_and(|kind| kind != stub)
}

#[async_trait]
impl Matcher for SearchMatcher {
    fn name(&self) -> &'static str {
        "search"
    }

    async fn evaluate(
        &self,
        ctx: &MatchContext<'_>,
        entity: &Entity,
        mappings: &mut MappingStore,
    ) -> Result<(), MatcherError> {
        let Some(label) = entity.label() else {
            debug!(entity = %entity.id, "no label; skipping search match");
            return Ok(());
        };
        let mut hits = ctx.index.query(&SearchQuery::phrase(label, self.limit)).await?;
        if hits.is_empty() {
            hits = ctx.index.query(&SearchQuery::terms(label, self.limit)).await?;
        }
        let sample: Vec<WeightedText> = entity.weighted_fields();
        let entity_kind = entity.inferred_kind();

        for hit in hits {
            let Some(stored) = ctx.store.stub(hit).await? else {
                continue;
            };
            if kinds_conflict(entity_kind, stored.stub.kind) {
                debug!(entity = %entity.id, stub = %hit, "kind mismatch; not a candidate");
                continue;
            }
            let set = MappingSet::from_records(ctx.store.mappings_for_anchor(hit).await?);
            let mut members: Vec<Entity> = Vec::new();
            for record in set.filter_by_type(MatchType::ExactMatch) {
                let Some(id) = record.resource_entity else {
                    continue;
                };
                if id == entity.id || members.iter().any(|m| m.id == id) {
                    continue;
                }
                if let Some(member) = ctx.store.entity(id).await? {
                    members.push(member);
                }
            }
            if members.is_empty() {
                continue;
            }
            let corpus: Vec<WeightedText> = members.iter().flat_map(Entity::weighted_fields).collect();
            let confidence = ctx.scorer.score(&sample, &corpus);
            let mut match_type = MatchType::from_confidence(confidence);
            if entity.is_publisher() && match_type == MatchType::ExactMatch {
                match_type = MatchType::CloseMatch;
            }
            debug!(entity = %entity.id, stub = %hit, confidence, %match_type, "search candidate scored");
            if match_type == MatchType::ExactMatch {
                for member in &members {
                    mappings.add_entity(member, match_type, confidence);
                }
            } else {
                mappings.add_resources(
                    [uuid_urn(hit).as_str()],
                    Some(INTERNAL_SOURCE),
                    match_type,
                    confidence,
                    stored.stub.title.as_deref(),
                    canon_core::DEFAULT_PRIORITY,
                );
            }
        }
        Ok(())
    }
}

/// Links entities with temporal bounds to year-period entities.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeMatcher;

#[async_trait]
impl Matcher for TimeMatcher {
    fn name(&self) -> &'static str {
        "time"
    }

    async fn evaluate(
        &self,
        ctx: &MatchContext<'_>,
        entity: &Entity,
        mappings: &mut MappingStore,
    ) -> Result<(), MatcherError> {
        if entity.kind == EntityKind::Time {
            return Ok(());
        }
        let Some(bounds) = entity.temporal else {
            return Ok(());
        };
        let mut years: Vec<i32> = [bounds.start, bounds.end]
            .into_iter()
            .flatten()
            .map(|d| d.year)
            .collect();
        years.sort_unstable();
        years.dedup();

        for year in years {
            let iri = time_period_iri(year);
            let period = match ctx.store.entity_by_iri(&iri).await? {
                Some(existing) => existing,
                None => {
                    let created = Entity::new(EntityKind::Time, iri.as_str())
                        .with_literal(vocab::RDFS_LABEL, format!("{year:04}"));
                    ctx.store.put_entity(&created).await?;
                    ctx.store.mark_dirty(created.id, WorkKind::Entity).await?;
                    info!(period = %iri, entity = %created.id, "created time period");
                    created
                }
            };
            mappings.add_entity(&period, MatchType::BroadMatch, TIME_PERIOD_CONFIDENCE);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canon_core::{PartialDate, SimilarityScorer, Stub, TemporalBounds};
    use canon_storage::{
        EntityStore, IndexedDocument, MemoryIndex, MemoryStore, SearchIndex, StubStore,
    };

    fn labelled(kind: EntityKind, iri: &str, label: &str) -> Entity {
        Entity::new(kind, iri).with_literal(vocab::RDFS_LABEL, label)
    }

    async fn seed_stub(store: &MemoryStore, index: &MemoryIndex, member: &Entity, kind: StubKind) -> uuid::Uuid {
        store.put_entity(member).await.expect("put");
        let anchor = uuid::Uuid::new_v4();
        MappingStore::for_entity(member)
            .commit(store, anchor, None)
            .await
            .expect("commit");
        let mut stub = Stub::draft(anchor);
        stub.kind = kind;
        stub.title = member.label().map(str::to_string);
        store.put_stub(&stub).await.expect("stub");
        index
            .index_document(&IndexedDocument {
                id: anchor,
                kind,
                visible: true,
                parent: None,
                tags: Vec::new(),
                full_text: vec![stub.title.clone().unwrap_or_default()],
            })
            .await
            .expect("index");
        anchor
    }

    #[tokio::test]
    async fn search_matcher_adds_exact_member_for_strong_match() {
        let store = MemoryStore::new();
        let index = MemoryIndex::new();
        let scorer = SimilarityScorer::new();
        let existing = labelled(EntityKind::Place, "http://www.bbc.co.uk/nature/places/big_ben", "Big Ben");
        seed_stub(&store, &index, &existing, StubKind::Place).await;

        let incoming = labelled(EntityKind::Place, "http://dbpedia.org/resource/Big_Ben", "Big Ben");
        let mut mappings = MappingStore::for_entity(&incoming);
        let ctx = MatchContext { store: &store, index: &index, scorer: &scorer };
        SearchMatcher::default()
            .evaluate(&ctx, &incoming, &mut mappings)
            .await
            .expect("evaluate");

        let exact = mappings.filter_by_type(MatchType::ExactMatch);
        assert!(exact.iter().any(|r| r.resource_entity == Some(existing.id)));
    }

    #[tokio::test]
    async fn search_matcher_rejects_kind_mismatch() {
        let store = MemoryStore::new();
        let index = MemoryIndex::new();
        let scorer = SimilarityScorer::new();
        let person = labelled(EntityKind::Person, "http://www.bbc.co.uk/people/big_ben", "Big Ben");
        seed_stub(&store, &index, &person, StubKind::Person).await;

        let place = labelled(EntityKind::Place, "http://dbpedia.org/resource/Big_Ben", "Big Ben");
        let mut mappings = MappingStore::for_entity(&place);
        let ctx = MatchContext { store: &store, index: &index, scorer: &scorer };
        SearchMatcher::default()
            .evaluate(&ctx, &place, &mut mappings)
            .await
            .expect("evaluate");
        assert_eq!(mappings.len(), 1);
    }

    #[tokio::test]
    async fn publishers_never_match_exactly() {
        let store = MemoryStore::new();
        let index = MemoryIndex::new();
        let scorer = SimilarityScorer::new();
        let existing = labelled(EntityKind::Collection, "http://a.example/radio4", "Radio 4");
        let anchor = seed_stub(&store, &index, &existing, StubKind::Collection).await;

        let publisher = labelled(EntityKind::Publisher, "http://b.example/radio4", "Radio 4");
        let mut mappings = MappingStore::for_entity(&publisher);
        let ctx = MatchContext { store: &store, index: &index, scorer: &scorer };
        SearchMatcher::default()
            .evaluate(&ctx, &publisher, &mut mappings)
            .await
            .expect("evaluate");
        assert!(mappings.set().contains(&uuid_urn(anchor), MatchType::CloseMatch));
        assert_eq!(mappings.filter_by_type(MatchType::ExactMatch).len(), 1);
    }

    #[tokio::test]
    async fn time_matcher_creates_period_once() {
        let store = MemoryStore::new();
        let index = MemoryIndex::new();
        let scorer = SimilarityScorer::new();
        let mut tower = labelled(EntityKind::Place, "http://a.example/big_ben", "Big Ben");
        tower.temporal = Some(TemporalBounds {
            start: Some(PartialDate { year: 1859, month: Some(5), day: None }),
            end: None,
        });
        let ctx = MatchContext { store: &store, index: &index, scorer: &scorer };
        let mut first = MappingStore::for_entity(&tower);
        TimeMatcher.evaluate(&ctx, &tower, &mut first).await.expect("evaluate");
        let mut second = MappingStore::for_entity(&tower);
        TimeMatcher.evaluate(&ctx, &tower, &mut second).await.expect("evaluate");

        let broad = first.filter_by_type(MatchType::BroadMatch);
        assert_eq!(broad.len(), 1);
        assert_eq!(broad[0].resource, "urn:x-canon:time:1859");
        assert_eq!(broad[0].source, canon_core::TIME_SOURCE);
        assert_eq!(store.entity_ids().await.expect("ids").len(), 1);
        assert_eq!(
            second.filter_by_type(MatchType::BroadMatch)[0].resource_entity,
            broad[0].resource_entity
        );
    }
}
