use std::collections::{BTreeSet, HashSet, VecDeque};

use async_trait::async_trait;
use canon_core::{
    host_of, parse_uuid_urn, uuid_urn, vocab, Entity, EntityId, IngestCallback, IngestEntry,
    MatchType, Stub, StubId, StubKind, TemporalBounds, WorkKind,
};
use canon_storage::{stub_for_resource, Store, StoreError};
use tracing::{debug, warn};

use crate::{is_own_iri, GenerateContext, Generator, GeneratorError, MatchedSet};

/// Stub id standing for an entity: its own stub if the id names one, else its anchor.
async fn stub_for_entity(store: &dyn Store, id: EntityId) -> Result<Option<StubId>, StoreError> {
    if store.stub(id).await?.is_some() {
        return Ok(Some(id));
    }
    store.anchor_of_entity(id).await
}

/// Kind, class list and publisher facets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeGenerator;

#[async_trait]
impl Generator for TypeGenerator {
    fn name(&self) -> &'static str {
        "type"
    }

    async fn generate(
        &self,
        ctx: &GenerateContext<'_>,
        matched: &MatchedSet,
        stub: &mut Stub,
    ) -> Result<(), GeneratorError> {
        let exact = matched.exact_entities();
        let is_publisher = exact.iter().any(|e| e.is_publisher());
        let mut publishers = BTreeSet::new();
        if !is_publisher {
            for entity in &exact {
                let Some(publisher) = entity.publisher else {
                    continue;
                };
                match stub_for_entity(ctx.store, publisher).await? {
                    Some(found) if found != stub.id => {
                        publishers.insert(found);
                    }
                    Some(_) => {}
                    None => warn!(stub = %stub.id, %publisher, "no stub for publisher yet"),
                }
            }
        }
        stub.tags.extend(publishers.iter().map(|p| p.to_string()));
        stub.publishers = publishers;
        stub.is_publisher = is_publisher;
        stub.types = exact
            .iter()
            .flat_map(|e| e.declared_types())
            .map(str::to_string)
            .collect();
        stub.kind = if is_publisher {
            StubKind::Collection
        } else {
            match vocab::kind_for_types(stub.types.iter().map(String::as_str)) {
                Some(kind) => kind,
                None => {
                    warn!(stub = %stub.id, types = ?stub.types, "unable to determine kind; using thing");
                    StubKind::Thing
                }
            }
        };
        Ok(())
    }
}

/// Title, description, full-text payload and temporal interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryGenerator;

#[async_trait]
impl Generator for SummaryGenerator {
    fn name(&self) -> &'static str {
        "summary"
    }

    async fn generate(
        &self,
        _ctx: &GenerateContext<'_>,
        matched: &MatchedSet,
        stub: &mut Stub,
    ) -> Result<(), GeneratorError> {
        let exact = matched.exact_entities();
        for predicate in vocab::LABEL_PREDICATES {
            let labels: Vec<&String> = exact.iter().flat_map(|e| e.literals_for(predicate)).collect();
            if let Some(first) = labels.first() {
                stub.title = Some(first.to_string());
                for label in labels {
                    stub.push_full_text(label);
                }
                break;
            }
        }
        for predicate in vocab::DESCRIPTION_PREDICATES {
            for entity in &exact {
                for description in entity.literals_for(predicate) {
                    if stub.description.is_none() {
                        stub.description = Some(description.clone());
                    }
                    stub.push_full_text(description);
                }
            }
        }
        stub.temporal = exact
            .iter()
            .filter_map(|e| e.temporal)
            .reduce(TemporalBounds::union);
        Ok(())
    }
}

/// Coordinates of the first exact member that has them.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoGenerator;

#[async_trait]
impl Generator for GeoGenerator {
    fn name(&self) -> &'static str {
        "geo"
    }

    async fn generate(
        &self,
        _ctx: &GenerateContext<'_>,
        matched: &MatchedSet,
        stub: &mut Stub,
    ) -> Result<(), GeneratorError> {
        stub.geo = matched.exact_entities().iter().find_map(|e| e.geo);
        Ok(())
    }
}

/// Stub-to-stub references, match references, structure and parentage.
#[derive(Debug, Clone)]
pub struct RefsGenerator {
    /// Bound on ancestor traversal when inheriting structural references.
    pub max_depth: usize,
}

impl Default for RefsGenerator {
    fn default() -> Self {
        Self { max_depth: 16 }
    }
}

struct RefsPass<'a, 'c> {
    ctx: &'a GenerateContext<'c>,
    exact: Vec<&'a Entity>,
    max_depth: usize,
}

impl RefsPass<'_, '_> {
    fn is_member_iri(&self, iri: &str) -> bool {
        self.exact.iter().any(|e| e.iris.iter().any(|i| i == iri))
    }

    /// Ingest a missing reference target when it is trusted or shares a member's host.
    async fn possibly_ingest(&self, stub: &Stub, uri: &str) -> Result<(), StoreError> {
        let store = self.ctx.store;
        if let Some(entity) = store.entity_by_iri(uri).await? {
            debug!(stub = %stub.id, %uri, "target ingested but not evaluated");
            store.mark_dirty(entity.id, WorkKind::Entity).await?;
            return Ok(());
        }
        let trusted = self.ctx.policy.allows(uri)
            || host_of(uri).is_some_and(|host| {
                self.exact
                    .iter()
                    .flat_map(|e| e.iris.iter())
                    .any(|iri| host_of(iri).as_deref() == Some(host.as_str()))
            });
        if !trusted {
            return Ok(());
        }
        let entry = IngestEntry {
            anchor: stub.id,
            uri: uri.to_string(),
            scheduled_at: store.now(),
            callback: IngestCallback {
                regenerate: BTreeSet::from([stub.id]),
                ..IngestCallback::default()
            },
        };
        store.queue_ingest(&entry, false).await?;
        Ok(())
    }

    async fn add_stub_ref(&self, stub: &mut Stub, predicate: &str, uri: &str) -> Result<(), StoreError> {
        match stub_for_resource(self.ctx.store, uri).await? {
            Some(target) if target == stub.id => {}
            Some(target) => {
                stub.add_reference(vocab::stored_ref_predicate(predicate), uuid_urn(target));
                stub.related_stubs.insert(target);
                stub.tags.insert(target.to_string());
            }
            None => self.possibly_ingest(stub, uri).await?,
        }
        Ok(())
    }

    async fn add_match_refs(&self, matched: &MatchedSet, stub: &mut Stub) -> Result<(), StoreError> {
        for m in matched.of_type(MatchType::ExactMatch) {
            stub.add_reference(vocab::SKOS_EXACT_MATCH, m.record.resource.clone());
        }
        for match_type in [MatchType::CloseMatch, MatchType::NarrowMatch, MatchType::BroadMatch] {
            let Some(predicate) = match_type.skos_predicate() else {
                continue;
            };
            for m in matched.of_type(match_type) {
                let target = match (parse_uuid_urn(&m.record.resource), &m.entity) {
                    (_, Some(entity)) => {
                        let anchor = stub_for_entity(self.ctx.store, entity.id).await?;
                        if anchor.is_none() {
                            debug!(stub = %stub.id, entity = %entity.id, "no stub yet; queuing evaluation");
                            self.ctx.store.mark_dirty(entity.id, WorkKind::Entity).await?;
                        }
                        anchor
                    }
                    (Some(id), None) => self.ctx.store.stub(id).await?.map(|s| s.stub.id),
                    (None, None) => None,
                };
                if let Some(target) = target.filter(|t| *t != stub.id) {
                    stub.add_reference(predicate, uuid_urn(target));
                }
            }
        }
        Ok(())
    }

    /// Record `uri`'s stub as superior and inherit its ancestors' structure.
    async fn add_parent(&self, stub: &mut Stub, uri: &str) -> Result<Option<StubId>, StoreError> {
        let Some(parent) = stub_for_resource(self.ctx.store, uri).await? else {
            debug!(stub = %stub.id, %uri, "no stub for potential parent");
            self.possibly_ingest(stub, uri).await?;
            return Ok(None);
        };
        if parent == stub.id {
            return Ok(None);
        }
        stub.superior.insert(parent);
        stub.structural_refs.insert(parent);
        self.inherit_structure(stub, parent).await?;
        Ok(Some(parent))
    }

    async fn inherit_structure(&self, stub: &mut Stub, from: StubId) -> Result<(), StoreError> {
        let own = stub.id;
        let mut visited: HashSet<StubId> = HashSet::from([own]);
        let mut queue: VecDeque<(StubId, usize)> = VecDeque::from([(from, 0)]);
        while let Some((id, depth)) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let Some(ancestor) = self.ctx.store.stub(id).await? else {
                continue;
            };
            stub.structural_refs.extend(
                ancestor
                    .stub
                    .structural_refs
                    .iter()
                    .copied()
                    .filter(|r| *r != own),
            );
            if depth + 1 >= self.max_depth {
                if ancestor.stub.parent.is_some() {
                    warn!(stub = %stub.id, ancestor = %id, "ancestor chain truncated");
                }
                continue;
            }
            if let Some(next) = ancestor.stub.parent {
                queue.push_back((next, depth + 1));
            }
        }
        Ok(())
    }

    async fn superior_matches(
        &self,
        stub: &mut Stub,
        predicates: &[&str],
    ) -> Result<Option<StubId>, StoreError> {
        let mut first = None;
        for predicate in predicates {
            let uris: Vec<String> = self
                .exact
                .iter()
                .flat_map(|e| e.links_for(predicate).iter().cloned())
                .collect();
            for uri in uris {
                if self.is_member_iri(&uri) {
                    continue;
                }
                if let Some(parent) = self.add_parent(stub, &uri).await? {
                    first.get_or_insert(parent);
                }
            }
        }
        Ok(first)
    }
}

#[async_trait]
impl Generator for RefsGenerator {
    fn name(&self) -> &'static str {
        "refs"
    }

    async fn generate(
        &self,
        ctx: &GenerateContext<'_>,
        matched: &MatchedSet,
        stub: &mut Stub,
    ) -> Result<(), GeneratorError> {
        let pass = RefsPass {
            ctx,
            exact: matched.exact_entities(),
            max_depth: self.max_depth,
        };

        for predicate in vocab::STUB_REF_PREDICATES {
            let mut uris: Vec<&str> = Vec::new();
            for entity in &pass.exact {
                for uri in entity.links_for(predicate) {
                    if !uris.contains(&uri.as_str()) {
                        uris.push(uri);
                    }
                }
            }
            for uri in uris {
                if !is_own_iri(stub.id, uri) {
                    pass.add_stub_ref(stub, predicate, uri).await?;
                }
            }
        }

        pass.add_match_refs(matched, stub).await?;

        let mut parent = None;
        for entity in &pass.exact {
            for reference in &entity.structural_refs {
                match stub_for_entity(ctx.store, *reference).await? {
                    Some(target) if target != stub.id => {
                        stub.structural_refs.insert(target);
                        stub.related_stubs.insert(target);
                    }
                    Some(_) => {}
                    None => debug!(stub = %stub.id, %reference, "no stub for structural reference"),
                }
            }
            if let Some(explicit) = entity.parent {
                match stub_for_entity(ctx.store, explicit).await? {
                    Some(found) if found == stub.id => {}
                    Some(found) if parent.is_none() => parent = Some(found),
                    Some(found) => {
                        stub.structural_refs.insert(found);
                    }
                    None => {}
                }
            }
        }
        let kind = stub.kind;
        let by_kind = pass
            .superior_matches(stub, vocab::parent_predicates(kind))
            .await?;
        parent = parent.or(by_kind);
        pass.superior_matches(stub, vocab::SUPERIOR_PREDICATES).await?;

        if parent.is_none() && stub.kind == StubKind::Collection && !stub.is_publisher {
            parent = stub.publishers.iter().next().copied();
        }
        if let Some(parent) = parent {
            stub.parent = Some(parent);
            pass.inherit_structure(stub, parent).await?;
        }
        Ok(())
    }
}

/// Ranking damping for performances and productions of other works.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreGenerator;

#[async_trait]
impl Generator for ScoreGenerator {
    fn name(&self) -> &'static str {
        "score"
    }

    async fn generate(
        &self,
        _ctx: &GenerateContext<'_>,
        _matched: &MatchedSet,
        stub: &mut Stub,
    ) -> Result<(), GeneratorError> {
        let damped = vocab::SCORE_DAMPING_PREDICATES
            .iter()
            .filter_map(|p| stub.references.get(*p))
            .map(BTreeSet::len)
            .sum::<usize>();
        stub.score = 0.5f64.powi(i32::try_from(damped).unwrap_or(i32::MAX));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DepictionGenerator;

#[async_trait]
impl Generator for DepictionGenerator {
    fn name(&self) -> &'static str {
        "depiction"
    }

    async fn generate(
        &self,
        _ctx: &GenerateContext<'_>,
        matched: &MatchedSet,
        stub: &mut Stub,
    ) -> Result<(), GeneratorError> {
        let exact = matched.exact_entities();
        for entity in &exact {
            for image in entity.links_for(vocab::FOAF_DEPICTION) {
                if !stub.depictions.contains(image) {
                    stub.depictions.push(image.clone());
                }
            }
        }
        stub.thumbnail = exact
            .iter()
            .find_map(|e| e.links_for(vocab::FOAF_THUMBNAIL).first().cloned())
            .or_else(|| stub.depictions.first().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canon_core::{EntityKind, GeoPoint, MappingRecord, PartialDate};
    use canon_storage::{
        DirtyTracker, EntityStore, ExpansionPolicy, IngestQueue, MappingStore, MemoryStore,
        StubStore,
    };

    fn place(iri: &str, label: &str) -> Entity {
        Entity::new(EntityKind::Place, iri).with_literal(vocab::RDFS_LABEL, label)
    }

    async fn anchored(store: &MemoryStore, entity: &Entity) -> StubId {
        store.put_entity(entity).await.expect("put");
        let anchor = canon_core::default_anchor_for(entity.id);
        MappingStore::for_entity(entity)
            .commit(store, anchor, None)
            .await
            .expect("commit");
        anchor
    }

    async fn run(
        generator: &dyn Generator,
        store: &MemoryStore,
        anchor: StubId,
        stub: &mut Stub,
    ) -> MatchedSet {
        let policy = ExpansionPolicy::default();
        let ctx = GenerateContext { store, policy: &policy };
        let records = canon_storage::MappingTable::mappings_for_anchor(store, anchor)
            .await
            .expect("rows");
        let matched = MatchedSet::load(store, records).await.expect("load");
        generator.generate(&ctx, &matched, stub).await.expect("generate");
        matched
    }

    #[tokio::test]
    async fn type_generator_derives_kind_and_publisher_collection() {
        let store = MemoryStore::new();
        let tower = place("http://a.example/big_ben", "Big Ben");
        let anchor = anchored(&store, &tower).await;
        let mut stub = Stub::draft(anchor);
        run(&TypeGenerator, &store, anchor, &mut stub).await;
        assert_eq!(stub.kind, StubKind::Place);
        assert!(stub.types.contains(vocab::DBPEDIA_PLACE));

        let channel = Entity::new(EntityKind::Publisher, "http://a.example/radio4");
        let anchor = anchored(&store, &channel).await;
        let mut stub = Stub::draft(anchor);
        run(&TypeGenerator, &store, anchor, &mut stub).await;
        assert_eq!(stub.kind, StubKind::Collection);
        assert!(stub.is_publisher);
        assert!(stub.publishers.is_empty());
    }

    #[tokio::test]
    async fn summary_uses_preferred_label_and_collects_text() {
        let store = MemoryStore::new();
        let mut tower = place("http://a.example/big_ben", "Big Ben")
            .with_literal(vocab::SKOS_PREF_LABEL, "Elizabeth Tower")
            .with_literal(vocab::RDFS_COMMENT, "Clock tower in Westminster");
        tower.temporal = Some(canon_core::TemporalBounds {
            start: Some(PartialDate { year: 1843, month: None, day: None }),
            end: Some(PartialDate { year: 1859, month: None, day: None }),
        });
        let anchor = anchored(&store, &tower).await;
        let mut stub = Stub::draft(anchor);
        run(&SummaryGenerator, &store, anchor, &mut stub).await;
        assert_eq!(stub.title.as_deref(), Some("Elizabeth Tower"));
        assert_eq!(stub.description.as_deref(), Some("Clock tower in Westminster"));
        assert_eq!(stub.full_text, vec!["Elizabeth Tower", "Clock tower in Westminster"]);
        assert_eq!(stub.temporal.and_then(|t| t.end).map(|d| d.year), Some(1859));
    }

    #[tokio::test]
    async fn geo_and_depiction_take_first_available() {
        let store = MemoryStore::new();
        let mut tower = place("http://a.example/big_ben", "Big Ben")
            .with_link(vocab::FOAF_DEPICTION, "http://img.example/1.jpg");
        tower.geo = Some(GeoPoint { lat: 51.5007, long: -0.1246 });
        let anchor = anchored(&store, &tower).await;
        let mut stub = Stub::draft(anchor);
        run(&GeoGenerator, &store, anchor, &mut stub).await;
        run(&DepictionGenerator, &store, anchor, &mut stub).await;
        assert_eq!(stub.geo.map(|g| g.lat), Some(51.5007));
        assert_eq!(stub.thumbnail.as_deref(), Some("http://img.example/1.jpg"));
    }

    #[tokio::test]
    async fn refs_link_parent_and_queue_unknown_targets() {
        let store = MemoryStore::new();
        let london = place("http://sws.geonames.org/2643743/", "London");
        let london_anchor = anchored(&store, &london).await;
        let mut london_stub = Stub::draft(london_anchor);
        london_stub.kind = StubKind::Place;
        store.put_stub(&london_stub).await.expect("stub");

        let tower = place("http://a.example/big_ben", "Big Ben")
            .with_link(vocab::GN_PARENT_FEATURE, "http://sws.geonames.org/2643743/")
            .with_link(vocab::DCT_SUBJECT, "http://a.example/clocks");
        let anchor = anchored(&store, &tower).await;
        let mut stub = Stub::draft(anchor);
        stub.kind = StubKind::Place;
        run(&RefsGenerator::default(), &store, anchor, &mut stub).await;
        stub.normalize_references();

        assert_eq!(stub.parent, Some(london_anchor));
        assert!(stub.superior.contains(&london_anchor));
        assert!(stub.related_stubs.contains(&london_anchor));
        assert!(stub
            .references
            .get(vocab::SKOS_EXACT_MATCH)
            .is_some_and(|r| r.contains("http://a.example/big_ben")));
        let queued = store
            .ingest_entries_for_uri("http://a.example/clocks", store.now())
            .await
            .expect("queue");
        assert_eq!(queued.len(), 1);
        assert!(queued[0].callback.regenerate.contains(&anchor));
    }

    #[tokio::test]
    async fn refs_mark_unresolved_close_matches_dirty() {
        let store = MemoryStore::new();
        let other = place("http://b.example/tower", "Tower");
        store.put_entity(&other).await.expect("put");
        let tower = place("http://a.example/big_ben", "Big Ben");
        store.put_entity(&tower).await.expect("put");
        let anchor = uuid::Uuid::new_v4();
        let mut working = MappingStore::for_entity(&tower);
        working.add(MappingRecord::for_entity(&other, MatchType::CloseMatch, 65));
        working.commit(&store, anchor, None).await.expect("commit");

        let mut stub = Stub::draft(anchor);
        run(&RefsGenerator::default(), &store, anchor, &mut stub).await;
        assert!(store.is_dirty(other.id, WorkKind::Entity).await.expect("dirty"));
        assert!(stub.references.get(vocab::SKOS_CLOSE_MATCH).is_none());
    }

    #[tokio::test]
    async fn score_halves_per_performance_reference() {
        let store = MemoryStore::new();
        let mut stub = Stub::draft(uuid::Uuid::new_v4());
        stub.add_reference(vocab::MO_PERFORMANCE_OF, "urn:uuid:00000000-0000-0000-0000-000000000001");
        stub.add_reference(vocab::MO_PRODUCTION_OF, "urn:uuid:00000000-0000-0000-0000-000000000002");
        run(&ScoreGenerator, &store, stub.id, &mut stub).await;
        assert_eq!(stub.score, 0.25);
    }
}
