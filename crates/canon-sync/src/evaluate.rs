use std::sync::Arc;
use std::time::Duration;

use canon_core::{
    default_anchor_for, Entity, EntityId, MatchType, SimilarityScorer, StubId, StubKind, WorkKind,
};
use canon_plugins::{MatchContext, Matcher, MatcherError, MatchedSet};
use canon_storage::{
    ExpansionPolicy, ExpansionSummary, MappingDiff, MappingStore, SearchIndex, Store,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::EngineError;

/// Outcome of evaluating one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub entity: EntityId,
    pub anchor: StubId,
    pub previous: Option<StubId>,
    pub diff: MappingDiff,
    pub expansion: ExpansionSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CandidateKey {
    target_created: DateTime<Utc>,
    unpersisted: bool,
    claim_created: Option<DateTime<Utc>>,
    stub: StubId,
    target: EntityId,
}

fn kinds_conflict(a: Option<StubKind>, b: Option<StubKind>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a != b)
}

/// Runs matchers for an entity, picks its stub, and commits the evidence.
pub struct EvaluationEngine {
    store: Arc<dyn Store>,
    index: Arc<dyn SearchIndex>,
    matchers: Vec<Box<dyn Matcher>>,
    policy: ExpansionPolicy,
    scorer: SimilarityScorer,
    matcher_timeout: Duration,
}

impl EvaluationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<dyn SearchIndex>,
        matchers: Vec<Box<dyn Matcher>>,
        policy: ExpansionPolicy,
    ) -> Self {
        Self {
            store,
            index,
            matchers,
            policy,
            scorer: SimilarityScorer::new(),
            matcher_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_matcher_timeout(mut self, timeout: Duration) -> Self {
        self.matcher_timeout = timeout;
        self
    }

    /// Evaluate an entity, or every genuine member of a stub when `id` names one.
    pub async fn evaluate_id(&self, id: Uuid) -> Result<Vec<Evaluation>, EngineError> {
        if let Some(entity) = self.store.entity(id).await? {
            return Ok(vec![self.evaluate_entity(&entity).await?]);
        }
        if self.store.stub(id).await?.is_none() {
            return Err(EngineError::NotFound(id));
        }
        let records = self.store.mappings_for_anchor(id).await?;
        let matched = MatchedSet::load(self.store.as_ref(), records).await?;
        let members: Vec<Entity> = matched
            .members(&self.policy.transient_sources)
            .into_iter()
            .filter_map(|m| m.entity.clone())
            .collect();
        let mut evaluations = Vec::with_capacity(members.len());
        for member in &members {
            evaluations.push(self.evaluate_entity(member).await?);
        }
        Ok(evaluations)
    }

    pub async fn evaluate_entity(&self, entity: &Entity) -> Result<Evaluation, EngineError> {
        self.evaluate_inner(entity)
            .instrument(info_span!("evaluate", entity = %entity.id, kind = %entity.kind))
            .await
    }

    async fn evaluate_inner(&self, entity: &Entity) -> Result<Evaluation, EngineError> {
        let store = self.store.as_ref();
        if entity.label().is_none() {
            warn!("entity has no label");
        }
        let default_anchor = store
            .default_anchor(entity.id, default_anchor_for(entity.id))
            .await?;
        let previous = store.anchor_of_entity(entity.id).await?;

        let mut mappings = MappingStore::for_entity(entity);
        self.run_matchers(entity, &mut mappings).await?;
        mappings.resolve(store).await?;
        let expansion = mappings
            .expand_equivalences(store, &self.policy, default_anchor)
            .await?;
        if expansion.truncated {
            warn!(
                added = expansion.added,
                queued = expansion.queued,
                "equivalence expansion stopped at its bound"
            );
        }

        let anchor = self.select_anchor(entity, &mappings, default_anchor).await?;
        let diff = mappings.commit(store, anchor, previous).await?;

        if let Some(previous) = previous.filter(|p| *p != anchor) {
            info!(%previous, %anchor, "entity moved to another stub");
            store.mark_dirty(previous, WorkKind::Stub).await?;
        }
        store.mark_dirty(anchor, WorkKind::Stub).await?;
        if !diff.is_empty() {
            self.follow_up(entity, anchor, &mappings).await?;
        }
        info!(%anchor, inserted = diff.inserted, deleted = diff.deleted, "entity evaluated");
        Ok(Evaluation {
            entity: entity.id,
            anchor,
            previous,
            diff,
            expansion,
        })
    }

    async fn run_matchers(
        &self,
        entity: &Entity,
        mappings: &mut MappingStore,
    ) -> Result<(), EngineError> {
        let ctx = MatchContext {
            store: self.store.as_ref(),
            index: self.index.as_ref(),
            scorer: &self.scorer,
        };
        for matcher in &self.matchers {
            let name = matcher.name();
            let outcome =
                tokio::time::timeout(self.matcher_timeout, matcher.evaluate(&ctx, entity, mappings))
                    .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(MatcherError::Store(err))) => return Err(err.into()),
                Ok(Err(err)) => warn!(matcher = name, error = %err, "matcher failed; skipping"),
                Err(_) => warn!(
                    matcher = name,
                    timeout_secs = self.matcher_timeout.as_secs(),
                    "matcher timed out; skipping"
                ),
            }
        }
        Ok(())
    }

    /// Earliest stub claiming a compatible exact target, else the default anchor.
    async fn select_anchor(
        &self,
        entity: &Entity,
        mappings: &MappingStore,
        default_anchor: StubId,
    ) -> Result<StubId, EngineError> {
        let store = self.store.as_ref();
        let entity_kind = entity.inferred_kind();
        let own_created = store.stub(default_anchor).await?.map(|s| s.created_at);
        let mut best = CandidateKey {
            target_created: entity.created_at,
            unpersisted: own_created.is_none(),
            claim_created: own_created,
            stub: default_anchor,
            target: entity.id,
        };
        for record in mappings.filter_by_type(MatchType::ExactMatch) {
            let Some(target) = mappings.entity_for(record) else {
                continue;
            };
            if target.id == entity.id {
                continue;
            }
            if kinds_conflict(entity_kind, target.inferred_kind()) {
                debug!(target = %target.id, "kind conflict; not a candidate");
                continue;
            }
            for claim in store.claims_for(&record.resource, Some(target.id)).await? {
                let key = CandidateKey {
                    target_created: target.created_at,
                    unpersisted: claim.created_at.is_none(),
                    claim_created: claim.created_at,
                    stub: claim.stub,
                    target: target.id,
                };
                if key < best {
                    best = key;
                }
            }
        }
        Ok(best.stub)
    }

    /// Defer re-evaluation of entities whose placement this commit may change.
    async fn follow_up(
        &self,
        entity: &Entity,
        anchor: StubId,
        mappings: &MappingStore,
    ) -> Result<(), EngineError> {
        let store = self.store.as_ref();
        let records = store.mappings_for_anchor(anchor).await?;
        for record in records
            .iter()
            .filter(|r| r.match_type == MatchType::ExactMatch)
            .filter(|r| !r.is_transient(&self.policy.transient_sources))
        {
            if let Some(member) = record.resource_entity.filter(|id| *id != entity.id) {
                store.mark_dirty(member, WorkKind::Entity).await?;
            }
        }
        for record in mappings.filter_by_type(MatchType::ExactMatch) {
            let Some(target) = record.resource_entity.filter(|id| *id != entity.id) else {
                continue;
            };
            if store.anchor_of_entity(target).await? != Some(anchor) {
                debug!(%target, "exact target lives elsewhere; queuing re-evaluation");
                store.mark_dirty(target, WorkKind::Entity).await?;
            }
        }
        Ok(())
    }
}
