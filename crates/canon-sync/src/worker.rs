use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use canon_core::{PendingItem, StatusReport, WorkKind};
use canon_storage::{
    DocumentArchive, DocumentSource, SearchIndex, Store,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CanonConfig, PluginRegistry};
use crate::evaluate::EvaluationEngine;
use crate::ingest::Ingestor;
use crate::synthesize::{Indexer, SynthesisEngine};
use crate::EngineError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Totals for one worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub processed: usize,
    pub failed: usize,
    /// A one-shot run stopped because a whole batch failed.
    pub stalled: bool,
}

impl WorkerReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.stalled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    pub batch_size: usize,
    pub busy_pause: Duration,
    pub idle_backoff: Duration,
    pub continuous: bool,
}

impl WorkerOptions {
    pub fn one_shot(batch_size: usize) -> Self {
        Self {
            batch_size,
            busy_pause: Duration::ZERO,
            idle_backoff: Duration::ZERO,
            continuous: false,
        }
    }
}

/// The engines wired to one store and one index.
pub struct Pipeline {
    store: Arc<dyn Store>,
    index: Arc<dyn SearchIndex>,
    pub evaluator: EvaluationEngine,
    pub synthesizer: SynthesisEngine,
    pub indexer: Indexer,
    pub ingestor: Ingestor,
    config: CanonConfig,
}

impl Pipeline {
    pub fn new(
        config: CanonConfig,
        registry: &PluginRegistry,
        store: Arc<dyn Store>,
        index: Arc<dyn SearchIndex>,
        source: Arc<dyn DocumentSource>,
    ) -> Result<Self> {
        let policy = registry.expansion_policy();
        let evaluator = EvaluationEngine::new(
            store.clone(),
            index.clone(),
            registry.build_matchers().context("building matchers")?,
            policy.clone(),
        )
        .with_matcher_timeout(config.matcher_timeout);
        let indexer = Indexer::new(store.clone(), index.clone());
        let synthesizer = SynthesisEngine::new(
            store.clone(),
            indexer.clone(),
            registry.build_generators().context("building generators")?,
            policy,
        );
        let ingestor = Ingestor::new(
            store.clone(),
            source,
            DocumentArchive::new(config.archive_dir.clone()),
        )
        .with_retry_delay(config.ingest_retry);
        Ok(Self {
            store,
            index,
            evaluator,
            synthesizer,
            indexer,
            ingestor,
            config,
        })
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn config(&self) -> &CanonConfig {
        &self.config
    }

    /// Worker settings for `kind` from configuration.
    pub fn options(&self, kind: WorkKind, continuous: bool) -> WorkerOptions {
        let batch_size = match kind {
            WorkKind::Index => self.config.index_batch_size,
            WorkKind::Entity | WorkKind::Stub => self.config.batch_size,
        };
        WorkerOptions {
            batch_size,
            busy_pause: self.config.busy_pause,
            idle_backoff: self.config.idle_backoff,
            continuous,
        }
    }

    /// Process one item of `kind`, whatever its tracker state.
    pub async fn process(&self, kind: WorkKind, id: Uuid) -> Result<(), EngineError> {
        match kind {
            WorkKind::Entity => {
                self.evaluator.evaluate_id(id).await?;
            }
            WorkKind::Stub => {
                self.synthesizer.generate(id, false).await?;
            }
            WorkKind::Index => {
                self.indexer.index(id).await?;
            }
        }
        Ok(())
    }

    async fn process_item(&self, item: &PendingItem) -> Result<(), EngineError> {
        self.process(item.kind, item.id).await?;
        if !self.store.mark_clean(item.id, item.kind, &item.nonce).await? {
            debug!(id = %item.id, kind = %item.kind, "re-dirtied while processing; left pending");
        }
        Ok(())
    }

    /// Claim and process one batch of dirty items of `kind`.
    pub async fn run_batch(&self, kind: WorkKind, limit: usize) -> Result<BatchOutcome, EngineError> {
        let batch = self.store.pending(Some(kind), limit).await?;
        let mut outcome = BatchOutcome {
            claimed: batch.len(),
            ..BatchOutcome::default()
        };
        for item in &batch {
            match self.process_item(item).await {
                Ok(()) => outcome.succeeded += 1,
                Err(err) => {
                    warn!(id = %item.id, kind = %kind, error = %err, "work item failed; left dirty");
                    outcome.failed += 1;
                }
            }
        }
        if kind == WorkKind::Index && outcome.succeeded > 0 {
            self.indexer.commit().await?;
        }
        Ok(outcome)
    }

    /// Poll the tracker for `kind` until idle, or forever when continuous.
    pub async fn run_worker(&self, kind: WorkKind, options: WorkerOptions) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();
        info!(%kind, continuous = options.continuous, batch = options.batch_size, "worker started");
        loop {
            let outcome = match self.run_batch(kind, options.batch_size).await {
                Ok(outcome) => outcome,
                Err(err) if options.continuous => {
                    warn!(%kind, error = %err, "batch failed; backing off");
                    tokio::time::sleep(options.idle_backoff).await;
                    continue;
                }
                Err(err) => return Err(err).with_context(|| format!("{kind} batch")),
            };
            report.processed += outcome.succeeded;
            report.failed += outcome.failed;

            if outcome.claimed == 0 {
                if !options.continuous {
                    break;
                }
                tokio::time::sleep(options.idle_backoff).await;
            } else if outcome.succeeded == 0 {
                if !options.continuous {
                    warn!(%kind, failed = outcome.failed, "batch made no progress; stopping");
                    report.stalled = true;
                    break;
                }
                tokio::time::sleep(options.idle_backoff).await;
            } else if options.continuous {
                tokio::time::sleep(options.busy_pause).await;
            }
        }
        info!(%kind, processed = report.processed, failed = report.failed, "worker finished");
        Ok(report)
    }

    /// Run every worker kind in turn until a full round finds no work.
    pub async fn run_until_idle(&self, max_rounds: usize) -> Result<WorkerReport> {
        let mut total = WorkerReport::default();
        for _ in 0..max_rounds {
            let mut claimed = 0usize;
            for kind in WorkKind::ALL {
                let batch_size = self.options(kind, false).batch_size;
                loop {
                    let outcome = self.run_batch(kind, batch_size).await?;
                    claimed += outcome.claimed;
                    total.processed += outcome.succeeded;
                    total.failed += outcome.failed;
                    if outcome.claimed == 0 || outcome.succeeded == 0 {
                        total.stalled |= outcome.claimed > 0;
                        break;
                    }
                }
            }
            if claimed == 0 || total.stalled {
                return Ok(total);
            }
        }
        anyhow::bail!("pipeline still busy after {max_rounds} rounds")
    }

    /// Drain the ingest queue anchor by anchor.
    pub async fn run_ingest_queue(&self, continuous: bool) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();
        loop {
            match self.ingestor.run_queue_once().await {
                Ok(Some(summary)) => {
                    report.processed += summary.fetched;
                    report.failed += summary.failed;
                }
                Ok(None) if continuous => tokio::time::sleep(self.config.idle_backoff).await,
                Ok(None) => break,
                Err(err) if continuous => {
                    warn!(error = %err, "ingest run failed; backing off");
                    tokio::time::sleep(self.config.idle_backoff).await;
                }
                Err(err) => return Err(err).context("running ingest queue"),
            }
        }
        Ok(report)
    }

    /// Mark every item of `kind` dirty.
    pub async fn reset(&self, kind: WorkKind) -> Result<u64> {
        let count = self
            .store
            .reset(kind)
            .await
            .with_context(|| format!("resetting {kind} tracker"))?;
        info!(%kind, count, "tracker reset");
        Ok(count)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let mut report = self.store.status().await.context("reading store status")?;
        report.indexed_documents = self
            .index
            .document_count()
            .await
            .context("counting indexed documents")?;
        Ok(report)
    }
}
