//! Evaluation, stub synthesis, indexing and ingest orchestration.

use canon_core::DocumentError;
use canon_plugins::GeneratorError;
use canon_storage::{FetchError, StoreError};
use thiserror::Error;
use uuid::Uuid;

pub mod config;
pub mod evaluate;
pub mod ingest;
pub mod synthesize;
pub mod worker;

pub use config::{CanonConfig, PluginRegistry};
pub use evaluate::{Evaluation, EvaluationEngine};
pub use ingest::{IngestRunSummary, Ingestor};
pub use synthesize::{Generated, Indexer, SynthesisEngine};
pub use worker::{BatchOutcome, Pipeline, WorkerOptions, WorkerReport};

pub const CRATE_NAME: &str = "canon-sync";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("archiving fetched document: {0}")]
    Archive(String),
    #[error("{0} is neither an entity nor a stub")]
    NotFound(Uuid),
}
