//! Core domain model for canon: entities, mapping evidence, stubs and work records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod mapping;
pub mod similarity;
pub mod vocab;

pub use mapping::MappingSet;
pub use similarity::{SimilarityScorer, WeightedText};

pub const CRATE_NAME: &str = "canon-core";

pub type EntityId = Uuid;
pub type StubId = Uuid;

/// Priority given to automatically derived mappings. Curated mappings use lower values.
pub const DEFAULT_PRIORITY: u32 = 50;
/// Source recorded for evidence that points at one of our own stubs.
pub const INTERNAL_SOURCE: &str = "canon";
pub const TIME_SOURCE: &str = "time";
pub const TIME_IRI_PREFIX: &str = "urn:x-canon:time:";

const DEFAULT_ANCHOR_NAMESPACE: Uuid = Uuid::from_u128(0x6b1d_43a2_8f0e_5c71_9a44_0d2e_e1b7_3c58);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseKindError {
    #[error("unknown {what}: {value}")]
    Unknown { what: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Person,
    Place,
    Event,
    Thing,
    Collection,
    Time,
    Publisher,
    User,
    Graph,
}

impl EntityKind {
    pub const ALL: [EntityKind; 9] = [
        EntityKind::Person,
        EntityKind::Place,
        EntityKind::Event,
        EntityKind::Thing,
        EntityKind::Collection,
        EntityKind::Time,
        EntityKind::Publisher,
        EntityKind::User,
        EntityKind::Graph,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Person => "person",
            EntityKind::Place => "place",
            EntityKind::Event => "event",
            EntityKind::Thing => "thing",
            EntityKind::Collection => "collection",
            EntityKind::Time => "time",
            EntityKind::Publisher => "publisher",
            EntityKind::User => "user",
            EntityKind::Graph => "graph",
        }
    }

    /// Class a record of this kind implicitly declares, fed through the type table.
    pub fn implied_class(&self) -> Option<&'static str> {
        match self {
            EntityKind::Person => Some(vocab::FOAF_PERSON),
            EntityKind::Place => Some(vocab::DBPEDIA_PLACE),
            EntityKind::Event => Some(vocab::EVENT_EVENT),
            EntityKind::Collection | EntityKind::Publisher | EntityKind::User => {
                Some(vocab::DCMI_COLLECTION)
            }
            EntityKind::Thing | EntityKind::Time | EntityKind::Graph => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ParseKindError::Unknown {
                what: "entity kind",
                value: s.to_string(),
            })
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StubKind {
    Person,
    Place,
    Event,
    #[default]
    Thing,
    Collection,
}

impl StubKind {
    pub const ALL: [StubKind; 5] = [
        StubKind::Person,
        StubKind::Place,
        StubKind::Event,
        StubKind::Thing,
        StubKind::Collection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StubKind::Person => "person",
            StubKind::Place => "place",
            StubKind::Event => "event",
            StubKind::Thing => "thing",
            StubKind::Collection => "collection",
        }
    }
}

impl fmt::Display for StubKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StubKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StubKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ParseKindError::Unknown {
                what: "stub kind",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchType {
    ExactMatch,
    CloseMatch,
    NarrowMatch,
    BroadMatch,
    NoMatch,
    Tombstone,
}

impl MatchType {
    pub const ALL: [MatchType; 6] = [
        MatchType::ExactMatch,
        MatchType::CloseMatch,
        MatchType::NarrowMatch,
        MatchType::BroadMatch,
        MatchType::NoMatch,
        MatchType::Tombstone,
    ];

    /// Thresholds: >=70 exact, >60 close, >50 narrow, >25 broad.
    pub fn from_confidence(confidence: u8) -> Self {
        match confidence {
            c if c >= 70 => MatchType::ExactMatch,
            c if c > 60 => MatchType::CloseMatch,
            c if c > 50 => MatchType::NarrowMatch,
            c if c > 25 => MatchType::BroadMatch,
            _ => MatchType::NoMatch,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::ExactMatch => "exactMatch",
            MatchType::CloseMatch => "closeMatch",
            MatchType::NarrowMatch => "narrowMatch",
            MatchType::BroadMatch => "broadMatch",
            MatchType::NoMatch => "noMatch",
            MatchType::Tombstone => "tombstone",
        }
    }

    /// SKOS mapping predicate used when the match is rendered as a stub reference.
    pub fn skos_predicate(&self) -> Option<&'static str> {
        match self {
            MatchType::ExactMatch => Some(vocab::SKOS_EXACT_MATCH),
            MatchType::CloseMatch => Some(vocab::SKOS_CLOSE_MATCH),
            MatchType::NarrowMatch => Some(vocab::SKOS_NARROW_MATCH),
            MatchType::BroadMatch => Some(vocab::SKOS_BROAD_MATCH),
            MatchType::NoMatch | MatchType::Tombstone => None,
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MatchType::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ParseKindError::Unknown {
                what: "match type",
                value: s.to_string(),
            })
    }
}

/// What a pending-work marker asks a worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkKind {
    Entity,
    Stub,
    Index,
}

impl WorkKind {
    pub const ALL: [WorkKind; 3] = [WorkKind::Entity, WorkKind::Stub, WorkKind::Index];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Entity => "entity",
            WorkKind::Stub => "stub",
            WorkKind::Index => "index",
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ParseKindError::Unknown {
                what: "work kind",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub long: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartialDate {
    pub year: i32,
    #[serde(default)]
    pub month: Option<u8>,
    #[serde(default)]
    pub day: Option<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalBounds {
    #[serde(default)]
    pub start: Option<PartialDate>,
    #[serde(default)]
    pub end: Option<PartialDate>,
}

impl TemporalBounds {
    /// Widest interval covering both inputs.
    pub fn union(self, other: TemporalBounds) -> TemporalBounds {
        let start = match (self.start, other.start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let end = match (self.end, other.end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        TemporalBounds { start, end }
    }
}

/// One externally-sourced description of a thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Provider that supplied the record.
    pub source: String,
    pub iris: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub literals: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub links: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub geo: Option<GeoPoint>,
    #[serde(default)]
    pub temporal: Option<TemporalBounds>,
    #[serde(default)]
    pub parent: Option<EntityId>,
    #[serde(default)]
    pub structural_refs: Vec<EntityId>,
    #[serde(default)]
    pub publisher: Option<EntityId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(kind: EntityKind, iri: impl Into<String>) -> Self {
        let iri = iri.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            source: source_for_resource(&iri),
            iris: vec![iri],
            types: Vec::new(),
            literals: BTreeMap::new(),
            links: BTreeMap::new(),
            geo: None,
            temporal: None,
            parent: None,
            structural_refs: Vec::new(),
            publisher: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_literal(mut self, predicate: &str, value: impl Into<String>) -> Self {
        self.literals
            .entry(predicate.to_string())
            .or_default()
            .push(value.into());
        self
    }

    pub fn with_link(mut self, predicate: &str, iri: impl Into<String>) -> Self {
        self.links
            .entry(predicate.to_string())
            .or_default()
            .push(iri.into());
        self
    }

    pub fn with_type(mut self, class: impl Into<String>) -> Self {
        self.types.push(class.into());
        self
    }

    pub fn urn(&self) -> String {
        uuid_urn(self.id)
    }

    pub fn primary_iri(&self) -> String {
        self.iris.first().cloned().unwrap_or_else(|| self.urn())
    }

    pub fn literals_for(&self, predicate: &str) -> &[String] {
        self.literals.get(predicate).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn links_for(&self, predicate: &str) -> &[String] {
        self.links.get(predicate).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First value of the most preferred label predicate.
    pub fn label(&self) -> Option<&str> {
        vocab::LABEL_PREDICATES
            .iter()
            .find_map(|p| self.literals_for(p).first())
            .map(String::as_str)
    }

    pub fn description(&self) -> Option<&str> {
        vocab::DESCRIPTION_PREDICATES
            .iter()
            .find_map(|p| self.literals_for(p).first())
            .map(String::as_str)
    }

    /// Every literal as a weighted text field, in predicate order.
    pub fn weighted_fields(&self) -> Vec<WeightedText> {
        self.literals
            .iter()
            .flat_map(|(predicate, values)| {
                let weight = vocab::predicate_weight(predicate);
                values.iter().map(move |v| WeightedText::new(v.clone(), weight))
            })
            .collect()
    }

    pub fn declared_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.types.iter().map(String::as_str).collect();
        if let Some(class) = self.kind.implied_class() {
            if !types.contains(&class) {
                types.push(class);
            }
        }
        types
    }

    /// Stub kind implied by the declared types, if any table entry matches.
    pub fn inferred_kind(&self) -> Option<StubKind> {
        vocab::kind_for_types(self.declared_types())
    }

    pub fn same_as(&self) -> &[String] {
        self.links_for(vocab::OWL_SAME_AS)
    }

    pub fn is_publisher(&self) -> bool {
        matches!(self.kind, EntityKind::Publisher | EntityKind::User)
    }
}

/// Wire form of an entity accepted by ingest.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityDocument {
    pub iris: Vec<String>,
    pub kind: EntityKind,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub literals: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub links: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub geo: Option<GeoPoint>,
    #[serde(default)]
    pub temporal: Option<TemporalBounds>,
    #[serde(default)]
    pub parent: Option<EntityId>,
    #[serde(default)]
    pub structural_refs: Vec<EntityId>,
    #[serde(default)]
    pub publisher: Option<EntityId>,
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("malformed entity document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("entity document has no resource identifiers")]
    NoIdentifiers,
}

impl EntityDocument {
    pub fn parse(bytes: &[u8]) -> Result<Self, DocumentError> {
        let doc: EntityDocument = serde_json::from_slice(bytes)?;
        if doc.iris.is_empty() {
            return Err(DocumentError::NoIdentifiers);
        }
        Ok(doc)
    }

    /// Materialize as an entity; `extra_iri` is the URI it was fetched from.
    pub fn into_entity(self, id: EntityId, extra_iri: Option<&str>, now: DateTime<Utc>) -> Entity {
        let mut iris = self.iris;
        if let Some(extra) = extra_iri {
            if !iris.iter().any(|i| i == extra) {
                iris.push(extra.to_string());
            }
        }
        let source = self
            .source
            .unwrap_or_else(|| source_for_resource(iris.first().map(String::as_str).unwrap_or("")));
        Entity {
            id,
            kind: self.kind,
            source,
            iris,
            types: self.types,
            literals: self.literals,
            links: self.links,
            geo: self.geo,
            temporal: self.temporal,
            parent: self.parent,
            structural_refs: self.structural_refs,
            publisher: self.publisher,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One evidence assertion for an anchor stub. The anchor itself is held by the owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingRecord {
    pub resource: String,
    pub resource_entity: Option<EntityId>,
    /// The evaluated entity whose evaluation produced the record.
    pub related_entity: Option<EntityId>,
    pub source: String,
    pub match_type: MatchType,
    pub confidence: u8,
    pub priority: u32,
    pub title: Option<String>,
    pub local: bool,
}

impl MappingRecord {
    pub fn new(resource: impl Into<String>, match_type: MatchType, confidence: u8) -> Self {
        let resource = resource.into();
        Self {
            source: source_for_resource(&resource),
            resource,
            resource_entity: None,
            related_entity: None,
            match_type,
            confidence: confidence.min(100),
            priority: DEFAULT_PRIORITY,
            title: None,
            local: false,
        }
    }

    pub fn for_entity(entity: &Entity, match_type: MatchType, confidence: u8) -> Self {
        let mut record = Self::new(entity.primary_iri(), match_type, confidence);
        record.resource_entity = Some(entity.id);
        record.source = entity.source.clone();
        record.title = entity.label().map(str::to_string);
        record
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_related(mut self, related: EntityId) -> Self {
        self.related_entity = Some(related);
        self
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    /// Evidence that does not stand for a genuinely ingested member of the anchor.
    pub fn is_transient(&self, transient_sources: &[String]) -> bool {
        match (self.related_entity, self.resource_entity) {
            (Some(related), Some(resolved)) => related != resolved,
            (Some(_), None) => true,
            (None, _) => transient_sources.iter().any(|s| s == &self.source),
        }
    }
}

/// Reference counters persisted with a stub and used for ranking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCounts {
    pub inbound: u32,
    pub outbound: u32,
    pub structural: u32,
    pub adjusted: u32,
}

impl RefCounts {
    pub fn compute(inbound: u32, outbound: u32, structural: u32, score: f64) -> Self {
        let total = f64::from(inbound) + f64::from(outbound);
        let adjusted = ((total - f64::from(structural)) * score).floor().max(0.0) as u32;
        Self {
            inbound,
            outbound,
            structural,
            adjusted,
        }
    }
}

/// The canonical merged record for one distinct thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stub {
    pub id: StubId,
    pub kind: StubKind,
    pub title: Option<String>,
    pub description: Option<String>,
    pub types: BTreeSet<String>,
    pub score: f64,
    pub parent: Option<StubId>,
    pub superior: BTreeSet<StubId>,
    pub structural_refs: BTreeSet<StubId>,
    pub related_stubs: BTreeSet<StubId>,
    pub tags: BTreeSet<String>,
    pub publishers: BTreeSet<StubId>,
    pub is_publisher: bool,
    /// Cross-reference predicate to target IRIs.
    pub references: BTreeMap<String, BTreeSet<String>>,
    pub geo: Option<GeoPoint>,
    pub temporal: Option<TemporalBounds>,
    pub depictions: Vec<String>,
    pub thumbnail: Option<String>,
    pub full_text: Vec<String>,
    pub visible: bool,
    pub refs: RefCounts,
}

impl Stub {
    pub fn draft(id: StubId) -> Self {
        Self {
            id,
            kind: StubKind::Thing,
            title: None,
            description: None,
            types: BTreeSet::new(),
            score: 1.0,
            parent: None,
            superior: BTreeSet::new(),
            structural_refs: BTreeSet::new(),
            related_stubs: BTreeSet::new(),
            tags: BTreeSet::new(),
            publishers: BTreeSet::new(),
            is_publisher: false,
            references: BTreeMap::new(),
            geo: None,
            temporal: None,
            depictions: Vec::new(),
            thumbnail: None,
            full_text: Vec::new(),
            visible: true,
            refs: RefCounts::default(),
        }
    }

    pub fn iri(&self) -> String {
        uuid_urn(self.id)
    }

    pub fn add_reference(&mut self, predicate: &str, target: impl Into<String>) {
        self.references
            .entry(predicate.to_string())
            .or_default()
            .insert(target.into());
    }

    pub fn push_full_text(&mut self, text: &str) {
        let text = text.trim();
        if !text.is_empty() && !self.full_text.iter().any(|t| t == text) {
            self.full_text.push(text.to_string());
        }
    }

    /// Enforce parent ⊂ superior ⊂ structural ⊂ related and drop self references.
    pub fn normalize_references(&mut self) {
        if let Some(parent) = self.parent {
            self.superior.insert(parent);
        }
        let own = self.id;
        self.superior.remove(&own);
        self.structural_refs.extend(self.superior.iter().copied());
        self.structural_refs.remove(&own);
        self.related_stubs.extend(self.structural_refs.iter().copied());
        self.related_stubs.remove(&own);
        if self.parent == Some(own) {
            self.parent = None;
        }
    }

    pub fn norm_title(&self) -> Option<String> {
        self.title.as_ref().map(|t| {
            t.to_lowercase()
                .chars()
                .map(|c| if c.is_alphanumeric() { c } else { '-' })
                .collect()
        })
    }

    pub fn sort_char(&self) -> char {
        self.title
            .as_deref()
            .and_then(|t| t.chars().find(|c| c.is_alphabetic()))
            .map(|c| c.to_lowercase().next().unwrap_or(c))
            .unwrap_or('*')
    }

    pub fn outbound(&self) -> u32 {
        self.related_stubs.len() as u32
    }
}

/// A stub as persisted, with store-owned timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredStub {
    pub stub: Stub,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Opaque token guarding a dirty marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(String);

impl Nonce {
    pub fn generate() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(raw[..16].to_string())
    }

    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A dirty work item handed to a worker together with the nonce it must present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingItem {
    pub id: Uuid,
    pub kind: WorkKind,
    pub nonce: Nonce,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCallback {
    #[serde(default)]
    pub evaluate: bool,
    #[serde(default)]
    pub reevaluate: BTreeSet<EntityId>,
    #[serde(default)]
    pub regenerate: BTreeSet<StubId>,
}

impl IngestCallback {
    pub fn merge(&mut self, other: &IngestCallback) {
        self.evaluate |= other.evaluate;
        self.reevaluate.extend(other.reevaluate.iter().copied());
        self.regenerate.extend(other.regenerate.iter().copied());
    }
}

/// A fetch that must happen before some evaluation can complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestEntry {
    pub anchor: Uuid,
    pub uri: String,
    pub scheduled_at: DateTime<Utc>,
    pub callback: IngestCallback,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerCounts {
    pub dirty: u64,
    pub clean: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub tracker: BTreeMap<String, TrackerCounts>,
    pub entities: BTreeMap<String, u64>,
    pub stubs: BTreeMap<String, u64>,
    pub indexed_documents: u64,
    pub ingest_pending: u64,
    pub ingest_anchors: u64,
}

pub fn uuid_urn(id: Uuid) -> String {
    format!("urn:uuid:{id}")
}

pub fn parse_uuid_urn(iri: &str) -> Option<Uuid> {
    iri.strip_prefix("urn:uuid:")
        .and_then(|rest| Uuid::parse_str(rest).ok())
}

pub fn time_period_iri(year: i32) -> String {
    format!("{TIME_IRI_PREFIX}{year:04}")
}

/// Stable fallback anchor for an entity that has none recorded.
pub fn default_anchor_for(entity: EntityId) -> StubId {
    Uuid::new_v5(&DEFAULT_ANCHOR_NAMESPACE, entity.as_bytes())
}

/// Provider identifier for a resource IRI.
pub fn source_for_resource(iri: &str) -> String {
    if iri.starts_with("urn:uuid:") {
        return INTERNAL_SOURCE.to_string();
    }
    if iri.starts_with(TIME_IRI_PREFIX) {
        return TIME_SOURCE.to_string();
    }
    match url::Url::parse(iri) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => format!("{}://{}/", parsed.scheme(), host),
            None => iri.to_string(),
        },
        Err(_) => iri.to_string(),
    }
}

/// Host part of an IRI, lower-cased, for allow-list comparisons.
pub fn host_of(iri: &str) -> Option<String> {
    url::Url::parse(iri)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
}
