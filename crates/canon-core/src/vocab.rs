//! Predicate and class vocabulary, field weights and the type→kind table.

use crate::StubKind;

pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
pub const RDFS_LABEL: &str = "http://www.w3.org/2000/01/rdf-schema#label";
pub const RDFS_COMMENT: &str = "http://www.w3.org/2000/01/rdf-schema#comment";
pub const OWL_SAME_AS: &str = "http://www.w3.org/2002/07/owl#sameAs";
pub const OWL_THING: &str = "http://www.w3.org/2002/07/owl#Thing";

pub const SKOS_PREF_LABEL: &str = "http://www.w3.org/2004/02/skos/core#prefLabel";
pub const SKOS_EXACT_MATCH: &str = "http://www.w3.org/2004/02/skos/core#exactMatch";
pub const SKOS_CLOSE_MATCH: &str = "http://www.w3.org/2004/02/skos/core#closeMatch";
pub const SKOS_NARROW_MATCH: &str = "http://www.w3.org/2004/02/skos/core#narrowMatch";
pub const SKOS_BROAD_MATCH: &str = "http://www.w3.org/2004/02/skos/core#broadMatch";
pub const SKOS_BROADER: &str = "http://www.w3.org/2004/02/skos/core#broader";
pub const SKOS_CONCEPT: &str = "http://www.w3.org/2004/02/skos/core#Concept";

pub const DCT_TITLE: &str = "http://purl.org/dc/terms/title";
pub const DCT_DESCRIPTION: &str = "http://purl.org/dc/terms/description";
pub const DCT_ABSTRACT: &str = "http://purl.org/dc/terms/abstract";
pub const DCT_CREATOR: &str = "http://purl.org/dc/terms/creator";
pub const DCT_PUBLISHER: &str = "http://purl.org/dc/terms/publisher";
pub const DCT_IS_PART_OF: &str = "http://purl.org/dc/terms/isPartOf";
pub const DCT_IS_VERSION_OF: &str = "http://purl.org/dc/terms/isVersionOf";
pub const DCT_SUBJECT: &str = "http://purl.org/dc/terms/subject";
pub const DCT_SPATIAL: &str = "http://purl.org/dc/terms/spatial";
pub const DC_TITLE: &str = "http://purl.org/dc/elements/1.1/title";
pub const DC_DESCRIPTION: &str = "http://purl.org/dc/elements/1.1/description";

pub const FOAF_NAME: &str = "http://xmlns.com/foaf/0.1/name";
pub const FOAF_PERSON: &str = "http://xmlns.com/foaf/0.1/Person";
pub const FOAF_AGENT: &str = "http://xmlns.com/foaf/0.1/Agent";
pub const FOAF_ORGANIZATION: &str = "http://xmlns.com/foaf/0.1/Organization";
pub const FOAF_DEPICTION: &str = "http://xmlns.com/foaf/0.1/depiction";
pub const FOAF_THUMBNAIL: &str = "http://xmlns.com/foaf/0.1/thumbnail";

pub const GN_NAME: &str = "http://www.geonames.org/ontology#name";
pub const GN_OFFICIAL_NAME: &str = "http://www.geonames.org/ontology#officialName";
pub const GN_ALTERNATE_NAME: &str = "http://www.geonames.org/ontology#alternateName";
pub const GN_FEATURE: &str = "http://www.geonames.org/ontology#Feature";
pub const GN_PARENT_FEATURE: &str = "http://www.geonames.org/ontology#parentFeature";
pub const GN_PARENT_ADM4: &str = "http://www.geonames.org/ontology#parentADM4";
pub const GN_PARENT_ADM3: &str = "http://www.geonames.org/ontology#parentADM3";
pub const GN_PARENT_ADM2: &str = "http://www.geonames.org/ontology#parentADM2";
pub const GN_PARENT_ADM1: &str = "http://www.geonames.org/ontology#parentADM1";
pub const GN_PARENT_COUNTRY: &str = "http://www.geonames.org/ontology#parentCountry";

pub const PO_SYNOPSIS_LONG: &str = "http://purl.org/ontology/po/long_synopsis";
pub const PO_SYNOPSIS_MEDIUM: &str = "http://purl.org/ontology/po/medium_synopsis";
pub const PO_SYNOPSIS_SHORT: &str = "http://purl.org/ontology/po/short_synopsis";
pub const PO_SERIES: &str = "http://purl.org/ontology/po/series";
pub const PO_BRAND: &str = "http://purl.org/ontology/po/brand";
pub const PO_EPISODE: &str = "http://purl.org/ontology/po/episode";
pub const PO_VERSION: &str = "http://purl.org/ontology/po/version";
pub const PO_PERSON: &str = "http://purl.org/ontology/po/Person";
pub const PO_BRAND_CLASS: &str = "http://purl.org/ontology/po/Brand";
pub const PO_SERIES_CLASS: &str = "http://purl.org/ontology/po/Series";
pub const PO_EPISODE_CLASS: &str = "http://purl.org/ontology/po/Episode";
pub const PO_VERSION_CLASS: &str = "http://purl.org/ontology/po/Version";
pub const PO_CLIP_CLASS: &str = "http://purl.org/ontology/po/Clip";
pub const PO_BROADCAST: &str = "http://purl.org/ontology/po/Broadcast";

pub const DBPEDIA_ABSTRACT: &str = "http://dbpedia.org/ontology/abstract";
pub const DBPEDIA_PLACE: &str = "http://dbpedia.org/ontology/Place";
pub const DBPEDIA_CITY: &str = "http://dbpedia.org/ontology/City";
pub const DBPEDIA_POPULATED_PLACE: &str = "http://dbpedia.org/ontology/PopulatedPlace";

pub const EVENT_EVENT: &str = "http://purl.org/NET/c4dm/event.owl#Event";
pub const SEM_EVENT: &str = "http://semanticweb.cs.vu.nl/2009/11/sem/Event";
pub const MO_PERFORMANCE_OF: &str = "http://purl.org/ontology/mo/performance_of";
pub const MO_PRODUCTION_OF: &str = "http://purl.org/ontology/mo/production_of";
pub const MO_RECORDING: &str = "http://purl.org/ontology/mo/Recording";
pub const TIME_DURATION: &str = "http://www.w3.org/2006/time#DurationDescription";

pub const FRBR_WORK: &str = "http://purl.org/vocab/frbr/core#Work";
pub const FRBR_PLACE: &str = "http://purl.org/vocab/frbr/core#Place";
pub const BIBO_BOOK: &str = "http://purl.org/ontology/bibo/Book";
pub const DCMI_COLLECTION: &str = "http://purl.org/dc/dcmitype/Collection";
pub const GML_FEATURE: &str = "http://www.opengis.net/gml/_Feature";
pub const VENUE: &str = "http://purl.org/ontology/places#Venue";
pub const EUROPEAN_REGION: &str = "http://statistics.data.gov.uk/def/administrative-geography/EuropeanRegion";

/// Label predicates in order of preference.
pub const LABEL_PREDICATES: &[&str] = &[
    SKOS_PREF_LABEL,
    GN_NAME,
    GN_OFFICIAL_NAME,
    GN_ALTERNATE_NAME,
    FOAF_NAME,
    RDFS_LABEL,
    DCT_TITLE,
    DC_TITLE,
];

pub const DESCRIPTION_PREDICATES: &[&str] = &[
    PO_SYNOPSIS_LONG,
    PO_SYNOPSIS_MEDIUM,
    PO_SYNOPSIS_SHORT,
    RDFS_COMMENT,
    DCT_DESCRIPTION,
    DBPEDIA_ABSTRACT,
    DC_DESCRIPTION,
];

/// Relative importance of a literal when scoring similarity.
pub fn predicate_weight(predicate: &str) -> f64 {
    if LABEL_PREDICATES.contains(&predicate) {
        1.0
    } else if DESCRIPTION_PREDICATES.contains(&predicate) || predicate == DCT_ABSTRACT {
        0.75
    } else {
        0.6
    }
}

const TYPE_KINDS: &[(&str, StubKind)] = &[
    (FRBR_WORK, StubKind::Thing),
    (BIBO_BOOK, StubKind::Thing),
    (PO_BRAND_CLASS, StubKind::Thing),
    (PO_SERIES_CLASS, StubKind::Thing),
    (PO_EPISODE_CLASS, StubKind::Thing),
    (PO_VERSION_CLASS, StubKind::Thing),
    (PO_CLIP_CLASS, StubKind::Thing),
    (EVENT_EVENT, StubKind::Event),
    (SEM_EVENT, StubKind::Event),
    (TIME_DURATION, StubKind::Event),
    (PO_BROADCAST, StubKind::Event),
    (MO_RECORDING, StubKind::Event),
    (DCMI_COLLECTION, StubKind::Collection),
    (FOAF_PERSON, StubKind::Person),
    (FOAF_AGENT, StubKind::Person),
    (FOAF_ORGANIZATION, StubKind::Person),
    (PO_PERSON, StubKind::Person),
    (EUROPEAN_REGION, StubKind::Place),
    (VENUE, StubKind::Place),
    (FRBR_PLACE, StubKind::Place),
    (GN_FEATURE, StubKind::Place),
    (DBPEDIA_PLACE, StubKind::Place),
    (DBPEDIA_CITY, StubKind::Place),
    (DBPEDIA_POPULATED_PLACE, StubKind::Place),
    (GML_FEATURE, StubKind::Place),
];

/// Consulted only when nothing in `TYPE_KINDS` matched.
const FALLBACK_TYPE_KINDS: &[(&str, StubKind)] = &[
    (SKOS_CONCEPT, StubKind::Collection),
    (OWL_THING, StubKind::Thing),
];

/// First table hit over the given classes, primary table before fallback.
pub fn kind_for_types<'a>(types: impl IntoIterator<Item = &'a str>) -> Option<StubKind> {
    let types: Vec<&str> = types.into_iter().collect();
    for table in [TYPE_KINDS, FALLBACK_TYPE_KINDS] {
        for (class, kind) in table {
            if types.contains(class) {
                return Some(*kind);
            }
        }
    }
    None
}

/// Predicates whose targets become cross-references between stubs.
pub const STUB_REF_PREDICATES: &[&str] = &[
    DCT_CREATOR,
    DCT_PUBLISHER,
    DCT_IS_PART_OF,
    DCT_SUBJECT,
    DCT_SPATIAL,
    SKOS_BROADER,
    GN_PARENT_FEATURE,
    GN_PARENT_ADM4,
    GN_PARENT_ADM3,
    GN_PARENT_ADM2,
    GN_PARENT_ADM1,
    GN_PARENT_COUNTRY,
    PO_SERIES,
    PO_BRAND,
    PO_EPISODE,
    PO_VERSION,
    MO_PERFORMANCE_OF,
    MO_PRODUCTION_OF,
];

/// Predicate a reference is stored under; `skos:broader` folds into `dct:isPartOf`.
pub fn stored_ref_predicate(predicate: &str) -> &str {
    if predicate == SKOS_BROADER {
        DCT_IS_PART_OF
    } else {
        predicate
    }
}

/// Parent predicates per stub kind, most specific first.
pub fn parent_predicates(kind: StubKind) -> &'static [&'static str] {
    match kind {
        StubKind::Place => &[
            GN_PARENT_FEATURE,
            GN_PARENT_ADM4,
            GN_PARENT_ADM3,
            GN_PARENT_ADM2,
            GN_PARENT_ADM1,
            GN_PARENT_COUNTRY,
        ],
        StubKind::Event => &[MO_PRODUCTION_OF],
        StubKind::Collection => &[DCT_IS_PART_OF, SKOS_BROADER],
        StubKind::Person | StubKind::Thing => &[],
    }
}

pub const SUPERIOR_PREDICATES: &[&str] = &[DCT_IS_PART_OF, DCT_IS_VERSION_OF];

pub const SCORE_DAMPING_PREDICATES: &[&str] = &[MO_PERFORMANCE_OF, MO_PRODUCTION_OF];

/// Provider prefixes trusted for equivalence expansion and opportunistic ingest.
pub const DEFAULT_EQUIVALENCE_ALLOW_LIST: &[&str] = &[
    "http://dbpedia.org/resource/",
    "http://dbpedialite.org/",
    "http://rdf.freebase.com/ns/",
    "http://www.bbc.co.uk/programmes/",
    "http://www.bbc.co.uk/nature/",
    "http://www.bbc.co.uk/music/",
    "http://data.nytimes.com/",
    "http://data.ordnancesurvey.co.uk/",
    "http://sws.geonames.org/",
];

/// Sources whose evidence never keeps a stub alive on its own.
pub const DEFAULT_TRANSIENT_SOURCES: &[&str] = &[
    "http://sws.geonames.org/",
    "http://dbpedialite.org/",
    "http://dbpedia.org/",
    "http://rdf.freebase.com/",
];
