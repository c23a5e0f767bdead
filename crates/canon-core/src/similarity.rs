//! Weighted bag-of-phrases similarity between two records.
//!
//! Each document is split into phrases and terms; per term we keep its frequency,
//! successor frequencies and phrase-end count. The shorter document (fewer distinct
//! terms) is scored against the longer one, so the result reads as "how much of the
//! sample is explained by the corpus".

use std::collections::BTreeMap;

use rphonetic::{DoubleMetaphone, Encoder};
use unicode_normalization::UnicodeNormalization;

/// Successor key standing for "the phrase ends after this term".
const PHRASE_END: &str = "";

const STOPWORDS: &[&str] = &[
    "a", "about", "above", "across", "after", "afterwards", "again", "against", "all", "almost",
    "alone", "along", "already", "also", "although", "always", "am", "among", "amongst",
    "amoungst", "amount", "an", "and", "another", "any", "anyhow", "anyone", "anything", "anyway",
    "anywhere", "are", "around", "as", "at", "back", "be", "became", "because", "become",
    "becomes", "becoming", "been", "before", "beforehand", "behind", "being", "below", "beside",
    "besides", "between", "beyond", "bill", "both", "bottom", "but", "by", "call", "can", "cannot",
    "cant", "co", "con", "could", "couldnt", "cry", "de", "describe", "detail", "do", "done",
    "down", "due", "during", "each", "eg", "eight", "either", "eleven", "else", "elsewhere",
    "empty", "enough", "etc", "even", "ever", "every", "everyone", "everything", "everywhere",
    "except", "few", "fifteen", "fify", "fill", "find", "fire", "first", "five", "for", "former",
    "formerly", "forty", "found", "four", "from", "front", "full", "further", "get", "give", "go",
    "had", "has", "hasnt", "have", "he", "hence", "her", "here", "hereafter", "hereby", "herein",
    "hereupon", "hers", "herself", "him", "himself", "his", "how", "however", "hundred", "ie",
    "if", "in", "inc", "indeed", "interest", "into", "is", "it", "its", "itself", "keep", "last",
    "latter", "latterly", "least", "less", "ltd", "made", "many", "may", "me", "meanwhile",
    "might", "mill", "mine", "more", "moreover", "most", "mostly", "move", "much", "must", "my",
    "myself", "name", "namely", "neither", "never", "nevertheless", "next", "nine", "no",
    "nobody", "none", "noone", "nor", "not", "nothing", "now", "nowhere", "of", "off", "often",
    "on", "once", "one", "only", "onto", "or", "other", "others", "otherwise", "our", "ours",
    "ourselves", "out", "over", "own", "part", "per", "perhaps", "please", "put", "rather", "re",
    "same", "see", "seem", "seemed", "seeming", "seems", "serious", "several", "she", "should",
    "show", "side", "since", "sincere", "six", "sixty", "so", "some", "somehow", "someone",
    "something", "sometime", "sometimes", "somewhere", "still", "such", "system", "take", "ten",
    "than", "that", "the", "their", "them", "themselves", "then", "thence", "there", "thereafter",
    "thereby", "therefore", "therein", "thereupon", "these", "they", "thick", "thin", "third",
    "this", "those", "though", "three", "through", "throughout", "thru", "thus", "to", "together",
    "too", "top", "toward", "towards", "twelve", "twenty", "two", "un", "under", "until", "up",
    "upon", "us", "very", "via", "was", "we", "well", "were", "what", "whatever", "when", "whence",
    "whenever", "where", "whereafter", "whereas", "whereby", "wherein", "whereupon", "wherever",
    "whether", "which", "while", "whither", "who", "whoever", "whole", "whom", "whose", "why",
    "will", "with", "within", "without", "would", "yet", "you", "your", "yours", "yourself",
    "yourselves",
];

/// A text field and the weight of the predicate it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedText {
    pub text: String,
    pub weight: f64,
}

impl WeightedText {
    pub fn new(text: impl Into<String>, weight: f64) -> Self {
        Self {
            text: text.into(),
            weight,
        }
    }
}

impl From<&str> for WeightedText {
    fn from(text: &str) -> Self {
        Self::new(text, 1.0)
    }
}

#[derive(Debug, Clone)]
struct Phrase {
    weight: f64,
    terms: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct TermStats {
    freq: f64,
    weight: f64,
    value: f64,
    /// Successor term to frequency; `PHRASE_END` counts phrase endings.
    next: BTreeMap<String, f64>,
}

pub struct SimilarityScorer {
    phonetic: Option<DoubleMetaphone>,
}

impl Default for SimilarityScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimilarityScorer {
    pub fn new() -> Self {
        Self {
            phonetic: Some(DoubleMetaphone::default()),
        }
    }

    /// Compare literal tokens only, without phonetic folding.
    pub fn literal() -> Self {
        Self { phonetic: None }
    }

    /// Score in [0, 100]: how much of the shorter document the longer one explains.
    pub fn score(&self, a: &[WeightedText], b: &[WeightedText]) -> u8 {
        let mut doc_a = evaluate_terms(&self.phrases(a));
        let mut doc_b = evaluate_terms(&self.phrases(b));
        if doc_a.is_empty() || doc_b.is_empty() {
            return 0;
        }
        if doc_a.len() > doc_b.len() {
            std::mem::swap(&mut doc_a, &mut doc_b);
        }
        let ratio = doc_a.len() as f64 / doc_b.len() as f64;
        adjust_frequencies(&mut doc_a);
        adjust_frequencies(&mut doc_b);

        let (matched, possible) = score_term_lists(&doc_a, &doc_b, ratio);
        if possible <= 0.0 {
            return 0;
        }
        (matched * 100.0 / possible).round().clamp(0.0, 100.0) as u8
    }

    fn phrases(&self, fields: &[WeightedText]) -> Vec<Phrase> {
        let mut phrases = Vec::new();
        for field in fields {
            for raw in normalize(&field.text).split('\n') {
                let terms: Vec<String> = raw
                    .split(' ')
                    .filter(|w| !w.is_empty() && *w != "-")
                    .filter(|w| !looks_like_uuid(w) && !STOPWORDS.contains(w))
                    .filter_map(|w| self.fold(w))
                    .collect();
                if !terms.is_empty() {
                    phrases.push(Phrase {
                        weight: field.weight,
                        terms,
                    });
                }
            }
        }
        phrases
    }

    fn fold(&self, word: &str) -> Option<String> {
        match &self.phonetic {
            Some(encoder) => {
                let code = encoder.encode(word);
                (!code.is_empty()).then_some(code)
            }
            None => Some(word.to_string()),
        }
    }
}

/// Fold to lower-case ASCII, turn punctuation into phrase breaks and everything
/// outside `[0-9a-z-]` into spaces.
fn normalize(text: &str) -> String {
    let folded: String = text
        .nfkd()
        .filter(|c| c.is_ascii())
        .filter(|c| *c != '\'')
        .collect();
    folded
        .chars()
        .map(|c| match c {
            '(' | ')' | ',' | '.' | '"' | '\r' => '\n',
            '\t' => ' ',
            c => c.to_ascii_lowercase(),
        })
        .map(|c| {
            if c.is_ascii_digit() || c.is_ascii_lowercase() || c == '-' || c == '\n' {
                c
            } else {
                ' '
            }
        })
        .collect()
}

fn looks_like_uuid(word: &str) -> bool {
    let hex: String = word.chars().filter(|c| *c != '-').collect();
    hex.len() == 32 && hex.chars().all(|c| c.is_ascii_hexdigit())
}

fn evaluate_terms(phrases: &[Phrase]) -> BTreeMap<String, TermStats> {
    let mut terms: BTreeMap<String, TermStats> = BTreeMap::new();
    for phrase in phrases {
        for (i, term) in phrase.terms.iter().enumerate() {
            let stats = terms.entry(term.clone()).or_default();
            stats.freq += 1.0;
            stats.weight = stats.weight.max(phrase.weight);
            let successor = phrase
                .terms
                .get(i + 1)
                .map(String::as_str)
                .unwrap_or(PHRASE_END);
            stats.next.entry(PHRASE_END.to_string()).or_insert(0.0);
            *stats.next.entry(successor.to_string()).or_insert(0.0) += 1.0;
        }
    }
    terms
}

fn adjust_frequencies(terms: &mut BTreeMap<String, TermStats>) {
    let max_freq = terms.values().map(|t| t.freq).fold(0.0, f64::max);
    for stats in terms.values_mut() {
        stats.value = if max_freq > 0.0 { stats.freq / max_freq } else { 0.0 };
        let max_next = stats.next.values().copied().fold(0.0, f64::max);
        if max_next > 0.0 {
            for v in stats.next.values_mut() {
                *v /= max_next;
            }
        }
    }
}

fn boosted(weight: f64, ratio: f64) -> f64 {
    (weight.powf(1.0 + 3.0 * ratio) * 1f64.sin()).asin()
}

fn score_term_lists(
    sample: &BTreeMap<String, TermStats>,
    corpus: &BTreeMap<String, TermStats>,
    ratio: f64,
) -> (f64, f64) {
    let mut matched = 0.0;
    let mut possible = 0.0;
    for (term, stats) in sample {
        let weight = boosted(stats.weight, ratio);
        possible += weight;
        let counterpart = corpus.get(term);
        let scale = match counterpart {
            Some(other) => {
                matched += other.value * weight;
                boosted(other.weight, ratio)
            }
            None => weight,
        };
        for (successor, freq) in &stats.next {
            possible += freq * weight * scale;
            if let Some(shared) = counterpart.and_then(|c| c.next.get(successor)) {
                matched += freq * shared * weight * scale;
            }
        }
    }
    (matched, possible)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(values: &[&str]) -> Vec<WeightedText> {
        values.iter().map(|v| WeightedText::from(*v)).collect()
    }

    #[test]
    fn identical_labels_score_full_marks() {
        let scorer = SimilarityScorer::new();
        assert_eq!(scorer.score(&texts(&["Big Ben"]), &texts(&["Big Ben"])), 100);
    }

    #[test]
    fn empty_documents_score_zero() {
        let scorer = SimilarityScorer::new();
        assert_eq!(scorer.score(&texts(&["the of and"]), &texts(&["Big Ben"])), 0);
        assert_eq!(scorer.score(&[], &texts(&["Big Ben"])), 0);
    }

    #[test]
    fn containing_corpus_beats_unrelated_corpus() {
        let scorer = SimilarityScorer::new();
        let sample = texts(&["London"]);
        let related = scorer.score(
            &sample,
            &texts(&["London, England is the capital city of England"]),
        );
        let unrelated = scorer.score(&sample, &texts(&["A village in Kent"]));
        assert!(related > unrelated, "{related} <= {unrelated}");
    }

    #[test]
    fn scoring_is_symmetric_in_argument_order() {
        let scorer = SimilarityScorer::new();
        let a = texts(&["Palace of Westminster"]);
        let b = texts(&["Westminster Palace clock tower, London"]);
        assert_eq!(scorer.score(&a, &b), scorer.score(&b, &a));
    }

    #[test]
    fn partial_overlap_scores_in_the_exact_band() {
        // The three-term side is scored: 5.5 of a possible 6.5.
        let scorer = SimilarityScorer::literal();
        let a = texts(&["Big Ben", "Clock tower"]);
        let b = texts(&["Big Ben", "Big Ben tower", "Ben tower"]);
        let score = scorer.score(&a, &b);
        assert_eq!(score, 85);
        assert_eq!(scorer.score(&b, &a), 85);
        assert_eq!(
            crate::MatchType::from_confidence(score),
            crate::MatchType::ExactMatch
        );
    }

    #[test]
    fn phonetic_folding_tolerates_spelling_variants() {
        let a = texts(&["Smith"]);
        let b = texts(&["Smyth"]);
        assert_eq!(SimilarityScorer::new().score(&a, &b), 100);
        assert_eq!(SimilarityScorer::literal().score(&a, &b), 0);
    }

    #[test]
    fn normalization_strips_punctuation_and_uuids() {
        let scorer = SimilarityScorer::literal();
        let phrases = scorer.phrases(&texts(&[
            "Big Ben's tower (London) 6b1d43a2-8f0e-5c71-9a44-0d2ee1b73c58",
        ]));
        let terms: Vec<Vec<String>> = phrases.into_iter().map(|p| p.terms).collect();
        assert_eq!(
            terms,
            vec![
                vec!["big".to_string(), "bens".to_string(), "tower".to_string()],
                vec!["london".to_string()],
            ]
        );
    }

    #[test]
    fn accents_fold_to_ascii() {
        assert_eq!(normalize("Café"), "cafe");
    }

    #[test]
    fn heavier_fields_dominate() {
        let scorer = SimilarityScorer::literal();
        let sample = vec![
            WeightedText::new("Westminster", 1.0),
            WeightedText::new("clock", 0.6),
        ];
        let label_hit = scorer.score(&sample, &texts(&["Westminster bridge road"]));
        let minor_hit = scorer.score(&sample, &texts(&["clock bridge road"]));
        assert!(label_hit > minor_hit);
    }
}
