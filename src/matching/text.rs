// src/matching/text.rs
//
// Text similarity engine: cosine similarity over weighted term-frequency
// vectors built from a report's title and description. Hazard vocabulary is
// boosted so two reports sharing "pothole" count for more than two reports
// sharing "street".

use log::{trace, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, LazyLock};

/// Weight of a token found in the hazard vocabulary
pub const IMPORTANT_TERM_WEIGHT: f64 = 2.0;
/// Weight of every other token
pub const DEFAULT_TERM_WEIGHT: f64 = 1.0;
/// Tokens this short or shorter are dropped
const MAX_DROPPED_TOKEN_LENGTH: usize = 2;
/// Matched important terms beyond this count do not raise confidence further
const IMPORTANT_MATCH_CAP: usize = 3;
const IMPORTANT_MATCH_BONUS: f64 = 0.1;
const MAX_IMPORTANT_MATCH_BONUS: f64 = 0.3;

// Confidence blend
const SIMILARITY_SHARE: f64 = 0.6;
const LENGTH_RATIO_SHARE: f64 = 0.2;
const IMPORTANT_TERM_SHARE: f64 = 0.2;

const STOP_WORDS: [&str; 64] = [
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "him", "his", "how", "its", "may", "who", "did", "get", "let",
    "put", "say", "she", "too", "use", "this", "that", "with", "have", "from", "they", "will",
    "been", "were", "there", "their", "what", "when", "where", "which", "while", "would",
    "could", "should", "about", "into", "than", "then", "them", "these", "those", "some",
    "very", "just", "also", "near", "here", "please",
];

// Hazard-domain vocabulary. Stemmed with the same stemmer as report text.
const HAZARD_TERMS: [&str; 56] = [
    "pothole", "crack", "sinkhole", "collapse", "flood", "flooding", "leak", "burst", "pipe",
    "water", "sewage", "overflow", "drain", "manhole", "fire", "smoke", "gas", "spill",
    "chemical", "toxic", "debris", "fallen", "tree", "branch", "power", "outage", "wire",
    "electrical", "streetlight", "signal", "traffic", "accident", "collision", "injury",
    "hazard", "danger", "dangerous", "damage", "broken", "blocked", "obstruction", "landslide",
    "erosion", "ice", "snow", "storm", "bridge", "sidewalk", "vandalism", "graffiti", "glass",
    "exposed", "unstable", "emergency", "animal", "dead",
];

// Abbreviations common in street-level reports, expanded before tokenizing
const ABBREVIATIONS: [(&str, &str); 7] = [
    (r"\brd\b", "road"),
    (r"\bst\b", "street"),
    (r"\bave\b", "avenue"),
    (r"\bblvd\b", "boulevard"),
    (r"\bhwy\b", "highway"),
    (r"\bxing\b", "crossing"),
    (r"\bintersec\b", "intersection"),
];

// Longest suffixes first; only the first match is applied
const SUFFIX_RULES: [(&str, &str); 14] = [
    ("ational", "ate"),
    ("ization", "ize"),
    ("fulness", "ful"),
    ("iveness", "ive"),
    ("ements", ""),
    ("ement", ""),
    ("ments", ""),
    ("ment", ""),
    ("ness", ""),
    ("ings", ""),
    ("ing", ""),
    ("edly", ""),
    ("ies", "y"),
    ("ed", ""),
];

static ABBREVIATION_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    ABBREVIATIONS
        .iter()
        .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
            Ok(re) => Some((re, *replacement)),
            Err(e) => {
                warn!("Invalid regex pattern: '{}'. Error: {}", pattern, e);
                None
            }
        })
        .collect()
});

static STOP_WORD_SET: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| STOP_WORDS.iter().copied().collect());

static HAZARD_STEMS: LazyLock<HashSet<String>> =
    LazyLock::new(|| HAZARD_TERMS.iter().map(|t| stem(t)).collect());

//------------------------------------------------------------------------------
// PIPELINE STEPS
//------------------------------------------------------------------------------

/// Lowercase, expand abbreviations, replace punctuation with spaces and collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase();

    let without_punctuation: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    let mut expanded = without_punctuation;
    for (re, replacement) in ABBREVIATION_PATTERNS.iter() {
        expanded = re.replace_all(&expanded, *replacement).into_owned();
    }

    expanded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split normalized text into tokens, dropping short tokens and stop words.
pub fn tokenize(normalized: &str) -> Vec<&str> {
    normalized
        .split_whitespace()
        .filter(|t| t.chars().count() > MAX_DROPPED_TOKEN_LENGTH)
        .filter(|t| !STOP_WORD_SET.contains(*t))
        .collect()
}

/// Light suffix-stripping stemmer.
///
/// Not linguistically exact; the only guarantees are that it is deterministic
/// and that common inflections of a word ("flood", "floods", "flooded",
/// "flooding") land on the same stem.
pub fn stem(token: &str) -> String {
    let mut word = token.to_string();
    let min_stem = 3;

    let mut stripped_verbal = false;
    let mut applied = false;
    for (suffix, replacement) in SUFFIX_RULES.iter() {
        if let Some(base) = word.strip_suffix(suffix) {
            if base.chars().count() >= min_stem {
                stripped_verbal = matches!(*suffix, "ing" | "ings" | "ed" | "edly");
                word = format!("{}{}", base, replacement);
                applied = true;
                break;
            }
        }
    }

    // Plurals: "ches"/"shes"/"xes"/"sses"/"zes" lose "es", other words lose a single "s"
    if !applied {
        let sibilant_plural = ["sses", "ches", "shes", "xes", "zes"]
            .iter()
            .any(|s| word.ends_with(s));
        if sibilant_plural && word.chars().count() - 2 >= min_stem {
            word.truncate(word.len() - 2);
        } else if word.ends_with('s')
            && !word.ends_with("ss")
            && !word.ends_with("us")
            && word.chars().count() - 1 >= min_stem
        {
            word.truncate(word.len() - 1);
        }
    }

    // "stopped" -> "stopp" -> "stop"; keep ll/ss/zz
    if stripped_verbal {
        let chars: Vec<char> = word.chars().collect();
        let n = chars.len();
        if n > min_stem
            && chars[n - 1] == chars[n - 2]
            && !matches!(chars[n - 1], 'l' | 's' | 'z')
            && !is_vowel(chars[n - 1])
        {
            word.pop();
        }
    }

    // Drop a trailing silent "e" so "damage" and "damaged" agree
    if word.chars().count() > min_stem && word.ends_with('e') {
        word.pop();
    }

    word
}

fn is_vowel(c: char) -> bool {
    matches!(c, 'a' | 'e' | 'i' | 'o' | 'u')
}

/// Whether a stemmed term belongs to the hazard vocabulary
pub fn is_important_term(stemmed: &str) -> bool {
    HAZARD_STEMS.contains(stemmed)
}

//------------------------------------------------------------------------------
// DOCUMENT VECTOR
//------------------------------------------------------------------------------

/// Weighted term-frequency vector for one piece of text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentVector {
    /// Stemmed term -> accumulated weight. Ordered so dot products are summed
    /// in the same order regardless of argument order.
    pub terms: BTreeMap<String, f64>,
    pub magnitude: f64,
    pub important_terms: BTreeSet<String>,
}

impl DocumentVector {
    pub fn from_text(text: &str) -> Self {
        let normalized = normalize_text(text);
        let mut vector = DocumentVector::default();
        let mut sum_of_squares = 0.0;

        for token in tokenize(&normalized) {
            let stemmed = stem(token);
            let weight = if is_important_term(&stemmed) {
                vector.important_terms.insert(stemmed.clone());
                IMPORTANT_TERM_WEIGHT
            } else {
                DEFAULT_TERM_WEIGHT
            };

            let entry = vector.terms.entry(stemmed).or_insert(0.0);
            let previous = *entry;
            *entry += weight;
            sum_of_squares += (*entry * *entry) - (previous * previous);
        }

        vector.magnitude = sum_of_squares.max(0.0).sqrt();
        vector
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn dot(&self, other: &DocumentVector) -> f64 {
        // Walk the smaller map, but always in key order
        let (small, large) = if self.terms.len() <= other.terms.len() {
            (self, other)
        } else {
            (other, self)
        };
        small
            .terms
            .iter()
            .filter_map(|(term, w)| large.terms.get(term).map(|v| w * v))
            .sum()
    }

    pub fn cosine_similarity(&self, other: &DocumentVector) -> f64 {
        if self.magnitude == 0.0 || other.magnitude == 0.0 {
            return 0.0;
        }
        (self.dot(other) / (self.magnitude * other.magnitude)).clamp(0.0, 1.0)
    }

    /// Important terms present in both vectors
    pub fn shared_important_terms(&self, other: &DocumentVector) -> Vec<String> {
        self.important_terms
            .intersection(&other.important_terms)
            .cloned()
            .collect()
    }
}

/// Caller-managed cache of vectors keyed by the exact input string.
///
/// Report text is immutable once submitted, so entries never need invalidation.
#[derive(Debug, Default)]
pub struct VectorCache {
    vectors: HashMap<String, Arc<DocumentVector>>,
    hits: usize,
    misses: usize,
}

impl VectorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(&mut self, text: &str) -> Arc<DocumentVector> {
        if let Some(v) = self.vectors.get(text) {
            self.hits += 1;
            return Arc::clone(v);
        }
        self.misses += 1;
        let vector = Arc::new(DocumentVector::from_text(text));
        self.vectors.insert(text.to_string(), Arc::clone(&vector));
        vector
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// (hits, misses)
    pub fn stats(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }
}

//------------------------------------------------------------------------------
// SIMILARITY
//------------------------------------------------------------------------------

/// Outcome of comparing two texts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSimilarity {
    /// Cosine similarity, 0-1
    pub similarity: f64,
    /// Trust in `similarity`, 0-1
    pub confidence: f64,
    /// Similarity plus a bonus for shared hazard vocabulary, capped at 1
    pub weighted_score: f64,
    pub matched_important_terms: Vec<String>,
}

impl TextSimilarity {
    fn none() -> Self {
        Self {
            similarity: 0.0,
            confidence: 0.0,
            weighted_score: 0.0,
            matched_important_terms: Vec::new(),
        }
    }

    fn identical() -> Self {
        Self {
            similarity: 1.0,
            confidence: 1.0,
            weighted_score: 1.0,
            matched_important_terms: Vec::new(),
        }
    }
}

/// Compare two texts without caching.
pub fn calculate_similarity(text1: &str, text2: &str) -> TextSimilarity {
    match fast_path(text1, text2) {
        Some(result) => result,
        None => score_vectors(
            text1,
            text2,
            &DocumentVector::from_text(text1),
            &DocumentVector::from_text(text2),
        ),
    }
}

/// Compare two texts, reusing vectors from `cache`.
pub fn calculate_similarity_cached(
    text1: &str,
    text2: &str,
    cache: &mut VectorCache,
) -> TextSimilarity {
    match fast_path(text1, text2) {
        Some(result) => result,
        None => {
            let v1 = cache.get_or_build(text1);
            let v2 = cache.get_or_build(text2);
            score_vectors(text1, text2, &v1, &v2)
        }
    }
}

fn fast_path(text1: &str, text2: &str) -> Option<TextSimilarity> {
    let t1 = text1.trim();
    let t2 = text2.trim();
    if t1.is_empty() || t2.is_empty() {
        return Some(TextSimilarity::none());
    }
    if t1 == t2 {
        return Some(TextSimilarity::identical());
    }
    None
}

fn score_vectors(
    text1: &str,
    text2: &str,
    v1: &DocumentVector,
    v2: &DocumentVector,
) -> TextSimilarity {
    let similarity = v1.cosine_similarity(v2);
    let matched = v1.shared_important_terms(v2);

    let len1 = text1.chars().count() as f64;
    let len2 = text2.chars().count() as f64;
    let length_ratio = if len1.max(len2) > 0.0 {
        len1.min(len2) / len1.max(len2)
    } else {
        0.0
    };

    let matched_ratio = matched.len().min(IMPORTANT_MATCH_CAP) as f64 / IMPORTANT_MATCH_CAP as f64;
    let confidence = (SIMILARITY_SHARE * similarity
        + LENGTH_RATIO_SHARE * length_ratio
        + IMPORTANT_TERM_SHARE * matched_ratio)
        .clamp(0.0, 1.0);

    let bonus = (IMPORTANT_MATCH_BONUS * matched.len() as f64).min(MAX_IMPORTANT_MATCH_BONUS);
    let weighted_score = (similarity + bonus).min(1.0);

    trace!(
        "Text similarity {:.3} (confidence {:.3}, weighted {:.3}, important matches {:?})",
        similarity, confidence, weighted_score, matched
    );

    TextSimilarity {
        similarity,
        confidence,
        weighted_score,
        matched_important_terms: matched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_punctuation_and_expands_abbreviations() {
        assert_eq!(
            normalize_text("  Huge POTHOLE!!  on Main St.,   near 5th Ave "),
            "huge pothole on main street near 5th avenue"
        );
    }

    #[test]
    fn test_tokenize_drops_short_tokens_and_stop_words() {
        let normalized = normalize_text("The pothole is on a road near the park");
        assert_eq!(tokenize(&normalized), vec!["pothole", "road", "park"]);
    }

    #[test]
    fn test_stemmer_groups_inflections() {
        for word in ["flood", "floods", "flooded", "flooding"] {
            assert_eq!(stem(word), "flood", "word {}", word);
        }
        assert_eq!(stem("damage"), stem("damaged"));
        assert_eq!(stem("pothole"), stem("potholes"));
        assert_eq!(stem("leaking"), stem("leaks"));
        assert_eq!(stem("stopped"), "stop");
        assert_eq!(stem("branches"), stem("branch"));
        assert_eq!(stem("glass"), "glass");
        assert_eq!(stem("gas"), "gas");
    }

    #[test]
    fn test_stemmer_is_deterministic() {
        assert_eq!(stem("electrical"), stem("electrical"));
        assert_eq!(stem(&stem("flooding")), stem(&stem("flooding")));
    }

    #[test]
    fn test_vector_weights_important_terms() {
        let v = DocumentVector::from_text("pothole pothole street");
        assert_eq!(v.terms.get(&stem("pothole")), Some(&4.0));
        assert_eq!(v.terms.get("street"), Some(&1.0));
        assert!((v.magnitude - 17.0_f64.sqrt()).abs() < 1e-12);
        assert!(v.important_terms.contains(&stem("pothole")));
    }

    #[test]
    fn test_identical_text_fast_path() {
        let r = calculate_similarity("Water main burst", "  Water main burst ");
        assert_eq!(r.similarity, 1.0);
        assert_eq!(r.confidence, 1.0);
    }

    #[test]
    fn test_empty_text_scores_zero() {
        for (a, b) in [("", "fallen tree"), ("fallen tree", "   "), ("", "")] {
            let r = calculate_similarity(a, b);
            assert_eq!(r.similarity, 0.0);
            assert_eq!(r.confidence, 0.0);
        }
    }

    #[test]
    fn test_only_stop_words_scores_zero() {
        let r = calculate_similarity("the and for", "pothole on road");
        assert_eq!(r.similarity, 0.0);
    }

    #[test]
    fn test_similarity_is_symmetric() {
        let pairs = [
            ("Large pothole near Central Park", "Dangerous pothole on Main Road"),
            ("Burst water pipe flooding the street", "Street flooded after pipe burst"),
            ("Fallen tree blocking sidewalk", "Graffiti on the bridge"),
            ("Gas leak smell at corner", "Strong gas smell, possible leak near corner shop"),
        ];
        for (a, b) in pairs {
            let ab = calculate_similarity(a, b);
            let ba = calculate_similarity(b, a);
            assert_eq!(ab.similarity, ba.similarity, "{} / {}", a, b);
            assert_eq!(ab.confidence, ba.confidence);
            assert_eq!(ab.weighted_score, ba.weighted_score);
        }
    }

    #[test]
    fn test_related_reports_score_higher_than_unrelated() {
        let related = calculate_similarity(
            "Burst water pipe flooding the street",
            "Street flooded after water pipe burst",
        );
        let unrelated = calculate_similarity(
            "Burst water pipe flooding the street",
            "Graffiti on the library wall",
        );
        assert!(related.similarity > 0.7, "got {}", related.similarity);
        assert_eq!(unrelated.similarity, 0.0);
        assert!(related.confidence > unrelated.confidence);
    }

    #[test]
    fn test_weighted_score_bonus_is_capped() {
        let r = calculate_similarity(
            "flood fire smoke gas pothole debris street",
            "flood fire smoke gas pothole debris avenue",
        );
        assert_eq!(r.matched_important_terms.len(), 6);
        assert!(r.weighted_score <= 1.0);
        assert!((r.weighted_score - (r.similarity + 0.3).min(1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_confidence_blend() {
        let a = "pothole on elm";
        let b = "pothole by oak";
        let r = calculate_similarity(a, b);
        // vectors: {pothol:2, elm:1} vs {pothol:2, oak:1}
        let expected_sim = 4.0 / 5.0;
        assert!((r.similarity - expected_sim).abs() < 1e-12);
        let length_ratio = 14.0 / 14.0;
        let expected_conf = 0.6 * expected_sim + 0.2 * length_ratio + 0.2 * (1.0 / 3.0);
        assert!((r.confidence - expected_conf).abs() < 1e-12);
        assert!((r.weighted_score - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_cache_reuses_vectors() {
        let mut cache = VectorCache::new();
        let a = "Fallen tree blocking the road";
        let first = calculate_similarity_cached(a, "Tree fell across road", &mut cache);
        let second = calculate_similarity_cached(a, "Tree fell across road", &mut cache);
        assert_eq!(first, second);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats(), (2, 2));
        assert_eq!(first, calculate_similarity(a, "Tree fell across road"));
    }
}
