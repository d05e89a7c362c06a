//! Keyword-derived justification scoring.
//!
//! A request earns a base score and a fixed bonus for every distinct cue
//! that explains why the action is needed.

use once_cell::sync::Lazy;
use regex::Regex;

const BASE: f64 = 0.3;
const PER_CUE: f64 = 0.15;

/// Cue name and the whole-word, case-insensitive pattern that detects it.
const CUES: &[(&str, &str)] = &[
    ("reason", r"(?i)\b(because|since|so that|in order to)\b"),
    ("requirement", r"(?i)\b(required|requires|must|mandatory)\b"),
    ("approval", r"(?i)\b(approved|authorized|signed off)\b"),
    ("ticket", r"(?i)(\bticket\b|\bjira\b|#\d+)"),
    ("compliance", r"(?i)\b(compliance|audit|regulatory|gdpr)\b"),
    ("customer", r"(?i)\b(customer|client|user) (request|requested|asked)\w*\b"),
    ("incident", r"(?i)\b(incident|outage|urgent|hotfix)\b"),
];

static CUE_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    CUES.iter()
        .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|re| (*name, re)))
        .collect()
});

/// Names of the cues present in `text`, in table order.
pub fn matched_cues(text: &str) -> Vec<&'static str> {
    CUE_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(name, _)| *name)
        .collect()
}

/// Score in `[0, 1]`: base 0.3 plus 0.15 per distinct cue.
pub fn justification_score(text: &str) -> f64 {
    let cues = matched_cues(text).len() as f64;
    (BASE + PER_CUE * cues).min(1.0)
}
