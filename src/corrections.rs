//! Deterministic repetition and balance corrections.
//!
//! Pure text transforms, no model calls. These are cheap guardrails against
//! the known failure modes of generative prose (runaway phrase repetition,
//! density imbalance); anything they cannot fix mechanically is left for the
//! editing agent.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhraseCategory {
    Metaphor,
    Sensory,
    Emotional,
    General,
}

#[derive(Debug, Clone)]
pub struct RepetitionIssue {
    pub phrase: String,
    pub count: usize,
    pub category: PhraseCategory,
    pub severity: Severity,
}

#[derive(Debug, Clone, Default)]
pub struct RepetitionReport {
    pub issues: Vec<RepetitionIssue>,
    pub total_repetitions: usize,
}

impl RepetitionReport {
    pub fn severity(&self) -> Severity {
        if self.total_repetitions > 2 || self.issues.iter().any(|i| i.severity == Severity::High) {
            Severity::High
        } else {
            Severity::Low
        }
    }
}

/// A phrase must count at least this often to be reported.
const REPEAT_THRESHOLD: usize = 3;

fn classify_phrase(phrase: &str) -> PhraseCategory {
    const METAPHOR: [&str; 4] = ["taste", "like a", "as if", "tang"];
    const SENSORY: [&str; 6] = ["smell", "sound", "scent", "cold", "chill", "echo"];
    const EMOTIONAL: [&str; 5] = ["fear", "dread", "terror", "panic", "grief"];

    if METAPHOR.iter().any(|w| phrase.contains(w)) {
        PhraseCategory::Metaphor
    } else if SENSORY.iter().any(|w| phrase.contains(w)) {
        PhraseCategory::Sensory
    } else if EMOTIONAL.iter().any(|w| phrase.contains(w)) {
        PhraseCategory::Emotional
    } else {
        PhraseCategory::General
    }
}

/// Scans for short phrases that recur more than twice. Four-word phrases
/// are preferred; a three-word phrase is only reported when it is not part
/// of a reported longer one. Phrases made entirely of short filler words
/// are ignored.
pub fn detect_repetition(text: &str) -> RepetitionReport {
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();

    let counts_for = |n: usize| -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for window in words.windows(n) {
            if window.iter().all(|w| w.len() < 4) {
                continue;
            }
            *counts.entry(window.join(" ")).or_default() += 1;
        }
        counts
    };

    let mut phrases: Vec<(String, usize)> = counts_for(4)
        .into_iter()
        .filter(|(_, c)| *c >= REPEAT_THRESHOLD)
        .collect();
    let longer: Vec<String> = phrases.iter().map(|(p, _)| p.clone()).collect();
    phrases.extend(
        counts_for(3)
            .into_iter()
            .filter(|(p, c)| *c >= REPEAT_THRESHOLD && !longer.iter().any(|l| l.contains(p.as_str()))),
    );

    let mut issues = Vec::new();
    let mut total = 0;
    for (phrase, count) in phrases {
        total += count - 1;
        issues.push(RepetitionIssue {
            category: classify_phrase(&phrase),
            severity: Severity::High,
            phrase,
            count,
        });
    }

    RepetitionReport {
        issues,
        total_repetitions: total,
    }
}

/// Per-category replacement pairs for repeated stock phrasing.
fn alternatives(category: PhraseCategory) -> &'static [(&'static str, &'static str)] {
    match category {
        PhraseCategory::Metaphor => &[
            ("metallic taste of fear", "bitter tang of dread"),
            ("cold sweat", "icy perspiration"),
            ("heart pounded", "pulse quickened"),
            ("shiver ran", "tremor passed"),
        ],
        PhraseCategory::Sensory => &[
            ("the smell filled", "the scent reached"),
            ("a sound rang", "a noise cut through"),
            ("cold pierced", "a chill brushed"),
        ],
        PhraseCategory::Emotional => &[
            ("fear gripped", "dread took hold of"),
            ("terror paralyzed", "panic seized"),
        ],
        PhraseCategory::General => &[],
    }
}

fn alternative_phrase(original: &str, category: PhraseCategory) -> String {
    let lower = original.to_lowercase();
    for (from, to) in alternatives(category) {
        if lower.contains(from) {
            return lower.replace(from, to);
        }
    }

    // Single-word swaps when no whole-phrase pair applies.
    for (from, to) in [
        ("metallic", "bitter"),
        ("cold", "icy"),
        ("shiver", "tremor"),
        ("pounded", "hammered"),
        ("suddenly", "abruptly"),
    ] {
        if lower.contains(from) {
            return lower.replace(from, to);
        }
    }

    format!("{} [varied]", original)
}

/// Keeps the first occurrence of each high-severity phrase byte-identical
/// and rewrites the rest.
pub fn fix_repetitions(text: &str, report: &RepetitionReport) -> String {
    let mut fixed = text.to_string();

    for issue in report.issues.iter().filter(|i| i.severity == Severity::High) {
        let pattern = match Regex::new(&format!("(?i){}", regex::escape(&issue.phrase))) {
            Ok(re) => re,
            Err(_) => continue,
        };

        let mut seen = 0;
        fixed = pattern
            .replace_all(&fixed, |caps: &regex::Captures| {
                seen += 1;
                if seen == 1 {
                    caps[0].to_string()
                } else {
                    alternative_phrase(&caps[0], issue.category)
                }
            })
            .into_owned();
    }
    fixed
}

static ADJECTIVE_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b\w+,\s*\w+,\s*\w+\s+(smell|sound|taste|scent|chill)\b").unwrap()
});
static INTERNAL_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\[INTERNAL[^\]]*\][^\[]+)(\[INTERNAL)").unwrap());
static LONG_SENTENCE_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\.)\s*([A-Z][^.]{100,}\.)\s*([A-Z][^.]{100,}\.)").unwrap());

const MICRO_ACTIONS: [&str; 5] = [
    "She shifted in her seat.",
    "He took a breath.",
    "Her gaze dropped.",
    "He clenched his fist.",
    "She looked away.",
];

const ACTION_BEATS: [&str; 4] = [
    "She moved closer.",
    "He scanned the room.",
    "The moment stretched.",
    "Something shifted.",
];

const CONDENSED_WORD_LIMIT: usize = 50;

/// A monologue block shorter than this is left alone.
const LONG_INTERNAL_CHAR_LIMIT: usize = 200;

/// Collapses comma-joined adjective runs before a sense noun into the noun
/// alone.
pub fn reduce_description_density(text: &str) -> String {
    ADJECTIVE_RUN.replace_all(text, "$1").into_owned()
}

/// Truncates overlong `[INTERNAL...]` blocks to a fixed word budget. A block
/// runs from its marker to the next marker or paragraph break, so text after
/// the monologue is never touched.
pub fn condense_internal_monologue(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("[INTERNAL") {
        let close = match rest[start..].find(']') {
            Some(p) => start + p + 1,
            None => break,
        };
        let body = &rest[close..];
        let end = [body.find('['), body.find("\n\n")]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(body.len());
        let block = &body[..end];

        out.push_str(&rest[..close]);
        let words: Vec<&str> = block.split_whitespace().collect();
        if block.len() >= LONG_INTERNAL_CHAR_LIMIT && words.len() > CONDENSED_WORD_LIMIT {
            out.push(' ');
            out.push_str(&words[..CONDENSED_WORD_LIMIT].join(" "));
            out.push_str("...");
        } else {
            out.push_str(block);
        }
        rest = &body[end..];
    }
    out.push_str(rest);
    out
}

/// Interleaves short canned action beats between consecutive internal
/// monologue blocks. Beat choice rotates so repeated application stays
/// deterministic.
pub fn insert_micro_actions(text: &str) -> String {
    let mut index = 0;
    INTERNAL_PAIR
        .replace_all(text, |caps: &regex::Captures| {
            let action = MICRO_ACTIONS[index % MICRO_ACTIONS.len()];
            index += 1;
            format!("{}\n\n{}\n\n{}", &caps[1], action, &caps[2])
        })
        .into_owned()
}

/// Inserts a canned beat between two long back-to-back descriptive
/// sentences.
pub fn insert_action_beats(text: &str) -> String {
    let mut index = 0;
    LONG_SENTENCE_PAIR
        .replace_all(text, |caps: &regex::Captures| {
            let beat = ACTION_BEATS[index % ACTION_BEATS.len()];
            index += 1;
            format!("{} {}\n\n{}\n\n{}", &caps[1], &caps[2], beat, &caps[3])
        })
        .into_owned()
}
