//! The bracket-marker protocol between specialist agents and synthesis.
//!
//! Specialist output is expected to contain `[SLOT_ID]`-tagged segments, but
//! the model's adherence to that format is weak. Extraction therefore runs an
//! ordered cascade of independent strategies; the first strategy that yields
//! at least one slot wins outright, and total failure produces an empty map
//! rather than an error.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Content shorter than this is considered a degenerate match.
const MIN_CONTENT_LEN: usize = 10;
/// Runaway captures beyond this are rejected by the looser strategies.
const MAX_CONTENT_LEN: usize = 2000;
/// How far the proximity fallback looks around a bare marker.
const PROXIMITY_WINDOW: usize = 500;
const PROXIMITY_MAX_LEN: usize = 1000;

static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([A-Za-z_][A-Za-z0-9_]*)\]").unwrap());
static HEADER_BRACKET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{2,3}\s*\[([^\]]+)\]\s*$").unwrap());
static HEADER_BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*\*\[([^\]]+)\]\*\*\s*$").unwrap());
static HEADER_PLAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^###\s+([A-Z_][A-Z0-9_]*)\s*$").unwrap());
static NUMBERED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\s*\[([^\]]+)\]\s*:?\s*(.*)$").unwrap());
static NUMBERED_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+\.\s").unwrap());

pub type SlotMap = BTreeMap<String, String>;

/// Which specialist a slot belongs to, by naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Dialogue,
    Action,
    Internal,
    Description,
    Transition,
    Other,
}

impl SlotKind {
    pub fn of(slot_id: &str) -> Self {
        if slot_id.starts_with("DIALOGUE") {
            SlotKind::Dialogue
        } else if slot_id.starts_with("ACTION") {
            SlotKind::Action
        } else if slot_id.starts_with("INTERNAL") {
            SlotKind::Internal
        } else if slot_id.starts_with("DESCRIPTION") {
            SlotKind::Description
        } else if slot_id.starts_with("TRANSITION") {
            SlotKind::Transition
        } else {
            SlotKind::Other
        }
    }
}

/// Slot names found in a structure skeleton, grouped by specialist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotNames {
    pub dialogue: Vec<String>,
    pub action: Vec<String>,
    pub internal: Vec<String>,
    pub description: Vec<String>,
    pub transition: Vec<String>,
}

impl SlotNames {
    pub fn total(&self) -> usize {
        self.dialogue.len()
            + self.action.len()
            + self.internal.len()
            + self.description.len()
            + self.transition.len()
    }
}

/// Scans a structure skeleton for `[SLOT]` markers and groups them by prefix.
/// Duplicate mentions are kept once, in first-appearance order.
pub fn scan_slot_names(text: &str) -> SlotNames {
    let mut names = SlotNames::default();
    let mut seen = std::collections::BTreeSet::new();

    for cap in MARKER.captures_iter(text) {
        let id = cap[1].to_string();
        if !seen.insert(id.clone()) {
            continue;
        }
        match SlotKind::of(&id) {
            SlotKind::Dialogue => names.dialogue.push(id),
            SlotKind::Action => names.action.push(id),
            SlotKind::Internal => names.internal.push(id),
            SlotKind::Description => names.description.push(id),
            SlotKind::Transition => names.transition.push(id),
            SlotKind::Other => {}
        }
    }
    names
}

/// Extracts slot contents from free-form model output. Never fails; returns
/// an empty map when nothing matches so the caller can log and decide.
pub fn extract_slots(text: &str) -> SlotMap {
    let strategies: [fn(&str) -> SlotMap; 6] = [
        extract_exact_lines,
        extract_blocks,
        extract_json_object,
        extract_headers,
        extract_numbered,
        extract_proximity,
    ];

    for strategy in strategies {
        let slots = strategy(text);
        if !slots.is_empty() {
            return slots;
        }
    }

    log::warn!(
        "No slots found with any extraction strategy (content length {})",
        text.len()
    );
    SlotMap::new()
}

/// Re-emits a slot map as `[ID]: content` lines, the canonical exchange form.
/// `extract_slots(emit_slot_lines(m))` reproduces `m` for single-line content.
pub fn emit_slot_lines(slots: &SlotMap) -> String {
    slots
        .iter()
        .map(|(id, content)| format!("[{}]: {}", id, content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn clean_content(raw: &str) -> String {
    let mut content = raw.trim();
    // Strip one layer of wrapping quotes.
    for quote in ['"', '\''] {
        if content.len() >= 2 && content.starts_with(quote) && content.ends_with(quote) {
            content = &content[1..content.len() - 1];
        }
    }
    content
        .trim_start_matches(|c: char| c.is_whitespace() || c == '-' || c == '*' || c == '>')
        .trim()
        .to_string()
}

/// Byte offset where a `[ID]: content` capture ends: the next line starting
/// with `[`, a blank line, or end of text.
fn content_end(text: &str, start: usize) -> usize {
    let rest = &text[start..];
    let next_marker = rest.find("\n[").map(|p| start + p);
    let blank = rest.find("\n\n").map(|p| start + p);
    match (next_marker, blank) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => text.len(),
    }
}

/// Strategy 1: `[ID]: content` on the same line, continuing until the next
/// marker line or a blank line.
fn extract_exact_lines(text: &str) -> SlotMap {
    let mut slots = SlotMap::new();

    for m in MARKER.captures_iter(text) {
        let whole = m.get(0).unwrap();
        let id = m[1].to_string();

        let after = &text[whole.end()..];
        let colon_offset = after.len() - after.trim_start().len();
        if !after.trim_start().starts_with(':') {
            continue;
        }
        let content_start = whole.end() + colon_offset + 1;
        let end = content_end(text, content_start);
        let content = clean_content(&text[content_start..end]);

        if !content.is_empty() {
            slots.insert(id, content);
        }
    }
    slots
}

/// Strategy 2: `[ID]` alone on a line followed by a free-text block.
fn extract_blocks(text: &str) -> SlotMap {
    let mut slots = SlotMap::new();
    let markers: Vec<_> = MARKER.captures_iter(text).collect();

    for (i, m) in markers.iter().enumerate() {
        let whole = m.get(0).unwrap();
        let after = &text[whole.end()..];
        if !after.starts_with('\n') && !after.trim_start_matches(' ').starts_with('\n') {
            continue;
        }

        let end = markers
            .get(i + 1)
            .map(|n| n.get(0).unwrap().start())
            .unwrap_or(text.len());
        let content = clean_content(&text[whole.end()..end]);

        if !content.is_empty() && content.len() < MAX_CONTENT_LEN {
            slots.insert(m[1].to_string(), content);
        }
    }
    slots
}

/// Strategy 3: a serialized JSON object somewhere in the text; string-valued
/// entries become slots.
fn extract_json_object(text: &str) -> SlotMap {
    let mut slots = SlotMap::new();

    let candidate = match (text.find('{'), text.rfind('}')) {
        (Some(open), Some(close)) if close > open => &text[open..=close],
        _ => return slots,
    };

    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(candidate) {
        for (key, value) in map {
            if let serde_json::Value::String(content) = value {
                if !content.is_empty() {
                    slots.insert(key, content);
                }
            }
        }
    }
    slots
}

/// Strategy 4: markdown-style headers (`## [ID]`, `**[ID]**`, `### ID`)
/// followed by a content block.
fn extract_headers(text: &str) -> SlotMap {
    let mut slots = SlotMap::new();
    let lines: Vec<&str> = text.lines().collect();

    let header_id = |line: &str| -> Option<String> {
        HEADER_BRACKET
            .captures(line)
            .or_else(|| HEADER_BOLD.captures(line))
            .or_else(|| HEADER_PLAIN.captures(line))
            .map(|c| c[1].trim().to_string())
    };

    let mut i = 0;
    while i < lines.len() {
        if let Some(id) = header_id(lines[i]) {
            let mut block = Vec::new();
            let mut j = i + 1;
            while j < lines.len() && header_id(lines[j]).is_none() {
                block.push(lines[j]);
                j += 1;
            }
            let content = clean_content(&block.join("\n"));
            if !content.is_empty() && content.len() < MAX_CONTENT_LEN {
                slots.insert(id, content);
            }
            i = j;
        } else {
            i += 1;
        }
    }
    slots
}

/// Strategy 5: `N. [ID]: content` enumerations.
fn extract_numbered(text: &str) -> SlotMap {
    let mut slots = SlotMap::new();
    let lines: Vec<&str> = text.lines().collect();

    let mut i = 0;
    while i < lines.len() {
        if let Some(cap) = NUMBERED.captures(lines[i]) {
            let id = cap[1].trim().to_string();
            let mut parts = vec![cap[2].to_string()];
            let mut j = i + 1;
            while j < lines.len() && !NUMBERED_LINE.is_match(lines[j]) {
                parts.push(lines[j].to_string());
                j += 1;
            }
            let content = clean_content(parts.join("\n").trim());
            if !content.is_empty() {
                slots.insert(id, content);
            }
            i = j;
        } else {
            i += 1;
        }
    }
    slots
}

/// Strategy 6: last resort. For every bare marker, take the surrounding text
/// (after first, before if the after-text is too short) up to the next
/// marker, and accept it only if it looks like prose of sane length.
fn extract_proximity(text: &str) -> SlotMap {
    let mut slots = SlotMap::new();
    let markers: Vec<_> = MARKER.captures_iter(text).collect();

    for (i, m) in markers.iter().enumerate() {
        let id = m[1].to_string();
        if slots.contains_key(&id) {
            continue;
        }
        let whole = m.get(0).unwrap();

        let after_end = markers
            .get(i + 1)
            .map(|n| n.get(0).unwrap().start())
            .unwrap_or(text.len())
            .min(whole.end() + PROXIMITY_WINDOW);
        let mut content = text[whole.end()..after_end]
            .trim_start_matches([':', ';', '-'])
            .trim()
            .to_string();

        if content.len() < 20 {
            let before_start = if i > 0 {
                markers[i - 1].get(0).unwrap().end()
            } else {
                0
            }
            .max(whole.start().saturating_sub(PROXIMITY_WINDOW));
            content = text[before_start..whole.start()]
                .trim_start_matches([':', ';', '-'])
                .trim()
                .to_string();
        }

        if content.len() >= MIN_CONTENT_LEN
            && content.len() <= PROXIMITY_MAX_LEN
            && !content.contains('[')
        {
            slots.insert(id, content);
        }
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_form_extracts_all_pairs() {
        let text = "[DIALOGUE_GREETING]: \"You're early,\" Marcus said.\n\n\
                    [INTERNAL_SUSPICION]: Something was off about his posture tonight.\n\n\
                    [DESCRIPTION_BAR]: Lamplight struggled through smoke-thick air.";

        let slots = extract_slots(text);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots["DIALOGUE_GREETING"], "\"You're early,\" Marcus said.");
        assert_eq!(
            slots["INTERNAL_SUSPICION"],
            "Something was off about his posture tonight."
        );
    }

    #[test]
    fn test_quotes_stripped() {
        let text = "[DIALOGUE_A]: \"We need to talk, she said, and meant it.\"";
        let slots = extract_slots(text);
        assert_eq!(slots["DIALOGUE_A"], "We need to talk, she said, and meant it.");
    }

    #[test]
    fn test_no_brackets_returns_empty() {
        let slots = extract_slots("Just a paragraph of plain prose with no markers at all.");
        assert!(slots.is_empty());
    }

    #[test]
    fn test_block_form() {
        let text = "[INTERNAL_DOUBT]\nThe thought would not leave her alone, no matter how\nhard she pushed it down.";
        let slots = extract_slots(text);
        assert_eq!(slots.len(), 1);
        assert!(slots["INTERNAL_DOUBT"].starts_with("The thought would not leave"));
    }

    #[test]
    fn test_json_form() {
        let text = "Here is the content:\n{\"DIALOGUE_MAIN\": \"'Stay back,' he warned.\", \"count\": 2}";
        let slots = extract_slots(text);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots["DIALOGUE_MAIN"], "'Stay back,' he warned.");
    }

    #[test]
    fn test_header_form() {
        let text = "## [DESCRIPTION_HALL]\nThe great hall reeked of cold mutton and dying fires.\n\n## [ACTION_DUEL]\nSteel rang against steel, jarring up through his arm.";
        let slots = extract_slots(text);
        assert_eq!(slots.len(), 2);
        assert!(slots["ACTION_DUEL"].contains("Steel rang"));
    }

    #[test]
    fn test_numbered_form() {
        // Exact-line matching must not trigger first, so no colon-after-bracket
        // on a line start.
        let text = "Results follow.\n1. [DIALOGUE_ONE] \"Who sent you?\" The words came out harder than intended.\n2. [DIALOGUE_TWO] \"Nobody sends me anywhere,\" she answered.";
        let slots = extract_numbered(text);
        assert_eq!(slots.len(), 2);
        assert!(slots["DIALOGUE_TWO"].contains("Nobody sends me"));
    }

    #[test]
    fn test_proximity_fallback() {
        let text = "The receptionist's smile was too wide tonight [INTERNAL_UNEASE] and the lobby felt smaller than she remembered it being.";
        let slots = extract_proximity(text);
        assert_eq!(slots.len(), 1);
        assert!(slots["INTERNAL_UNEASE"].starts_with("and the lobby felt smaller"));
    }

    #[test]
    fn test_proximity_rejects_degenerate() {
        // Surrounding context shorter than the minimum is rejected.
        let slots = extract_proximity("ok [INTERNAL_X] no");
        assert!(slots.is_empty());
    }

    #[test]
    fn test_first_strategy_wins_entirely() {
        // Exact-form match present; the block-form candidate below must not
        // be merged in.
        let text = "[DIALOGUE_A]: A full line of dialogue content here.\n\n\
                    [INTERNAL_B]\nBlock form content that would match strategy two.";
        let slots = extract_slots(text);
        assert!(slots.contains_key("DIALOGUE_A"));
        assert!(!slots.contains_key("INTERNAL_B"));
    }

    #[test]
    fn test_round_trip_idempotence() {
        let mut original = SlotMap::new();
        original.insert(
            "DIALOGUE_GREETING".to_string(),
            "\"You're early,\" Marcus said, not looking up.".to_string(),
        );
        original.insert(
            "DESCRIPTION_BAR".to_string(),
            "Lamplight struggled through smoke-thick air.".to_string(),
        );
        original.insert(
            "INTERNAL_UNEASE".to_string(),
            "God, she hoped she was just being paranoid again.".to_string(),
        );

        let emitted = emit_slot_lines(&original);
        let reparsed = extract_slots(&emitted);
        assert_eq!(reparsed, original);
    }

    #[test]
    fn test_scan_slot_names_groups_by_prefix() {
        let text = "She stepped in. [DESCRIPTION_LOBBY] The clerk looked up. \
                    [DIALOGUE_CLERK] Something cold settled. [INTERNAL_UNEASE] \
                    Footsteps behind her. [ACTION_APPROACH] [TRANSITION_END] \
                    [DIALOGUE_CLERK]";
        let names = scan_slot_names(text);
        assert_eq!(names.dialogue, vec!["DIALOGUE_CLERK"]);
        assert_eq!(names.action, vec!["ACTION_APPROACH"]);
        assert_eq!(names.internal, vec!["INTERNAL_UNEASE"]);
        assert_eq!(names.description, vec!["DESCRIPTION_LOBBY"]);
        assert_eq!(names.transition, vec!["TRANSITION_END"]);
        assert_eq!(names.total(), 5);
    }

    #[test]
    fn test_slot_kind() {
        assert_eq!(SlotKind::of("DIALOGUE_MAIN"), SlotKind::Dialogue);
        assert_eq!(SlotKind::of("TRANSITION_END"), SlotKind::Transition);
        assert_eq!(SlotKind::of("SOMETHING_ELSE"), SlotKind::Other);
    }
}
