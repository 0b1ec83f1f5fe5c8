//! Cross-chapter story memory and the per-chapter shared state the
//! specialists coordinate through.
//!
//! One `StoryContext` value exists per book run and is passed `&mut` into the
//! chapter pipeline. All access happens from the single sequential chapter
//! flow, so there is no locking here.

use crate::plan::{ChapterData, ChapterPlan, CharacterRoster};
use crate::slots::SlotMap;
use serde::{Deserialize, Serialize};

/// Coarse mood classification derived from generated text, used to steer
/// later scene generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Tense,
    Reflective,
    Somber,
    Energetic,
    #[default]
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SceneType {
    #[default]
    Setup,
    Action,
    Revelation,
    Emotional,
    Climax,
}

/// Keyword classification of a chapter plan's summary. Approximate by
/// design; misclassification steers pacing hints, nothing more.
pub fn detect_scene_type(plan: &ChapterPlan) -> SceneType {
    let summary = plan.summary.to_lowercase();

    if summary.contains("fight") || summary.contains("battle") || summary.contains("chase") {
        SceneType::Action
    } else if summary.contains("reveal")
        || summary.contains("truth")
        || summary.contains("discover")
    {
        SceneType::Revelation
    } else if summary.contains("emotion")
        || summary.contains("feel")
        || summary.contains("remember")
    {
        SceneType::Emotional
    } else if summary.contains("final") || summary.contains("climax") || summary.contains("end") {
        SceneType::Climax
    } else {
        SceneType::Setup
    }
}

/// Tone detection over generated dialogue/internal text. Highest keyword
/// count wins; no hits means Neutral.
pub fn detect_tone(content: &str) -> Tone {
    let lower = content.to_lowercase();
    let count = |words: &[&str]| -> usize {
        words.iter().map(|w| lower.matches(w).count()).sum()
    };

    let scores = [
        (
            Tone::Tense,
            count(&["clenched", "sharp", "snapped", "threat", "blood", "fear", "hissed"]),
        ),
        (
            Tone::Reflective,
            count(&["remembered", "wondered", "thought", "memory", "quiet", "paused"]),
        ),
        (
            Tone::Somber,
            count(&["grief", "loss", "mourning", "ashes", "grey", "hollow"]),
        ),
        (
            Tone::Energetic,
            count(&["ran", "burst", "laughed", "leapt", "bright", "rushed"]),
        ),
    ];

    let best = scores.iter().max_by_key(|(_, n)| *n);
    match best {
        Some((tone, n)) if *n > 0 => *tone,
        _ => Tone::Neutral,
    }
}

/// Per-chapter mutable state. Reset by `initialize_chapter`; the
/// cross-chapter fields live on `StoryContext` itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedChapterState {
    pub chapter_number: usize,
    pub scene_type: SceneType,
    pub current_tone: Tone,
    pub description_words: usize,
    pub internal_words: usize,
    pub total_words: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuggestedFix {
    CondenseInternal,
    AddMicroAction,
}

/// Advisory verdict from `check_content_limits`. Never blocks generation;
/// the coordinator applies the suggested mechanical fix afterward.
#[derive(Debug, Clone)]
pub struct ContentLimitCheck {
    pub allowed: bool,
    pub reason: Option<String>,
    pub suggested_action: Option<SuggestedFix>,
}

impl ContentLimitCheck {
    fn ok() -> Self {
        Self {
            allowed: true,
            reason: None,
            suggested_action: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceIssue {
    DescriptionOverload,
    InternalOverload,
    ConsecutiveDescription,
}

#[derive(Debug, Clone, Default)]
pub struct BalanceReport {
    pub issues: Vec<BalanceIssue>,
}

/// Description-length and sentence-style hint handed to the scene agent.
#[derive(Debug, Clone)]
pub struct ToneGuidance {
    pub description_length: &'static str,
    pub sentence_style: &'static str,
}

/// Progress of one plot thread across the book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotThread {
    pub name: String,
    pub last_advanced_chapter: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revelation {
    pub description: String,
    pub chapter: usize,
}

/// Immutable-for-the-run view handed to the three specialists at the start
/// of a chapter.
#[derive(Debug, Clone, Default)]
pub struct ChapterContext {
    pub pacing: String,
    pub tension_target: u8,
    pub plot_threads_to_advance: Vec<String>,
    pub active_characters: Vec<String>,
    pub character_notes: Vec<String>,
    pub primary_location: String,
    pub mood: String,
    pub constraints: Vec<String>,
}

/// Single-block and density caps for internal monologue. A block is the text
/// run following an `[INTERNAL...]` marker up to the next marker.
const INTERNAL_BLOCK_WORD_LIMIT: usize = 60;
const INTERNAL_DENSITY_LIMIT: f32 = 0.40;
const DESCRIPTION_DENSITY_LIMIT: f32 = 0.45;
const CONSECUTIVE_DESCRIPTION_LIMIT: usize = 3;

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// The book run's story memory plus the current chapter's shared state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryContext {
    pub outline: String,
    pub characters: CharacterRoster,
    pub plot_threads: Vec<PlotThread>,
    pub revelations: Vec<Revelation>,
    pub chapter_summaries: Vec<String>,
    pub shared: SharedChapterState,
}

impl StoryContext {
    pub fn new(outline: String, characters: CharacterRoster) -> Self {
        // Seed one thread per non-empty outline paragraph lead so early
        // chapters have something concrete to advance.
        let plot_threads = outline
            .split("\n\n")
            .filter_map(|p| p.lines().next())
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(5)
            .map(|l| PlotThread {
                name: l.to_string(),
                last_advanced_chapter: 0,
            })
            .collect();

        Self {
            outline,
            characters,
            plot_threads,
            ..Default::default()
        }
    }

    /// Must run before any specialist. Resets intra-chapter counters and
    /// tone; cross-chapter memory is untouched.
    pub fn initialize_chapter(&mut self, number: usize, scene_type: SceneType) {
        self.shared = SharedChapterState {
            chapter_number: number,
            scene_type,
            ..Default::default()
        };
        log::debug!("Chapter {} context initialized ({:?})", number, scene_type);
    }

    /// Feeds character-agent output into tone detection and the internal
    /// word counters so later phases can adapt.
    pub fn register_character_output(&mut self, content: &str) {
        self.shared.current_tone = detect_tone(content);
        let words = word_count(content);
        self.shared.total_words += words;
        self.shared.internal_words += internal_block_spans(content)
            .iter()
            .map(|s| word_count(s))
            .sum::<usize>();
        log::debug!(
            "Character output registered: tone {:?}, {} words",
            self.shared.current_tone,
            words
        );
    }

    /// Counts the structure skeleton's prose toward the chapter totals so
    /// the density ratios reflect the whole chapter, not one agent's share.
    pub fn register_structure_output(&mut self, content: &str) {
        self.shared.total_words += word_count(content);
    }

    /// Counts scene-agent slots. Only description content drives the
    /// density balance; action content raises the totals alone.
    pub fn register_scene_output(&mut self, descriptions: &SlotMap, actions: &SlotMap) {
        let description_words: usize = descriptions.values().map(|c| word_count(c)).sum();
        let action_words: usize = actions.values().map(|c| word_count(c)).sum();
        self.shared.total_words += description_words + action_words;
        self.shared.description_words += description_words;
    }

    /// Soft density check on one agent's output. Advisory: the caller
    /// applies the suggested fix, generation is never rejected.
    pub fn check_content_limits(&self, category: &str, content: &str) -> ContentLimitCheck {
        if category != "character" {
            return ContentLimitCheck::ok();
        }

        let blocks = internal_block_spans(content);
        if let Some(block) = blocks.iter().find(|b| word_count(b) > INTERNAL_BLOCK_WORD_LIMIT) {
            return ContentLimitCheck {
                allowed: false,
                reason: Some(format!(
                    "Internal monologue block of {} words exceeds the {}-word limit",
                    word_count(block),
                    INTERNAL_BLOCK_WORD_LIMIT
                )),
                suggested_action: Some(SuggestedFix::CondenseInternal),
            };
        }

        if blocks.len() >= CONSECUTIVE_DESCRIPTION_LIMIT {
            let internal: usize = blocks.iter().map(|b| word_count(b)).sum();
            let total = word_count(content).max(1);
            if internal as f32 / total as f32 > INTERNAL_DENSITY_LIMIT {
                return ContentLimitCheck {
                    allowed: false,
                    reason: Some(format!(
                        "Internal monologue is {}% of character content",
                        internal * 100 / total
                    )),
                    suggested_action: Some(SuggestedFix::AddMicroAction),
                };
            }
        }

        ContentLimitCheck::ok()
    }

    /// Whole-chapter imbalance scan over the registered counters. Advisory,
    /// consumed by the synthesis phase for post-hoc corrections.
    pub fn validate_chapter_balance(&self) -> BalanceReport {
        let mut issues = Vec::new();
        let total = self.shared.total_words.max(1) as f32;

        if self.shared.description_words as f32 / total > DESCRIPTION_DENSITY_LIMIT {
            issues.push(BalanceIssue::DescriptionOverload);
        }
        if self.shared.internal_words as f32 / total > INTERNAL_DENSITY_LIMIT {
            issues.push(BalanceIssue::InternalOverload);
        }
        BalanceReport { issues }
    }

    pub fn get_tone_guidance_for_scene(&self) -> ToneGuidance {
        match self.shared.current_tone {
            Tone::Tense => ToneGuidance {
                description_length: "short, clipped descriptions",
                sentence_style: "short declarative sentences, minimal subordinate clauses",
            },
            Tone::Reflective => ToneGuidance {
                description_length: "medium, lingering descriptions",
                sentence_style: "longer flowing sentences with interior texture",
            },
            Tone::Somber => ToneGuidance {
                description_length: "sparse, muted descriptions",
                sentence_style: "measured sentences, restrained imagery",
            },
            Tone::Energetic => ToneGuidance {
                description_length: "brief, kinetic descriptions",
                sentence_style: "varied rhythm, active verbs",
            },
            Tone::Neutral => ToneGuidance {
                description_length: "balanced descriptions",
                sentence_style: "natural varied sentence length",
            },
        }
    }

    /// Builds the read-only context slice the specialists consume.
    pub fn prepare_chapter_context(&self, number: usize, plan: &ChapterPlan) -> ChapterContext {
        let plot_threads_to_advance = self
            .plot_threads
            .iter()
            .filter(|t| number.saturating_sub(t.last_advanced_chapter) >= 2)
            .map(|t| t.name.clone())
            .collect();

        let character_notes = self
            .characters
            .iter()
            .map(|(name, c)| {
                let mut note = format!("{}: {}", name, c.description);
                if !c.location.is_empty() {
                    note.push_str(&format!(" (last seen: {})", c.location));
                }
                if !c.emotional_state.is_empty() {
                    note.push_str(&format!(" (state: {})", c.emotional_state));
                }
                note
            })
            .collect();

        let mut constraints = vec![
            "Do not contradict established character relationships".to_string(),
            "Keep character voices consistent with earlier chapters".to_string(),
        ];
        for r in &self.revelations {
            constraints.push(format!(
                "Already revealed in chapter {}: {} (do not re-reveal)",
                r.chapter, r.description
            ));
        }

        ChapterContext {
            pacing: plan.rhythm_pacing.clone(),
            tension_target: plan.tension_level,
            plot_threads_to_advance,
            active_characters: self.characters.keys().cloned().collect(),
            character_notes,
            primary_location: String::new(),
            mood: plan.emotional_tone_tension.clone(),
            constraints,
        }
    }

    /// Coherence update after a chapter completes: summaries, plot-thread
    /// progress, revelation ledger, character last-known state.
    pub fn update_from_chapter(&mut self, chapter: &ChapterData, number: usize) {
        self.chapter_summaries.push(chapter.summary.clone());

        let summary = chapter.summary.to_lowercase();
        for thread in &mut self.plot_threads {
            if summary.contains(&thread.name.to_lowercase()) {
                thread.last_advanced_chapter = number;
            }
        }

        if summary.contains("reveal") || summary.contains("discover") {
            self.revelations.push(Revelation {
                description: chapter.summary.clone(),
                chapter: number,
            });
        }

        for (name, character) in self.characters.iter_mut() {
            if chapter.content.contains(name.as_str()) {
                character.emotional_state = format!("{:?} after chapter {}", self.shared.current_tone, number)
                    .to_lowercase();
            }
        }

        log::info!(
            "Coherence memory updated from chapter {} ({} revelations tracked)",
            number,
            self.revelations.len()
        );
    }
}

/// Text runs following `[INTERNAL...]` markers, up to the next marker.
fn internal_block_spans(content: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find("[INTERNAL") {
        let after = &rest[start..];
        let body_start = match after.find(']') {
            Some(p) => p + 1,
            None => break,
        };
        let body = &after[body_start..];
        let end = body.find('[').unwrap_or(body.len());
        spans.push(&body[..end]);
        rest = &body[end..];
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Character;

    fn plan_with_summary(summary: &str) -> ChapterPlan {
        ChapterPlan {
            title: "T".into(),
            summary: summary.into(),
            tension_level: 5,
            target_word_count: 5000,
            ..Default::default()
        }
    }

    #[test]
    fn test_scene_type_detection() {
        assert_eq!(
            detect_scene_type(&plan_with_summary("A brutal fight breaks out at the docks")),
            SceneType::Action
        );
        assert_eq!(
            detect_scene_type(&plan_with_summary("She discovers the truth about her father")),
            SceneType::Revelation
        );
        assert_eq!(
            detect_scene_type(&plan_with_summary("He must remember what he lost")),
            SceneType::Emotional
        );
        assert_eq!(
            detect_scene_type(&plan_with_summary("The final confrontation at the tower")),
            SceneType::Climax
        );
        assert_eq!(
            detect_scene_type(&plan_with_summary("The travelers arrive at the city")),
            SceneType::Setup
        );
    }

    #[test]
    fn test_tone_detection() {
        assert_eq!(
            detect_tone("His jaw clenched. Fear sharpened every shadow. She snapped at him."),
            Tone::Tense
        );
        assert_eq!(
            detect_tone("She remembered the garden and wondered if the memory was even hers."),
            Tone::Reflective
        );
        assert_eq!(detect_tone("The courier delivered a letter."), Tone::Neutral);
    }

    #[test]
    fn test_initialize_chapter_resets_counters() {
        let mut ctx = StoryContext::new("Outline".into(), CharacterRoster::new());
        ctx.initialize_chapter(1, SceneType::Setup);
        ctx.register_character_output("clenched fists and fear in every clenched word here");
        assert!(ctx.shared.total_words > 0);

        ctx.initialize_chapter(2, SceneType::Action);
        assert_eq!(ctx.shared.chapter_number, 2);
        assert_eq!(ctx.shared.total_words, 0);
        assert_eq!(ctx.shared.current_tone, Tone::Neutral);
    }

    #[test]
    fn test_content_limit_flags_long_internal_block() {
        let long_block = "word ".repeat(80);
        let content = format!("[INTERNAL_DOUBT] {}", long_block);

        let ctx = StoryContext::default();
        let check = ctx.check_content_limits("character", &content);
        assert!(!check.allowed);
        assert_eq!(check.suggested_action, Some(SuggestedFix::CondenseInternal));

        // Other categories pass through.
        let scene = ctx.check_content_limits("scene", &content);
        assert!(scene.allowed);
    }

    #[test]
    fn test_content_limit_allows_short_blocks() {
        let ctx = StoryContext::default();
        let check = ctx.check_content_limits(
            "character",
            "[INTERNAL_DOUBT] A short worry, nothing more. [DIALOGUE_A] \"Fine.\"",
        );
        assert!(check.allowed);
    }

    #[test]
    fn test_balance_report_flags_overloads() {
        let mut ctx = StoryContext::default();
        ctx.initialize_chapter(3, SceneType::Setup);
        // 100 words of scene description against 60 of other content.
        let mut descriptions = SlotMap::new();
        descriptions.insert("DESCRIPTION_1".into(), "mist ".repeat(100));
        ctx.register_scene_output(&descriptions, &SlotMap::new());
        ctx.shared.total_words += 60;

        let report = ctx.validate_chapter_balance();
        assert!(report.issues.contains(&BalanceIssue::DescriptionOverload));
    }

    #[test]
    fn test_balance_clean_for_ordinary_chapter_mix() {
        // Structure prose and character content dominate the totals; a
        // couple of description slots must not trip the density cap.
        let mut ctx = StoryContext::default();
        ctx.initialize_chapter(1, SceneType::Setup);
        ctx.register_structure_output(&"word ".repeat(40));
        ctx.register_character_output(&"say ".repeat(30));
        let mut descriptions = SlotMap::new();
        descriptions.insert("DESCRIPTION_1".into(), "mist over water ".repeat(5));
        let mut actions = SlotMap::new();
        actions.insert("ACTION_1".into(), "she ran hard ".repeat(4));
        ctx.register_scene_output(&descriptions, &actions);

        let report = ctx.validate_chapter_balance();
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_prepare_context_lists_characters_in_stable_order() {
        let mut roster = CharacterRoster::new();
        for name in ["Wren", "Anse", "Mara"] {
            roster.insert(name.into(), Character::default());
        }
        let ctx = StoryContext::new("Outline".into(), roster);
        let chapter_ctx = ctx.prepare_chapter_context(1, &ChapterPlan::default());
        assert_eq!(chapter_ctx.active_characters, vec!["Anse", "Mara", "Wren"]);
    }

    #[test]
    fn test_tone_guidance_tracks_tone() {
        let mut ctx = StoryContext::default();
        ctx.initialize_chapter(1, SceneType::Action);
        ctx.register_character_output("Blood on the floor. His jaw clenched. A threat in every word.");

        let guidance = ctx.get_tone_guidance_for_scene();
        assert!(guidance.description_length.contains("short"));
    }

    #[test]
    fn test_prepare_context_carries_revelation_constraints() {
        let mut roster = CharacterRoster::new();
        roster.insert(
            "Mara".into(),
            Character {
                description: "a courier with a past".into(),
                location: "the lower city".into(),
                emotional_state: "wary".into(),
            },
        );
        let mut ctx = StoryContext::new("Outline".into(), roster);
        ctx.revelations.push(Revelation {
            description: "Mara's brother is alive".into(),
            chapter: 2,
        });

        let context = ctx.prepare_chapter_context(4, &plan_with_summary("They regroup"));
        assert_eq!(context.active_characters, vec!["Mara".to_string()]);
        assert!(context
            .constraints
            .iter()
            .any(|c| c.contains("Mara's brother is alive")));
        assert!(context.character_notes[0].contains("the lower city"));
    }

    #[test]
    fn test_update_from_chapter_records_revelation() {
        let mut ctx = StoryContext::new("The stolen ledger\n\nThe harbor war".into(), CharacterRoster::new());
        let chapter = ChapterData {
            title: "Ledgers".into(),
            content: "…".into(),
            plan: String::new(),
            summary: "Mara discovers the stolen ledger was a forgery".into(),
        };
        ctx.update_from_chapter(&chapter, 3);

        assert_eq!(ctx.chapter_summaries.len(), 1);
        assert_eq!(ctx.revelations.len(), 1);
        assert_eq!(ctx.plot_threads[0].last_advanced_chapter, 3);
    }
}
