use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-chapter blueprint produced by the planning step. Read-only input to
/// the chapter pipeline.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChapterPlan {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub scene_breakdown: String,
    #[serde(default)]
    pub character_development_focus: String,
    #[serde(default)]
    pub plot_advancement: String,
    #[serde(default)]
    pub conflict_type: String,
    #[serde(default = "default_tension")]
    pub tension_level: u8,
    #[serde(default)]
    pub rhythm_pacing: String,
    #[serde(default = "default_word_count")]
    pub target_word_count: u32,
    #[serde(default)]
    pub emotional_tone_tension: String,
    #[serde(default)]
    pub moral_dilemma: String,
    #[serde(default)]
    pub character_complexity: String,
    #[serde(default)]
    pub consequences_of_choices: String,
    #[serde(default)]
    pub opening_hook: String,
    #[serde(default)]
    pub climax_moment: String,
    #[serde(default)]
    pub chapter_ending: String,
    #[serde(default)]
    pub connection_to_next_chapter: String,
}

fn default_tension() -> u8 {
    5
}

fn default_word_count() -> u32 {
    5000
}

impl ChapterPlan {
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.tension_level) {
            anyhow::bail!(
                "Chapter plan '{}': tension level {} outside 1-10",
                self.title,
                self.tension_level
            );
        }
        if self.target_word_count == 0 {
            anyhow::bail!("Chapter plan '{}': target word count is zero", self.title);
        }
        Ok(())
    }

    /// Flat text rendering used by every prompt that needs the plan.
    pub fn format(&self) -> String {
        format!(
            "Title: {}\n\
             Summary: {}\n\
             Scene Breakdown: {}\n\
             Character Development: {}\n\
             Conflict Type: {}\n\
             Tension Level: {}/10\n\
             Pacing: {}\n\
             Moral Dilemma: {}\n\
             Character Complexity: {}\n\
             Consequences: {}",
            self.title,
            self.summary,
            self.scene_breakdown,
            self.character_development_focus,
            self.conflict_type,
            self.tension_level,
            self.rhythm_pacing,
            self.moral_dilemma,
            self.character_complexity,
            self.consequences_of_choices,
        )
    }
}

/// A character as known to the book run: description plus mutable state
/// tracked across chapters.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Character {
    pub description: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub emotional_state: String,
}

/// Keyed by character name. Ordered so roster-derived prompt text is stable
/// across runs.
pub type CharacterRoster = BTreeMap<String, Character>;

/// One finished chapter as returned by the pipeline and persisted by the
/// driver.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ChapterData {
    pub title: String,
    pub content: String,
    pub plan: String,
    #[serde(default)]
    pub summary: String,
}

/// JSON schema sent with the planning request so the model returns one plan
/// object per chapter.
pub fn chapter_plan_schema(num_chapters: usize) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "chapters": {
                "type": "array",
                "description": format!("An array of chapter plan objects, one for each of the {} chapters.", num_chapters),
                "items": {
                    "type": "object",
                    "properties": {
                        "title": { "type": "string", "description": "Chapter title" },
                        "summary": { "type": "string", "description": "2-3 sentence chapter summary covering key events" },
                        "sceneBreakdown": { "type": "string", "description": "Brief overview of 2-4 main scenes" },
                        "characterDevelopmentFocus": { "type": "string", "description": "Which characters develop and how" },
                        "plotAdvancement": { "type": "string", "description": "How the plot moves forward" },
                        "conflictType": { "type": "string", "description": "Type of conflict: external, internal, interpersonal, or societal" },
                        "tensionLevel": { "type": "integer", "description": "Tension level from 1-10" },
                        "rhythmPacing": { "type": "string", "description": "Chapter pacing: fast, medium, or slow" },
                        "targetWordCount": { "type": "integer", "description": "Target word count (typically 4000-8000)" },
                        "emotionalToneTension": { "type": "string", "description": "Emotional atmosphere and tension level" },
                        "moralDilemma": { "type": "string", "description": "The moral dilemma or ethical question explored" },
                        "openingHook": { "type": "string", "description": "How the chapter begins to engage readers" },
                        "climaxMoment": { "type": "string", "description": "The peak moment of the chapter" },
                        "chapterEnding": { "type": "string", "description": "How the chapter concludes" },
                        "connectionToNextChapter": { "type": "string", "description": "How this chapter leads to the next" }
                    },
                    "required": [
                        "title", "summary", "sceneBreakdown", "characterDevelopmentFocus",
                        "plotAdvancement", "conflictType", "tensionLevel", "rhythmPacing",
                        "targetWordCount", "emotionalToneTension", "moralDilemma",
                        "openingHook", "climaxMoment", "chapterEnding", "connectionToNextChapter"
                    ]
                }
            }
        },
        "required": ["chapters"]
    })
}

#[derive(Deserialize)]
pub struct PlannedChapters {
    pub chapters: Vec<ChapterPlan>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_validation_bounds() {
        let mut plan = ChapterPlan {
            title: "The Gate".into(),
            tension_level: 8,
            target_word_count: 5000,
            ..Default::default()
        };
        assert!(plan.validate().is_ok());

        plan.tension_level = 0;
        assert!(plan.validate().is_err());

        plan.tension_level = 11;
        assert!(plan.validate().is_err());

        plan.tension_level = 10;
        plan.target_word_count = 0;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_plan_deserializes_camel_case() {
        let json = r#"{
            "title": "Ashes",
            "summary": "The city burns.",
            "sceneBreakdown": "Two scenes",
            "tensionLevel": 7,
            "targetWordCount": 4500,
            "moralDilemma": "Save one or save many"
        }"#;

        let plan: ChapterPlan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.tension_level, 7);
        assert_eq!(plan.target_word_count, 4500);
        assert_eq!(plan.moral_dilemma, "Save one or save many");
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_format_includes_tension() {
        let plan = ChapterPlan {
            title: "The Gate".into(),
            summary: "They arrive.".into(),
            tension_level: 8,
            ..Default::default()
        };
        let text = plan.format();
        assert!(text.contains("Title: The Gate"));
        assert!(text.contains("Tension Level: 8/10"));
    }
}
