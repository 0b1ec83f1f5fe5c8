//! The three specialist generators: structure, character, scene.
//!
//! Each makes one adapter call with role-specific sampling, then parses its
//! own output. Structure produces the prose skeleton with embedded slot
//! markers; character and scene fill slots named by the structure skeleton.

use crate::context::{detect_scene_type, ChapterContext, SceneType, ToneGuidance};
use crate::llm::{GenRequest, LlmClient, LlmError};
use crate::plan::{ChapterPlan, CharacterRoster};
use crate::slots::{extract_slots, scan_slot_names, SlotMap, SlotNames};
use std::time::Instant;

const STRUCTURE_CONFIDENCE: u32 = 85;
const CHARACTER_CONFIDENCE: u32 = 80;
const SCENE_CONFIDENCE: u32 = 85;

#[derive(Debug, Clone)]
pub struct AgentMetadata {
    pub agent: &'static str,
    pub processing_ms: u128,
    pub confidence: u32,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DialogueRequirement {
    pub slot_id: String,
    pub characters: Vec<String>,
    pub purpose: String,
    pub emotional_tone: String,
    pub subtext: Option<String>,
}

/// Derives dialogue requirements from the plan's focus fields. Always yields
/// at least one requirement.
pub fn derive_dialogue_requirements(
    plan: &ChapterPlan,
    roster: &CharacterRoster,
) -> Vec<DialogueRequirement> {
    let mut active: Vec<String> = roster.keys().cloned().collect();
    active.sort();
    if active.is_empty() {
        active.push("protagonist".to_string());
    }
    let tone = |fallback: &str| {
        if plan.emotional_tone_tension.is_empty() {
            fallback.to_string()
        } else {
            plan.emotional_tone_tension.clone()
        }
    };

    let mut requirements = Vec::new();

    if !plan.character_development_focus.is_empty() {
        requirements.push(DialogueRequirement {
            slot_id: "DIALOGUE_CHARACTER_DEVELOPMENT".into(),
            characters: active.iter().take(2).cloned().collect(),
            purpose: "Character development and relationships".into(),
            emotional_tone: tone("neutral"),
            subtext: (!plan.character_complexity.is_empty())
                .then(|| plan.character_complexity.clone()),
        });
    }
    if !plan.conflict_type.is_empty() {
        requirements.push(DialogueRequirement {
            slot_id: "DIALOGUE_CONFLICT".into(),
            characters: active.clone(),
            purpose: format!("Address {} conflict", plan.conflict_type),
            emotional_tone: tone("tense"),
            subtext: None,
        });
    }
    if !plan.plot_advancement.is_empty() {
        requirements.push(DialogueRequirement {
            slot_id: "DIALOGUE_PLOT".into(),
            characters: active.iter().take(2).cloned().collect(),
            purpose: "Advance main plot".into(),
            emotional_tone: tone("neutral"),
            subtext: None,
        });
    }
    if requirements.is_empty() {
        requirements.push(DialogueRequirement {
            slot_id: "DIALOGUE_MAIN".into(),
            characters: active.into_iter().take(2).collect(),
            purpose: "Advance story".into(),
            emotional_tone: tone("neutral"),
            subtext: None,
        });
    }
    requirements
}

// =================== STRUCTURE AGENT ===================

#[derive(Debug)]
pub struct StructureInput<'a> {
    pub plan: &'a ChapterPlan,
    pub chapter_number: usize,
    pub context: &'a ChapterContext,
    pub previous_chapter_end: Option<&'a str>,
    pub target_length: usize,
    pub story_outline: &'a str,
}

#[derive(Debug, Clone)]
pub struct StructureOutput {
    /// Prose skeleton with embedded `[SLOT]` markers.
    pub chapter_structure: String,
    pub slots: SlotNames,
    pub metadata: AgentMetadata,
}

#[derive(Debug, Default)]
pub struct StructureAgent;

impl StructureAgent {
    pub async fn generate(
        &self,
        llm: &dyn LlmClient,
        input: &StructureInput<'_>,
    ) -> Result<StructureOutput, LlmError> {
        let started = Instant::now();
        log::info!(
            "Structure agent: framework for chapter {}",
            input.chapter_number
        );

        let req = GenRequest::new(self.user_prompt(input))
            .system(STRUCTURE_SYSTEM_PROMPT)
            .sampling(0.7, 0.9, 40);
        let content = llm.generate(&req).await?;

        let slots = scan_slot_names(&content);
        log::info!(
            "Structure skeleton has {} slots ({} dialogue, {} action, {} internal, {} description, {} transition)",
            slots.total(),
            slots.dialogue.len(),
            slots.action.len(),
            slots.internal.len(),
            slots.description.len(),
            slots.transition.len()
        );

        Ok(StructureOutput {
            metadata: AgentMetadata {
                agent: "Structure",
                processing_ms: started.elapsed().as_millis(),
                confidence: STRUCTURE_CONFIDENCE,
                notes: vec![format!("Generated framework with {} slots", slots.total())],
            },
            chapter_structure: content,
            slots,
        })
    }

    fn user_prompt(&self, input: &StructureInput<'_>) -> String {
        let target = input.target_length;
        let previous = match input.previous_chapter_end {
            Some(end) => {
                let tail: String = end.chars().rev().take(200).collect::<Vec<_>>().into_iter().rev().collect();
                format!("Previous chapter ended with: \"{}\"", tail)
            }
            None => "This is the first chapter".to_string(),
        };

        format!(
            "Write the prose skeleton for Chapter {}: \"{}\"\n\n\
             **STORY OUTLINE:**\n{}\n\n\
             **CHAPTER PLAN TO IMPLEMENT:**\n{}\n\n\
             **STRUCTURAL REQUIREMENTS:**\n\
             - Pacing: {} tempo\n\
             - Tension level: {}/10\n\
             - Plot threads to advance: {}\n\n\
             **PREVIOUS CHAPTER CONNECTION:**\n{}\n\n\
             **SLOT DISTRIBUTION TARGETS:**\n\
             Target chapter length: {} words. Aim for at least:\n\
             - Dialogue slots: {}\n\
             - Action slots: {}\n\
             - Internal slots: {}\n\
             - Description slots: {}\n\
             - Transition slots: {}\n\
             Create MORE slots if needed to reach target length naturally.\n\n\
             WRITE THE COMPLETE PROSE CHAPTER SKELETON NOW - start immediately \
             with narrative text containing [SLOT] markers:",
            input.chapter_number,
            input.plan.title,
            input.story_outline,
            input.plan.format(),
            input.context.pacing,
            input.context.tension_target,
            input.context.plot_threads_to_advance.join(", "),
            previous,
            target,
            target.div_ceil(500),
            target.div_ceil(1000),
            target.div_ceil(1000),
            target.div_ceil(800),
            target.div_ceil(1200),
        )
    }
}

const STRUCTURE_SYSTEM_PROMPT: &str = "You are a master story architect specializing in chapter structure and narrative flow. Your job is to create a PROSE NARRATIVE SKELETON - flowing chapter text with [SLOT] markers for other specialists to fill.

CRITICAL OUTPUT REQUIREMENTS:
1. Write ACTUAL PROSE TEXT - flowing narrative that reads like a chapter draft
2. Embed [SLOT] markers seamlessly within the prose flow
3. DO NOT write outlines, frameworks, or meta-descriptions
4. DO NOT write \"Here is the framework\" or similar introductions
5. START IMMEDIATELY with narrative prose

SLOT TYPES TO EMBED NATURALLY:
- [DIALOGUE_X] for conversation scenes
- [ACTION_X] for physical action and movement
- [INTERNAL_X] for character thoughts and emotions
- [DESCRIPTION_X] for environmental and atmospheric details
- [TRANSITION_X] for connecting different scenes

EXAMPLE OF CORRECT OUTPUT:
\"Delilah stepped into the hotel lobby. [DESCRIPTION_LOBBY_ATMOSPHERE] The receptionist's smile was too wide. [DIALOGUE_RECEPTIONIST_GREETING] Something cold settled in her stomach. [INTERNAL_DELILAH_UNEASE]\"

YOUR OUTPUT MUST BE FLOWING PROSE WITH EMBEDDED SLOTS - nothing else!";

// =================== CHARACTER AGENT ===================

#[derive(Debug)]
pub struct CharacterInput<'a> {
    pub plan: &'a ChapterPlan,
    pub chapter_number: usize,
    pub context: &'a ChapterContext,
    pub structure_slots: &'a SlotNames,
    pub dialogue_requirements: &'a [DialogueRequirement],
    pub story_outline: &'a str,
    pub genre: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct CharacterOutput {
    /// The raw slot-line text, handed to synthesis as-is.
    pub content: String,
    pub dialogue: SlotMap,
    pub internal: SlotMap,
    pub metadata: AgentMetadata,
}

#[derive(Debug, Default)]
pub struct CharacterAgent;

impl CharacterAgent {
    pub async fn generate(
        &self,
        llm: &dyn LlmClient,
        input: &CharacterInput<'_>,
    ) -> Result<CharacterOutput, LlmError> {
        let started = Instant::now();
        log::info!(
            "Character agent: dialogue and interiority for chapter {}",
            input.chapter_number
        );

        let req = GenRequest::new(self.user_prompt(input))
            .system(self.system_prompt(input.genre))
            .sampling(0.8, 0.9, 40);
        let content = llm.generate(&req).await?;

        let slots = extract_slots(&content);
        if slots.is_empty() {
            log::warn!(
                "Character agent produced no parseable slots (content length {})",
                content.len()
            );
        }

        let mut dialogue = SlotMap::new();
        let mut internal = SlotMap::new();
        for (id, text) in &slots {
            if id.contains("DIALOGUE") {
                dialogue.insert(id.clone(), text.clone());
            } else if id.contains("INTERNAL") {
                internal.insert(id.clone(), text.clone());
            }
        }

        Ok(CharacterOutput {
            metadata: AgentMetadata {
                agent: "Character",
                processing_ms: started.elapsed().as_millis(),
                confidence: CHARACTER_CONFIDENCE,
                notes: vec![format!(
                    "Generated content for {} of {} dialogue slots",
                    dialogue.len(),
                    input.structure_slots.dialogue.len()
                )],
            },
            content,
            dialogue,
            internal,
        })
    }

    fn system_prompt(&self, genre: Option<&str>) -> String {
        let genre_note = match genre {
            Some(g) => format!("Writing in {} genre.", g.to_uppercase()),
            None => "Using general fiction techniques.".to_string(),
        };
        format!(
            "You are a character development specialist and dialogue expert. Your job is to \
             write authentic, emotionally resonant dialogue and internal character moments.\n\n\
             {}\n\n\
             CORE PRINCIPLES:\n\
             - Every line of dialogue must have SUBTEXT - characters rarely say exactly what they mean\n\
             - Use natural speech patterns - people interrupt, hesitate, misunderstand\n\
             - Each character has a unique voice and speech pattern\n\n\
             CRITICAL SHOW VS TELL RULES:\n\
             - NEVER write \"she felt [emotion]\" or \"he looked [emotion]\" - show it through \
             actions, dialogue, physical reactions\n\
             - FORBIDDEN PHRASES: \"she felt\", \"he looked\", \"seemed like\", \"appeared to be\"\n\n\
             CONTENT LIMITS:\n\
             - Keep internal monologues under 150 words per slot\n\
             - Break up long thoughts with micro-actions (breath, glance, shift)\n\n\
             You will receive specific slot requirements. Write content for each slot that fits \
             seamlessly into the narrative structure.",
            genre_note
        )
    }

    fn user_prompt(&self, input: &CharacterInput<'_>) -> String {
        let dialogue_slots = input
            .structure_slots
            .dialogue
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. [{}] - Purpose: {}", i + 1, s, infer_dialogue_purpose(s)))
            .collect::<Vec<_>>()
            .join("\n");
        let internal_slots = input
            .structure_slots
            .internal
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. [{}] - Focus: {}", i + 1, s, infer_internal_focus(s)))
            .collect::<Vec<_>>()
            .join("\n");
        let requirements = input
            .dialogue_requirements
            .iter()
            .map(|r| {
                format!(
                    "- [{}]: {} (characters: {}; tone: {})",
                    r.slot_id,
                    r.purpose,
                    r.characters.join(", "),
                    r.emotional_tone
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Generate character content for Chapter {}: \"{}\"\n\n\
             **STORY OUTLINE - CHARACTER ARC CONTEXT:**\n{}\n\n\
             **ACTIVE CHARACTERS:** {}\n\n\
             **CHARACTER STATES:**\n{}\n\n\
             **CHAPTER EMOTIONAL JOURNEY:**\n{}\n\
             Character Complexity Focus: {}\n\n\
             **DIALOGUE SLOTS TO FILL:**\n{}\n\n\
             **INTERNAL THOUGHT SLOTS TO FILL:**\n{}\n\n\
             **DIALOGUE REQUIREMENTS:**\n{}\n\n\
             **OUTPUT FORMAT - MANDATORY:**\n\
             Output ONLY slot content, one slot per block:\n\n\
             [SLOT_NAME]: Content goes here on the same line or continuing lines\n\n\
             [NEXT_SLOT_NAME]: Next content here\n\n\
             Do not add introductions, numbered lists, or markdown headers.\n\n\
             **NOW GENERATE ALL SLOT CONTENT IN THE CORRECT FORMAT:**",
            input.chapter_number,
            input.plan.title,
            input.story_outline,
            input.context.active_characters.join(", "),
            input.context.character_notes.join("\n"),
            input.plan.moral_dilemma,
            input.plan.character_complexity,
            dialogue_slots,
            internal_slots,
            requirements,
        )
    }
}

fn infer_dialogue_purpose(slot_id: &str) -> &'static str {
    if slot_id.contains("GREETING") {
        "Initial interaction/establishing mood"
    } else if slot_id.contains("CONFLICT") {
        "Confrontation/tension escalation"
    } else if slot_id.contains("REVELATION") {
        "Information reveal/plot advancement"
    } else {
        "Character interaction and development"
    }
}

fn infer_internal_focus(slot_id: &str) -> &'static str {
    if slot_id.contains("SUSPICION") {
        "Growing doubt and uncertainty"
    } else if slot_id.contains("REACTION") {
        "Processing new information"
    } else if slot_id.contains("RESOLVE") {
        "Decision-making and determination"
    } else {
        "Character emotional state and thoughts"
    }
}

// =================== SCENE AGENT ===================

#[derive(Debug)]
pub struct SceneInput<'a> {
    pub plan: &'a ChapterPlan,
    pub chapter_number: usize,
    pub context: &'a ChapterContext,
    pub structure_slots: &'a SlotNames,
    pub tone_guidance: &'a ToneGuidance,
    pub story_outline: &'a str,
    pub genre: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct SceneOutput {
    pub content: String,
    pub descriptions: SlotMap,
    pub actions: SlotMap,
    pub scene_type: SceneType,
    pub metadata: AgentMetadata,
}

#[derive(Debug, Default)]
pub struct SceneAgent;

impl SceneAgent {
    pub async fn generate(
        &self,
        llm: &dyn LlmClient,
        input: &SceneInput<'_>,
    ) -> Result<SceneOutput, LlmError> {
        let started = Instant::now();
        let scene_type = detect_scene_type(input.plan);
        log::info!(
            "Scene agent: atmosphere and action for chapter {} ({:?} scene)",
            input.chapter_number,
            scene_type
        );

        let req = GenRequest::new(self.user_prompt(input, scene_type))
            .system(self.system_prompt(input.genre))
            .sampling(0.8, 0.9, 40);
        let content = llm.generate(&req).await?;

        let slots = extract_slots(&content);
        let mut descriptions = SlotMap::new();
        let mut actions = SlotMap::new();
        for (id, text) in &slots {
            if id.contains("DESCRIPTION") {
                descriptions.insert(id.clone(), text.clone());
            } else if id.contains("ACTION") {
                actions.insert(id.clone(), text.clone());
            }
        }

        Ok(SceneOutput {
            metadata: AgentMetadata {
                agent: "Scene",
                processing_ms: started.elapsed().as_millis(),
                confidence: SCENE_CONFIDENCE,
                notes: vec![format!(
                    "Generated {} descriptions and {} action beats",
                    descriptions.len(),
                    actions.len()
                )],
            },
            content,
            descriptions,
            actions,
            scene_type,
        })
    }

    fn system_prompt(&self, genre: Option<&str>) -> String {
        let genre_note = match genre {
            Some(g) => format!("Writing in {} genre.", g.to_uppercase()),
            None => "Using general fiction techniques.".to_string(),
        };
        format!(
            "You are a master of atmospheric writing and action sequences. Your specialty is \
             creating vivid, immersive scenes that engage all the senses.\n\n\
             {}\n\n\
             CORE PRINCIPLES:\n\
             - Use ALL FIVE SENSES, not just sight and sound\n\
             - Specific details over general descriptions\n\
             - Action sequences focus on IMPACT and MOVEMENT\n\
             - Environment reflects and amplifies story mood\n\n\
             PACING BY SCENE TYPE:\n\
             - ACTION scenes: Short, punchy sentences (8-12 words). Rapid-fire verbs.\n\
             - EMOTIONAL scenes: Longer, flowing sentences (15-20 words). Rich sensory details.\n\
             - REVELATION scenes: Medium sentences (12-15 words). Specific concrete details.\n\
             - SETUP scenes: Varied sentence length.\n\n\
             You will write content for specific slots that must integrate seamlessly with \
             dialogue and character moments from other specialists.",
            genre_note
        )
    }

    fn user_prompt(&self, input: &SceneInput<'_>, scene_type: SceneType) -> String {
        let description_slots = input
            .structure_slots
            .description
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. [{}]", i + 1, s))
            .collect::<Vec<_>>()
            .join("\n");
        let action_slots = input
            .structure_slots
            .action
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. [{}]", i + 1, s))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Generate scene content for Chapter {}: \"{}\"\n\n\
             **STORY OUTLINE - WORLD & ATMOSPHERE CONTEXT:**\n{}\n\n\
             **SCENE TYPE DETECTED:** {:?}\n\
             **REQUIRED PACING:** {}\n\n\
             **TONE COORDINATION:**\n\
             Use {}; write with {}.\n\n\
             **ATMOSPHERE REQUIRED:** {}\n\
             **TENSION LEVEL:** {}/10\n\n\
             **DESCRIPTION SLOTS TO FILL:**\n{}\n\n\
             **ACTION SLOTS TO FILL:**\n{}\n\n\
             **OUTPUT FORMAT - MANDATORY:**\n\
             Output ONLY slot content, one slot per block:\n\n\
             [SLOT_NAME]: Content goes here on the same line or continuing lines\n\n\
             Do not add introductions, numbered lists, or markdown headers.\n\n\
             **NOW GENERATE ALL SLOT CONTENT IN THE CORRECT FORMAT:**",
            input.chapter_number,
            input.plan.title,
            input.story_outline,
            scene_type,
            pacing_instructions(scene_type),
            input.tone_guidance.description_length,
            input.tone_guidance.sentence_style,
            input.context.mood,
            input.context.tension_target,
            description_slots,
            action_slots,
        )
    }
}

/// Sentence-length targets per scene type, fed verbatim into the scene
/// prompt.
pub fn pacing_instructions(scene_type: SceneType) -> &'static str {
    match scene_type {
        SceneType::Action | SceneType::Climax => {
            "Short punchy sentences (8-12 words). Rapid verbs. Minimal description. Focus on movement and impact."
        }
        SceneType::Emotional => {
            "Longer flowing sentences (15-20 words). Rich sensory details. Deep atmospheric description."
        }
        SceneType::Revelation => {
            "Medium sentences (12-15 words). Focus on specific concrete details. Clear, precise descriptions."
        }
        SceneType::Setup => {
            "Varied sentence length. Balance between action and description based on moment."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Character;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct MockLlm {
        response: String,
        calls: Arc<Mutex<usize>>,
    }

    impl MockLlm {
        fn new(response: &str) -> Self {
            Self {
                response: response.to_string(),
                calls: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn generate(&self, _req: &GenRequest) -> Result<String, LlmError> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.response.clone())
        }
    }

    fn test_plan() -> ChapterPlan {
        ChapterPlan {
            title: "The Gate".into(),
            summary: "They reach the gate and discover the guard knows them.".into(),
            conflict_type: "interpersonal".into(),
            character_development_focus: "trust between Mara and Joss".into(),
            tension_level: 6,
            target_word_count: 5000,
            ..Default::default()
        }
    }

    fn roster() -> CharacterRoster {
        let mut r = CharacterRoster::new();
        r.insert("Mara".into(), Character::default());
        r.insert("Joss".into(), Character::default());
        r
    }

    #[test]
    fn test_dialogue_requirements_from_plan_fields() {
        let reqs = derive_dialogue_requirements(&test_plan(), &roster());
        let ids: Vec<&str> = reqs.iter().map(|r| r.slot_id.as_str()).collect();
        assert!(ids.contains(&"DIALOGUE_CHARACTER_DEVELOPMENT"));
        assert!(ids.contains(&"DIALOGUE_CONFLICT"));
        assert!(!ids.contains(&"DIALOGUE_MAIN"));
    }

    #[test]
    fn test_dialogue_requirements_default() {
        let plan = ChapterPlan {
            title: "Quiet".into(),
            tension_level: 3,
            target_word_count: 4000,
            ..Default::default()
        };
        let reqs = derive_dialogue_requirements(&plan, &CharacterRoster::new());
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].slot_id, "DIALOGUE_MAIN");
        assert_eq!(reqs[0].characters, vec!["protagonist".to_string()]);
    }

    #[tokio::test]
    async fn test_structure_agent_scans_own_output() {
        let skeleton = "Mara reached the gate at dusk. [DESCRIPTION_GATE] The guard \
                        stepped forward. [DIALOGUE_GUARD_CHALLENGE] Her stomach dropped. \
                        [INTERNAL_MARA_DREAD] He reached for her papers. [ACTION_SEIZE] \
                        [TRANSITION_INSIDE]";
        let llm = MockLlm::new(skeleton);

        let plan = test_plan();
        let context = ChapterContext::default();
        let input = StructureInput {
            plan: &plan,
            chapter_number: 2,
            context: &context,
            previous_chapter_end: Some("The road bent north."),
            target_length: 5000,
            story_outline: "outline",
        };
        let out = StructureAgent.generate(&llm, &input).await.unwrap();

        assert_eq!(out.slots.dialogue, vec!["DIALOGUE_GUARD_CHALLENGE"]);
        assert_eq!(out.slots.transition, vec!["TRANSITION_INSIDE"]);
        assert_eq!(out.metadata.confidence, 85);
        assert_eq!(*llm.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_character_agent_splits_dialogue_and_internal() {
        let response = "[DIALOGUE_GUARD_CHALLENGE]: \"Papers,\" the guard said, already bored.\n\n\
                        [INTERNAL_MARA_DREAD]: He knew her face. She was sure of it now.";
        let llm = MockLlm::new(response);

        let plan = test_plan();
        let context = ChapterContext::default();
        let slots = SlotNames {
            dialogue: vec!["DIALOGUE_GUARD_CHALLENGE".into()],
            internal: vec!["INTERNAL_MARA_DREAD".into()],
            ..Default::default()
        };
        let reqs = derive_dialogue_requirements(&plan, &roster());
        let input = CharacterInput {
            plan: &plan,
            chapter_number: 2,
            context: &context,
            structure_slots: &slots,
            dialogue_requirements: &reqs,
            story_outline: "outline",
            genre: Some("thriller"),
        };
        let out = CharacterAgent.generate(&llm, &input).await.unwrap();

        assert_eq!(out.dialogue.len(), 1);
        assert_eq!(out.internal.len(), 1);
        assert!(out.internal["INTERNAL_MARA_DREAD"].contains("knew her face"));
    }

    #[tokio::test]
    async fn test_scene_agent_classifies_and_splits() {
        let response = "[DESCRIPTION_GATE]: Rust streaked the iron bands of the gate.\n\n\
                        [ACTION_SEIZE]: His hand closed on her wrist before she could step back.";
        let llm = MockLlm::new(response);

        let plan = ChapterPlan {
            title: "The Gate".into(),
            summary: "A fight breaks out at the gate.".into(),
            tension_level: 8,
            target_word_count: 5000,
            ..Default::default()
        };
        let context = ChapterContext::default();
        let slots = SlotNames {
            description: vec!["DESCRIPTION_GATE".into()],
            action: vec!["ACTION_SEIZE".into()],
            ..Default::default()
        };
        let guidance = ToneGuidance {
            description_length: "short, clipped descriptions",
            sentence_style: "short declarative sentences, minimal subordinate clauses",
        };
        let input = SceneInput {
            plan: &plan,
            chapter_number: 2,
            context: &context,
            structure_slots: &slots,
            tone_guidance: &guidance,
            story_outline: "outline",
            genre: None,
        };
        let out = SceneAgent.generate(&llm, &input).await.unwrap();

        assert_eq!(out.scene_type, SceneType::Action);
        assert_eq!(out.descriptions.len(), 1);
        assert_eq!(out.actions.len(), 1);
    }

    #[tokio::test]
    async fn test_adapter_error_propagates() {
        #[derive(Debug)]
        struct FailingLlm;

        #[async_trait]
        impl LlmClient for FailingLlm {
            async fn generate(&self, _req: &GenRequest) -> Result<String, LlmError> {
                Err(LlmError::CannotConnect("http://127.0.0.1:1234".into()))
            }
        }

        let plan = test_plan();
        let context = ChapterContext::default();
        let input = StructureInput {
            plan: &plan,
            chapter_number: 1,
            context: &context,
            previous_chapter_end: None,
            target_length: 5000,
            story_outline: "outline",
        };
        let err = StructureAgent.generate(&FailingLlm, &input).await.unwrap_err();
        assert!(err.is_terminal());
    }
}
