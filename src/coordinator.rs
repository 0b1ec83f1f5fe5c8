//! Chapter pipeline: runs the specialist agents, synthesis, and corrective
//! passes as a fixed sequence of named phases.
//!
//! Every phase is timed and caught. A phase failure short-circuits the
//! pipeline; the result carries the partial phase list instead of an error,
//! so a single bad chapter never takes the book run down.

use crate::config::GenerationConfig;
use crate::context::{BalanceIssue, StoryContext, SuggestedFix};
use crate::corrections::{
    condense_internal_monologue, detect_repetition, fix_repetitions, insert_micro_actions,
    reduce_description_density,
};
use crate::llm::{GenRequest, LlmClient};
use crate::plan::{ChapterData, ChapterPlan, CharacterRoster};
use crate::specialists::{
    derive_dialogue_requirements, CharacterAgent, CharacterInput, SceneAgent, SceneInput,
    StructureAgent, StructureInput,
};
use crate::synthesis::{SynthesisAgent, SynthesisInput};
use std::time::Instant;

pub const PHASE_CONTEXT: &str = "Context Preparation";
pub const PHASE_SPECIALISTS: &str = "Coordinated Specialist Generation";
pub const PHASE_SYNTHESIS: &str = "Synthesis & Macro Validation";
pub const PHASE_POLISH: &str = "Light Polish";
pub const PHASE_REPETITION: &str = "Repetition Check";
pub const PHASE_COHERENCE: &str = "Coherence Update";

/// Polished text shorter than half the draft means the model summarized
/// instead of polishing; the draft is kept.
const POLISH_MIN_RATIO: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct ChapterInput<'a> {
    pub plan: &'a ChapterPlan,
    pub chapter_number: usize,
    pub story_outline: &'a str,
    pub previous_chapter_end: Option<&'a str>,
    pub target_words: usize,
    pub genre: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct GenerationPhaseResult {
    pub phase_name: &'static str,
    pub duration_ms: u128,
    pub success: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct AgentTiming {
    pub agent: &'static str,
    pub processing_ms: u128,
    pub confidence: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QualityMetrics {
    pub coherence: u32,
    pub integration: u32,
    pub polish: u32,
}

#[derive(Debug, Clone)]
pub struct HybridGenerationResult {
    pub chapter_content: String,
    pub success: bool,
    pub phases: Vec<GenerationPhaseResult>,
    pub agent_timings: Vec<AgentTiming>,
    pub quality: QualityMetrics,
    pub transitions_added: usize,
    pub conflicts_resolved: usize,
    pub total_ms: u128,
}

#[derive(Debug, Default)]
pub struct ChapterPipeline {
    structure: StructureAgent,
    character: CharacterAgent,
    scene: SceneAgent,
    synthesis: SynthesisAgent,
}

struct PhaseTimer {
    name: &'static str,
    started: Instant,
}

impl PhaseTimer {
    fn start(name: &'static str) -> Self {
        log::info!("Phase started: {}", name);
        Self {
            name,
            started: Instant::now(),
        }
    }

    fn ok(self, warnings: Vec<String>) -> GenerationPhaseResult {
        let duration_ms = self.started.elapsed().as_millis();
        log::info!("Phase completed: {} ({}ms)", self.name, duration_ms);
        GenerationPhaseResult {
            phase_name: self.name,
            duration_ms,
            success: true,
            errors: Vec::new(),
            warnings,
        }
    }

    fn fail(self, error: String) -> GenerationPhaseResult {
        let duration_ms = self.started.elapsed().as_millis();
        log::error!("Phase failed: {} ({}ms): {}", self.name, duration_ms, error);
        GenerationPhaseResult {
            phase_name: self.name,
            duration_ms,
            success: false,
            errors: vec![error],
            warnings: Vec::new(),
        }
    }
}

impl ChapterPipeline {
    /// Runs the full phased pipeline for one chapter. Infallible at the
    /// boundary: failures surface in the phase list with `success: false`.
    pub async fn generate_chapter(
        &self,
        llm: &dyn LlmClient,
        story: &mut StoryContext,
        roster: &CharacterRoster,
        input: &ChapterInput<'_>,
        config: &GenerationConfig,
    ) -> HybridGenerationResult {
        let run_started = Instant::now();
        let mut phases = Vec::new();
        let mut timings = Vec::new();

        let fail = |phases: Vec<GenerationPhaseResult>,
                    timings: Vec<AgentTiming>,
                    total_ms: u128| HybridGenerationResult {
            chapter_content: String::new(),
            success: false,
            phases,
            agent_timings: timings,
            quality: QualityMetrics::default(),
            transitions_added: 0,
            conflicts_resolved: 0,
            total_ms,
        };

        // --- Context Preparation ---
        let timer = PhaseTimer::start(PHASE_CONTEXT);
        let scene_type = crate::context::detect_scene_type(input.plan);
        story.initialize_chapter(input.chapter_number, scene_type);
        let chapter_context = story.prepare_chapter_context(input.chapter_number, input.plan);
        let dialogue_requirements = derive_dialogue_requirements(input.plan, roster);
        phases.push(timer.ok(Vec::new()));

        // --- Coordinated Specialist Generation ---
        let timer = PhaseTimer::start(PHASE_SPECIALISTS);
        let mut specialist_warnings = Vec::new();

        let structure = match self
            .structure
            .generate(
                llm,
                &StructureInput {
                    plan: input.plan,
                    chapter_number: input.chapter_number,
                    context: &chapter_context,
                    previous_chapter_end: input.previous_chapter_end,
                    target_length: input.target_words,
                    story_outline: input.story_outline,
                },
            )
            .await
        {
            Ok(out) => out,
            Err(e) => {
                phases.push(timer.fail(format!("structure agent: {}", e)));
                return fail(phases, timings, run_started.elapsed().as_millis());
            }
        };
        story.register_structure_output(&structure.chapter_structure);
        timings.push(AgentTiming {
            agent: structure.metadata.agent,
            processing_ms: structure.metadata.processing_ms,
            confidence: structure.metadata.confidence,
        });

        let mut character = match self
            .character
            .generate(
                llm,
                &CharacterInput {
                    plan: input.plan,
                    chapter_number: input.chapter_number,
                    context: &chapter_context,
                    structure_slots: &structure.slots,
                    dialogue_requirements: &dialogue_requirements,
                    story_outline: input.story_outline,
                    genre: input.genre,
                },
            )
            .await
        {
            Ok(out) => out,
            Err(e) => {
                phases.push(timer.fail(format!("character agent: {}", e)));
                return fail(phases, timings, run_started.elapsed().as_millis());
            }
        };
        timings.push(AgentTiming {
            agent: character.metadata.agent,
            processing_ms: character.metadata.processing_ms,
            confidence: character.metadata.confidence,
        });

        // Advisory limit check on the character material; the fix is applied
        // mechanically rather than by re-prompting.
        let check = story.check_content_limits("character", &character.content);
        if let Some(fix) = check.suggested_action {
            let reason = check.reason.unwrap_or_default();
            specialist_warnings.push(format!("character content limits: {}", reason));
            character.content = match fix {
                SuggestedFix::CondenseInternal => condense_internal_monologue(&character.content),
                SuggestedFix::AddMicroAction => insert_micro_actions(&character.content),
            };
        }
        story.register_character_output(&character.content);

        let tone_guidance = story.get_tone_guidance_for_scene();
        let scene = match self
            .scene
            .generate(
                llm,
                &SceneInput {
                    plan: input.plan,
                    chapter_number: input.chapter_number,
                    context: &chapter_context,
                    structure_slots: &structure.slots,
                    tone_guidance: &tone_guidance,
                    story_outline: input.story_outline,
                    genre: input.genre,
                },
            )
            .await
        {
            Ok(out) => out,
            Err(e) => {
                phases.push(timer.fail(format!("scene agent: {}", e)));
                return fail(phases, timings, run_started.elapsed().as_millis());
            }
        };
        story.register_scene_output(&scene.descriptions, &scene.actions);
        timings.push(AgentTiming {
            agent: scene.metadata.agent,
            processing_ms: scene.metadata.processing_ms,
            confidence: scene.metadata.confidence,
        });
        phases.push(timer.ok(specialist_warnings));

        // --- Synthesis & Macro Validation ---
        let timer = PhaseTimer::start(PHASE_SYNTHESIS);
        let mut synthesis_warnings = Vec::new();
        let synthesis = self
            .synthesis
            .integrate(
                llm,
                &SynthesisInput {
                    structure: &structure,
                    character: &character,
                    scene: &scene,
                    chapter_number: input.chapter_number,
                    chapter_title: &input.plan.title,
                },
            )
            .await;
        timings.push(AgentTiming {
            agent: "synthesis",
            processing_ms: synthesis.processing_ms,
            confidence: synthesis.confidence,
        });

        let mut content = synthesis.integrated_chapter.clone();
        let balance = story.validate_chapter_balance();
        for issue in &balance.issues {
            synthesis_warnings.push(format!("balance: {:?}", issue));
            content = match issue {
                BalanceIssue::DescriptionOverload => reduce_description_density(&content),
                BalanceIssue::InternalOverload => condense_internal_monologue(&content),
                BalanceIssue::ConsecutiveDescription => insert_micro_actions(&content),
            };
        }
        let balanced = balance.issues.is_empty();
        phases.push(timer.ok(synthesis_warnings));

        // --- Light Polish ---
        let timer = PhaseTimer::start(PHASE_POLISH);
        let mut polish_applied = false;
        let mut polish_warnings = Vec::new();
        if config.enable_light_polish {
            let req = GenRequest::new(format!(
                "Lightly polish the chapter below. Smooth transitions between \
                 sections and fix awkward phrasing. Keep all content, dialogue, \
                 and structure intact.\n\n{}\n\nOutput the full polished chapter:",
                content
            ))
            .system("You are a copy editor applying a light pass to a finished draft.")
            .sampling(0.4, 0.8, 30);
            match llm.generate(&req).await {
                Ok(polished) => {
                    if (polished.len() as f64) < content.len() as f64 * POLISH_MIN_RATIO {
                        polish_warnings
                            .push("polished text too short, keeping draft".to_string());
                    } else {
                        content = polished;
                        polish_applied = true;
                    }
                }
                Err(e) => {
                    polish_warnings.push(format!("polish call failed, keeping draft: {}", e));
                }
            }
        } else {
            polish_warnings.push("light polish disabled".to_string());
        }
        phases.push(timer.ok(polish_warnings));

        // --- Repetition Check ---
        let timer = PhaseTimer::start(PHASE_REPETITION);
        let mut repetition_warnings = Vec::new();
        let report = detect_repetition(&content);
        if !report.issues.is_empty() {
            repetition_warnings.push(format!(
                "{} repeated phrase(s), {} total repetitions",
                report.issues.len(),
                report.total_repetitions
            ));
            content = fix_repetitions(&content, &report);
        }
        phases.push(timer.ok(repetition_warnings));

        // --- Coherence Update ---
        let timer = PhaseTimer::start(PHASE_COHERENCE);
        story.update_from_chapter(
            &ChapterData {
                title: input.plan.title.clone(),
                content: content.clone(),
                plan: input.plan.format(),
                summary: input.plan.summary.clone(),
            },
            input.chapter_number,
        );
        phases.push(timer.ok(Vec::new()));

        let quality = QualityMetrics {
            coherence: if balanced { 90 } else { 60 },
            integration: if synthesis.total_slots_filled > 0 { 85 } else { 50 },
            polish: if polish_applied { 80 } else { 70 },
        };

        HybridGenerationResult {
            chapter_content: content,
            success: true,
            phases,
            agent_timings: timings,
            quality,
            transitions_added: synthesis.transitions_added.len(),
            conflicts_resolved: synthesis.conflicts_resolved.len(),
            total_ms: run_started.elapsed().as_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct SeqLlm {
        responses: Mutex<VecDeque<Result<String, LlmError>>>,
    }

    impl SeqLlm {
        fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for SeqLlm {
        async fn generate(&self, _req: &GenRequest) -> Result<String, LlmError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LlmError::Empty))
        }
    }

    fn plan() -> ChapterPlan {
        ChapterPlan {
            title: "The Breach".into(),
            summary: "The crew discovers the breach and argues over the response.".into(),
            tension_level: 8,
            rhythm_pacing: "fast".into(),
            ..Default::default()
        }
    }

    fn config() -> GenerationConfig {
        GenerationConfig {
            enable_light_polish: false,
            ..Default::default()
        }
    }

    fn story() -> StoryContext {
        StoryContext::new("A station crew fights a slow hull breach.".into(), CharacterRoster::new())
    }

    #[tokio::test]
    async fn test_all_phases_run_in_order_on_success() {
        // Call order: structure, character, scene, transitions, integration.
        let llm = SeqLlm::new(vec![
            Ok("The klaxon died mid-wail.\n\n[DIALOGUE_MAIN]\n\n[DESCRIPTION_1]\n\nNobody moved.".into()),
            Ok("[DIALOGUE_MAIN]: \"We seal deck four,\" Imre said.".into()),
            Ok("[DESCRIPTION_1]: Frost crept along the viewport seam.".into()),
            Ok("The silence stretched.\nA beat later.".into()),
            Ok("The klaxon died mid-wail. \"We seal deck four,\" Imre said. Frost crept along the viewport seam. Nobody moved.".into()),
        ]);
        let pipeline = ChapterPipeline::default();
        let mut story = story();
        let roster = CharacterRoster::new();
        let plan = plan();
        let result = pipeline
            .generate_chapter(
                &llm,
                &mut story,
                &roster,
                &ChapterInput {
                    plan: &plan,
                    chapter_number: 1,
                    story_outline: "outline",
                    previous_chapter_end: None,
                    target_words: 5000,
                    genre: None,
                },
                &config(),
            )
            .await;

        assert!(result.success);
        let names: Vec<_> = result.phases.iter().map(|p| p.phase_name).collect();
        assert_eq!(
            names,
            vec![
                PHASE_CONTEXT,
                PHASE_SPECIALISTS,
                PHASE_SYNTHESIS,
                PHASE_POLISH,
                PHASE_REPETITION,
                PHASE_COHERENCE
            ]
        );
        assert!(result.phases.iter().all(|p| p.success));
        assert!(!result.chapter_content.contains('['));
        assert_eq!(result.quality.coherence, 90);
        assert!(result.agent_timings.len() >= 4);
        assert_eq!(story.chapter_summaries.len(), 1);
    }

    #[tokio::test]
    async fn test_specialist_failure_short_circuits() {
        // Structure succeeds, character agent fails; later phases never run.
        let llm = SeqLlm::new(vec![
            Ok("Opening.\n\n[DIALOGUE_MAIN]\n\nClosing.".into()),
            Err(LlmError::CannotConnect("refused".into())),
        ]);
        let pipeline = ChapterPipeline::default();
        let mut story = story();
        let roster = CharacterRoster::new();
        let plan = plan();
        let result = pipeline
            .generate_chapter(
                &llm,
                &mut story,
                &roster,
                &ChapterInput {
                    plan: &plan,
                    chapter_number: 2,
                    story_outline: "outline",
                    previous_chapter_end: Some("last line"),
                    target_words: 4000,
                    genre: Some("thriller"),
                },
                &config(),
            )
            .await;

        assert!(!result.success);
        assert!(result.chapter_content.is_empty());
        assert_eq!(result.phases.len(), 2);
        assert_eq!(result.phases[0].phase_name, PHASE_CONTEXT);
        assert!(result.phases[0].success);
        assert_eq!(result.phases[1].phase_name, PHASE_SPECIALISTS);
        assert!(!result.phases[1].success);
        assert!(result.phases[1].errors[0].contains("character agent"));
    }

    #[tokio::test]
    async fn test_light_polish_length_guard_keeps_draft() {
        // Polish response is a stub far shorter than the draft; it must be
        // rejected and the synthesized text kept.
        let draft = "The klaxon died mid-wail. \"We seal deck four,\" Imre said. \
                     Frost crept along the viewport seam. Nobody moved at all. \
                     The deck plates shivered underfoot while the crew waited.";
        let llm = SeqLlm::new(vec![
            Ok("Opening.\n\n[DIALOGUE_MAIN]\n\nClosing.".into()),
            Ok("[DIALOGUE_MAIN]: \"We seal deck four,\" Imre said.".into()),
            Ok("[DESCRIPTION_1]: Frost crept along the viewport seam.".into()),
            Ok("A beat later.".into()),
            Ok(draft.into()),
            Ok("Short.".into()),
        ]);
        let pipeline = ChapterPipeline::default();
        let mut story = story();
        let roster = CharacterRoster::new();
        let plan = plan();
        let cfg = GenerationConfig {
            enable_light_polish: true,
            ..Default::default()
        };
        let result = pipeline
            .generate_chapter(
                &llm,
                &mut story,
                &roster,
                &ChapterInput {
                    plan: &plan,
                    chapter_number: 1,
                    story_outline: "outline",
                    previous_chapter_end: None,
                    target_words: 5000,
                    genre: None,
                },
                &cfg,
            )
            .await;

        assert!(result.success);
        assert_eq!(result.chapter_content, draft);
        let polish = result
            .phases
            .iter()
            .find(|p| p.phase_name == PHASE_POLISH)
            .unwrap();
        assert!(polish.warnings[0].contains("too short"));
        assert_eq!(result.quality.polish, 70);
    }
}
