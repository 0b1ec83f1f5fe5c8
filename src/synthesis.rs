//! Synthesis agent: merges the three specialists' outputs into one chapter.
//!
//! Integration prefers a low-temperature assembly call that is told to
//! preserve specialist wording verbatim; if the model is unavailable the
//! deterministic `fill_slots` substitution runs instead. Unfilled slot
//! markers are left visible in the output so failures stay diagnosable.

use crate::llm::{GenRequest, LlmClient};
use crate::specialists::{CharacterOutput, SceneOutput, StructureOutput};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SourceAgent {
    Scene = 1,
    Character = 2,
    Structure = 3,
}

#[derive(Debug, Clone)]
pub struct SlotMapping {
    pub slot_id: String,
    pub content: String,
    pub source: SourceAgent,
    pub priority: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    Tone,
    Pacing,
    Content,
}

#[derive(Debug, Clone)]
pub struct ConflictResolution {
    pub conflict_type: ConflictType,
    pub description: String,
    pub resolution: String,
}

#[derive(Debug)]
pub struct SynthesisInput<'a> {
    pub structure: &'a StructureOutput,
    pub character: &'a CharacterOutput,
    pub scene: &'a SceneOutput,
    pub chapter_number: usize,
    pub chapter_title: &'a str,
}

#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    pub integrated_chapter: String,
    pub transitions_added: Vec<String>,
    pub integration_notes: Vec<String>,
    pub conflicts_resolved: Vec<ConflictResolution>,
    pub processing_ms: u128,
    pub confidence: u32,
    pub total_slots_filled: usize,
}

static UNFILLED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]+)\]").unwrap());

const FALLBACK_TRANSITIONS: [&str; 5] = [
    "A moment passed.",
    "The silence stretched.",
    "Something shifted in the air.",
    "Time seemed to slow.",
    "The atmosphere changed.",
];

#[derive(Debug, Default)]
pub struct SynthesisAgent;

impl SynthesisAgent {
    pub async fn integrate(&self, llm: &dyn LlmClient, input: &SynthesisInput<'_>) -> SynthesisOutput {
        let started = Instant::now();
        log::info!(
            "Synthesis: integrating chapter {} \"{}\"",
            input.chapter_number,
            input.chapter_title
        );

        let (mappings, conflicts) = map_all_slots(input);
        for conflict in &conflicts {
            log::warn!("Slot conflict: {} ({})", conflict.description, conflict.resolution);
        }

        let transitions = self.generate_transitions(llm, &mappings, input).await;
        let integrated = self
            .perform_integration(llm, &input.structure.chapter_structure, &mappings, &transitions)
            .await;

        let confidence = calculate_confidence(mappings.len(), conflicts.len());
        log::info!(
            "Synthesis complete: {} slots integrated, confidence {}",
            mappings.len(),
            confidence
        );

        SynthesisOutput {
            integrated_chapter: integrated,
            transitions_added: transitions,
            integration_notes: integration_notes(&mappings),
            conflicts_resolved: conflicts,
            processing_ms: started.elapsed().as_millis(),
            confidence,
            total_slots_filled: mappings.len(),
        }
    }

    /// One lightweight call for 3-5 connective phrases; static list on
    /// failure.
    async fn generate_transitions(
        &self,
        llm: &dyn LlmClient,
        mappings: &BTreeMap<String, SlotMapping>,
        input: &SynthesisInput<'_>,
    ) -> Vec<String> {
        let preview = mappings
            .iter()
            .take(5)
            .map(|(id, m)| {
                let head: String = m.content.chars().take(100).collect();
                format!("{}: {}...", id, head)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let req = GenRequest::new(format!(
            "Create subtle transitions for Chapter {}: \"{}\"\n\n\
             **CONTENT TO CONNECT:**\n{}\n\n\
             **OUTPUT FORMAT:**\n\
             Provide 3-5 short transition phrases that can be inserted between content \
             blocks. Each should be 5-15 words maximum, one per line.\n\n\
             Generate transitions now:",
            input.chapter_number, input.chapter_title, preview
        ))
        .system(
            "You are a narrative flow specialist. Your job is to create smooth, natural \
             transitions between different types of content. Your transitions must be SUBTLE \
             and BRIEF - just enough to connect different elements smoothly.",
        )
        .sampling(0.6, 0.8, 30);

        match llm.generate(&req).await {
            Ok(text) => {
                let parsed: Vec<String> = text
                    .lines()
                    .map(str::trim)
                    .filter(|l| l.len() > 5 && l.len() < 100)
                    .map(|l| l.trim_matches('"').to_string())
                    .take(5)
                    .collect();
                if parsed.is_empty() {
                    FALLBACK_TRANSITIONS.iter().map(|s| s.to_string()).collect()
                } else {
                    parsed
                }
            }
            Err(err) => {
                log::warn!("Transition generation failed, using basic ones: {}", err);
                FALLBACK_TRANSITIONS.iter().map(|s| s.to_string()).collect()
            }
        }
    }

    /// Low-temperature assembly call; deterministic substitution on failure.
    async fn perform_integration(
        &self,
        llm: &dyn LlmClient,
        template: &str,
        mappings: &BTreeMap<String, SlotMapping>,
        transitions: &[String],
    ) -> String {
        let slot_lines = mappings
            .values()
            .map(|m| format!("[{}]: {}", m.slot_id, m.content))
            .collect::<Vec<_>>()
            .join("\n\n");

        let req = GenRequest::new(format!(
            "Integrate the following content:\n\n\
             **STRUCTURE TEMPLATE:**\n{}\n\n\
             **SLOT CONTENT:**\n{}\n\n\
             **AVAILABLE TRANSITIONS:**\n{}\n\n\
             **INTEGRATION RULES:**\n\
             1. Replace each [SLOT] marker with its corresponding content\n\
             2. Add transitions where content feels disconnected\n\
             3. Maintain natural paragraph breaks\n\
             4. Preserve all specialist content exactly as provided\n\n\
             Perform the integration now:",
            template,
            slot_lines,
            transitions.join("\n")
        ))
        .system(
            "You are a text integration specialist. Your ONLY job is to replace [SLOT] \
             markers with provided content and add smooth transitions. DO NOT rewrite or \
             modify the specialist content, add new plot elements, or change tone. Fill \
             slots with the exact provided content.",
        )
        .sampling(0.3, 0.7, 20);

        match llm.generate(&req).await {
            Ok(text) => text,
            Err(err) => {
                log::warn!("Model integration failed, using slot replacement: {}", err);
                fill_slots(template, mappings, transitions)
            }
        }
    }
}

/// Maps every slot from all three specialists into one table. On a slot ID
/// collision the higher-priority source wins and the collision is recorded.
fn map_all_slots(
    input: &SynthesisInput<'_>,
) -> (BTreeMap<String, SlotMapping>, Vec<ConflictResolution>) {
    let mut mappings: BTreeMap<String, SlotMapping> = BTreeMap::new();
    let mut conflicts = Vec::new();

    let mut insert = |id: &str, content: &str, source: SourceAgent| {
        let candidate = SlotMapping {
            slot_id: id.to_string(),
            content: content.to_string(),
            priority: source as u8,
            source,
        };
        if let Some(existing) = mappings.get(id) {
            let (winner, loser) = if candidate.priority > existing.priority {
                (candidate.clone(), existing.source)
            } else {
                (existing.clone(), candidate.source)
            };
            conflicts.push(ConflictResolution {
                conflict_type: ConflictType::Content,
                description: format!("Slot {} produced by {:?} and {:?}", id, winner.source, loser),
                resolution: format!("kept {:?} content by priority", winner.source),
            });
            mappings.insert(id.to_string(), winner);
        } else {
            mappings.insert(id.to_string(), candidate);
        }
    };

    for (id, content) in input.scene.descriptions.iter().chain(input.scene.actions.iter()) {
        insert(id, content, SourceAgent::Scene);
    }
    for (id, content) in input.character.dialogue.iter().chain(input.character.internal.iter()) {
        insert(id, content, SourceAgent::Character);
    }

    (mappings, conflicts)
}

/// Deterministic fallback assembly: replace every mapped `[ID]`, insert the
/// first transition between the first two paragraphs, and leave unfilled
/// markers visible.
pub fn fill_slots(
    template: &str,
    mappings: &BTreeMap<String, SlotMapping>,
    transitions: &[String],
) -> String {
    let mut integrated = template.to_string();

    let mut ordered: Vec<&SlotMapping> = mappings.values().collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
    for mapping in ordered {
        integrated = integrated.replace(&format!("[{}]", mapping.slot_id), &mapping.content);
    }

    let unfilled: Vec<&str> = UNFILLED
        .find_iter(&integrated)
        .map(|m| m.as_str())
        .collect();
    if !unfilled.is_empty() {
        log::warn!(
            "{} unfilled slots remain after integration: {}",
            unfilled.len(),
            unfilled.join(", ")
        );
    }

    if let Some(transition) = transitions.first() {
        if let Some(split) = integrated.find("\n\n") {
            let (head, tail) = integrated.split_at(split);
            integrated = format!("{}\n\n{}{}", head, transition, tail);
        }
    }

    integrated.trim().to_string()
}

fn integration_notes(mappings: &BTreeMap<String, SlotMapping>) -> Vec<String> {
    let count = |source: SourceAgent| mappings.values().filter(|m| m.source == source).count();
    vec![
        format!("Character agent: {} slots", count(SourceAgent::Character)),
        format!("Scene agent: {} slots", count(SourceAgent::Scene)),
    ]
}

fn calculate_confidence(slot_count: usize, conflict_count: usize) -> u32 {
    let base = 90i64 - 5 * conflict_count as i64 + (2 * slot_count as i64).min(10);
    base.clamp(60, 100) as u32
}
