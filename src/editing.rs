//! Editing agent: a bounded decide, execute, evaluate loop per chapter.
//!
//! The agent is stateless across calls. Progress is reported through an
//! optional structured-event callback; nothing is accumulated internally.

use crate::llm::{GenRequest, LlmClient, LlmError};
use crate::plan::ChapterPlan;
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EditStrategy {
    Skip,
    TargetedEdit,
    Regenerate,
    Polish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDecision {
    pub strategy: EditStrategy,
    pub reasoning: String,
    pub priority: EditPriority,
    pub estimated_changes: String,
    /// 0-100; below the confidence gate the loop escalates toward
    /// regeneration.
    pub confidence: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Decision,
    Execution,
    Evaluation,
    Iteration,
    Warning,
    Success,
    Diff,
}

#[derive(Debug, Clone)]
pub struct AgentLogEvent {
    pub timestamp_ms: u128,
    pub chapter: usize,
    pub kind: LogKind,
    pub message: String,
}

pub type LogSink<'a> = &'a (dyn Fn(&AgentLogEvent) + Send + Sync);

pub struct EditingContext<'a> {
    pub chapter_content: &'a str,
    pub plan: &'a ChapterPlan,
    pub plan_text: &'a str,
    pub critique_notes: String,
    pub chapter_number: usize,
    pub on_log: Option<LogSink<'a>>,
}

#[derive(Debug, Clone)]
pub struct EditingResult {
    pub refined_content: String,
    pub decision: AgentDecision,
    pub changes_applied: Vec<String>,
    pub quality_score: u32,
}

/// Loop thresholds, surfaced from the generation config.
#[derive(Debug, Clone, Copy)]
pub struct EditingLimits {
    pub max_iterations: usize,
    pub quality_gate: u32,
    pub confidence_gate: u32,
}

impl Default for EditingLimits {
    fn default() -> Self {
        Self {
            max_iterations: 2,
            quality_gate: 70,
            confidence_gate: 60,
        }
    }
}

/// Score reported when the evaluation call itself fails, so a transient
/// scoring failure never stalls the loop.
const EVAL_FAILURE_SCORE: u32 = 75;

fn emit(ctx: &EditingContext<'_>, kind: LogKind, message: String) {
    log::info!("chapter {}: {}", ctx.chapter_number, message);
    if let Some(sink) = ctx.on_log {
        sink(&AgentLogEvent {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0),
            chapter: ctx.chapter_number,
            kind,
            message,
        });
    }
}

fn decision_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "strategy": { "type": "string", "enum": ["targeted-edit", "regenerate", "polish", "skip"] },
            "reasoning": { "type": "string" },
            "priority": { "type": "string", "enum": ["high", "medium", "low"] },
            "estimatedChanges": { "type": "string" },
            "confidence": { "type": "number", "description": "Confidence level 0-100" }
        },
        "required": ["strategy", "reasoning", "priority", "estimatedChanges", "confidence"]
    })
}

fn evaluation_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "qualityScore": { "type": "number", "description": "Quality score from 0-100" },
            "changesApplied": { "type": "array", "items": { "type": "string" } },
            "planElementsPresent": { "type": "boolean" },
            "remainingIssues": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["qualityScore", "changesApplied", "planElementsPresent", "remainingIssues"]
    })
}

/// Classifies the current draft into an edit strategy. Falls back to a
/// keyword heuristic over the critique when the call or parse fails.
async fn analyze_and_decide(ctx: &EditingContext<'_>, llm: &dyn LlmClient) -> AgentDecision {
    let prompt = format!(
        "Analyze the editorial situation for Chapter {} and choose an editing strategy.\n\n\
         **CRITIQUE NOTES:**\n{}\n\n\
         **CHAPTER PLAN:**\n{}\n\n\
         **CHAPTER LENGTH:** {} characters\n\n\
         Choose exactly one strategy:\n\
         - \"skip\": chapter is strong, no changes needed\n\
         - \"targeted-edit\": surgical fixes for specific language-level issues\n\
         - \"regenerate\": serious structural problems, full rewrite needed\n\
         - \"polish\": minor improvements only\n\n\
         Respond with a JSON object.",
        ctx.chapter_number,
        if ctx.critique_notes.is_empty() {
            "No issues identified"
        } else {
            &ctx.critique_notes
        },
        ctx.plan_text,
        ctx.chapter_content.len()
    );

    let req = GenRequest::new(prompt)
        .system("You are an editorial strategist. Decide how a chapter draft should be revised.")
        .schema(decision_schema())
        .sampling(0.3, 0.7, 20);

    let decision = match llm.generate(&req).await {
        Ok(text) => serde_json::from_str::<AgentDecision>(&text).ok(),
        Err(err) => {
            log::warn!("Decision call failed, falling back to heuristics: {}", err);
            None
        }
    };

    let decision = decision.unwrap_or_else(|| fallback_decision(&ctx.critique_notes));

    emit(
        ctx,
        LogKind::Decision,
        format!("Strategy: {:?} - {}", decision.strategy, decision.reasoning),
    );
    if decision.confidence < 60 {
        emit(
            ctx,
            LogKind::Warning,
            format!("Low confidence ({}%) in decision", decision.confidence),
        );
    }
    decision
}

/// Keyword heuristic used when the decision call is unavailable.
pub fn fallback_decision(critique: &str) -> AgentDecision {
    let lower = critique.to_lowercase();

    if critique.is_empty() || critique.contains("CHAPTER IS STRONG") {
        return AgentDecision {
            strategy: EditStrategy::Skip,
            reasoning: "No issues identified or chapter marked as strong".into(),
            priority: EditPriority::Low,
            estimated_changes: "0%".into(),
            confidence: 90,
        };
    }
    if lower.contains("moral simplicity") || lower.contains("flat") || lower.contains("archetypal")
    {
        return AgentDecision {
            strategy: EditStrategy::Regenerate,
            reasoning: "Serious structural issues detected".into(),
            priority: EditPriority::High,
            estimated_changes: "40-60%".into(),
            confidence: 75,
        };
    }
    if lower.contains("metaphor") || lower.contains("adjective") || lower.contains("adverb") {
        return AgentDecision {
            strategy: EditStrategy::TargetedEdit,
            reasoning: "Language-level issues detected".into(),
            priority: EditPriority::Medium,
            estimated_changes: "10-20%".into(),
            confidence: 70,
        };
    }
    AgentDecision {
        strategy: EditStrategy::Polish,
        reasoning: "Minor improvements needed".into(),
        priority: EditPriority::Low,
        estimated_changes: "5-10%".into(),
        confidence: 65,
    }
}

async fn execute_strategy(
    ctx: &EditingContext<'_>,
    content: &str,
    decision: &AgentDecision,
    llm: &dyn LlmClient,
) -> Result<String, LlmError> {
    let refined = match decision.strategy {
        EditStrategy::Skip => {
            emit(ctx, LogKind::Execution, "Skipping edits - chapter is strong".into());
            content.to_string()
        }
        EditStrategy::TargetedEdit => {
            emit(ctx, LogKind::Execution, "Applying targeted edits".into());
            let req = GenRequest::new(format!(
                "Apply surgical fixes to the chapter below. Change ONLY what the critique \
                 requires; leave everything else byte-for-byte identical.\n\n\
                 **CRITIQUE:**\n{}\n\n**CHAPTER:**\n{}\n\n\
                 Output the full corrected chapter text:",
                ctx.critique_notes, content
            ))
            .system("You are a precise line editor. Make minimal, targeted corrections.")
            .sampling(0.5, 0.8, 40);
            llm.generate(&req).await?
        }
        EditStrategy::Regenerate => {
            emit(ctx, LogKind::Execution, "Regenerating chapter with plan".into());
            let preview: String = content.chars().take(8000).collect();
            let req = GenRequest::new(format!(
                "Rewrite this chapter from scratch, following the plan faithfully.\n\n\
                 **CHAPTER PLAN:**\n{}\n\n\
                 **MORAL DILEMMA:** {}\n\
                 **CHARACTER COMPLEXITY:** {}\n\
                 **CONFLICT TYPE:** {}\n\
                 **TENSION LEVEL:** {}/10\n\n\
                 **PREVIOUS DRAFT (for reference only):**\n{}\n\n\
                 **WHAT WENT WRONG:**\n{}\n\n\
                 Write the complete new chapter:",
                ctx.plan_text,
                ctx.plan.moral_dilemma,
                ctx.plan.character_complexity,
                ctx.plan.conflict_type,
                ctx.plan.tension_level,
                preview,
                ctx.critique_notes
            ))
            .system("You are a novelist rewriting a failed chapter draft. Follow the plan.")
            .sampling(0.7, 0.9, 60);
            llm.generate(&req).await?
        }
        EditStrategy::Polish => {
            emit(ctx, LogKind::Execution, "Polishing chapter".into());
            let req = GenRequest::new(format!(
                "Lightly polish the chapter below: tighten wording, fix awkward phrasing, \
                 improve flow. Do not change plot, dialogue meaning, or structure.\n\n\
                 **KNOWN ISSUES:**\n{}\n\n**CHAPTER:**\n{}\n\n\
                 Output the full polished chapter text:",
                if ctx.critique_notes.is_empty() {
                    "No specific issues"
                } else {
                    &ctx.critique_notes
                },
                content
            ))
            .system("You are a copy editor applying a light final pass.")
            .sampling(0.4, 0.8, 30);
            llm.generate(&req).await?
        }
    };

    if refined != content {
        emit(
            ctx,
            LogKind::Diff,
            format!("Text changes applied via {:?}", decision.strategy),
        );
    }
    Ok(refined)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Evaluation {
    quality_score: u32,
    #[serde(default)]
    changes_applied: Vec<String>,
}

/// Scores the revised draft; defaults to a neutral pass on failure.
async fn evaluate_result(
    ctx: &EditingContext<'_>,
    original: &str,
    refined: &str,
    llm: &dyn LlmClient,
) -> (u32, Vec<String>) {
    let preview: String = refined.chars().take(3000).collect();
    let req = GenRequest::new(format!(
        "Evaluate this revised chapter draft.\n\n\
         Original length: {} characters; revised length: {} characters.\n\
         Plan focus: {} / {}\n\n\
         **REVISED CHAPTER (preview):**\n{}...\n\n\
         Respond with a JSON object scoring the revision.",
        original.len(),
        refined.len(),
        ctx.plan.moral_dilemma,
        ctx.plan.character_complexity,
        preview
    ))
    .system("You are an editorial quality assessor.")
    .schema(evaluation_schema())
    .sampling(0.3, 0.7, 20);

    match llm.generate(&req).await {
        Ok(text) => match serde_json::from_str::<Evaluation>(&text) {
            Ok(eval) => {
                emit(
                    ctx,
                    LogKind::Evaluation,
                    format!("Quality score: {}/100", eval.quality_score),
                );
                (eval.quality_score, eval.changes_applied)
            }
            Err(err) => {
                emit(
                    ctx,
                    LogKind::Warning,
                    format!("Evaluation parse failed ({}), using default score", err),
                );
                (EVAL_FAILURE_SCORE, vec!["Edits applied".into()])
            }
        },
        Err(err) => {
            emit(
                ctx,
                LogKind::Warning,
                format!("Evaluation failed ({}), using default score", err),
            );
            (EVAL_FAILURE_SCORE, vec!["Edits applied".into()])
        }
    }
}

/// Runs the decide, execute, evaluate loop. Terminates on a skip decision,
/// on reaching the quality gate, or when the iteration budget runs out; in
/// the last case the latest draft is accepted regardless of score.
pub async fn agent_edit_chapter(
    mut ctx: EditingContext<'_>,
    llm: &dyn LlmClient,
    limits: &EditingLimits,
) -> Result<EditingResult, LlmError> {
    emit(
        &ctx,
        LogKind::Iteration,
        format!("Agent starting work on chapter {}", ctx.chapter_number),
    );

    let mut current = ctx.chapter_content.to_string();
    let mut last_decision: Option<AgentDecision> = None;
    let mut last_score = 0;
    let mut all_changes = Vec::new();
    let mut iteration = 1;

    while iteration <= limits.max_iterations {
        emit(
            &ctx,
            LogKind::Iteration,
            format!("Iteration {}/{}", iteration, limits.max_iterations),
        );

        let decision = analyze_and_decide(&ctx, llm).await;
        let strategy = decision.strategy;
        let confidence = decision.confidence;
        last_decision = Some(decision.clone());

        if strategy == EditStrategy::Skip {
            emit(&ctx, LogKind::Success, "Chapter is strong, no changes needed".into());
            break;
        }

        let refined = execute_strategy(&ctx, &current, &decision, llm).await?;
        let (score, changes) = evaluate_result(&ctx, &current, &refined, llm).await;
        last_score = score;
        all_changes.extend(changes);

        if score >= limits.quality_gate {
            emit(
                &ctx,
                LogKind::Success,
                format!("Quality threshold met ({}/100)", score),
            );
            current = refined;
            break;
        }
        if iteration >= limits.max_iterations {
            emit(
                &ctx,
                LogKind::Warning,
                format!("Max iterations reached ({}/100)", score),
            );
            current = refined;
            break;
        }

        // Escalate the next iteration toward regeneration.
        if confidence < limits.confidence_gate && strategy != EditStrategy::Regenerate {
            emit(
                &ctx,
                LogKind::Iteration,
                "Low confidence and low quality, escalating to regeneration".into(),
            );
            ctx.critique_notes
                .push_str("\n\nPREVIOUS ATTEMPT FAILED. Need complete regeneration following plan.");
        } else if strategy == EditStrategy::TargetedEdit {
            emit(
                &ctx,
                LogKind::Iteration,
                "Targeted edit insufficient, escalating to regeneration".into(),
            );
            ctx.critique_notes
                .push_str("\n\nTargeted edits not enough. Need deeper structural changes.");
        } else {
            emit(
                &ctx,
                LogKind::Warning,
                format!("Quality still low after {:?}", strategy),
            );
        }

        current = refined;
        iteration += 1;
    }

    emit(
        &ctx,
        LogKind::Success,
        format!(
            "Agent completed chapter {} after {} iteration(s)",
            ctx.chapter_number, iteration
        ),
    );

    Ok(EditingResult {
        refined_content: current,
        decision: last_decision.unwrap_or_else(|| fallback_decision("")),
        changes_applied: all_changes,
        quality_score: last_score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct SeqLlm {
        responses: Mutex<VecDeque<Result<String, LlmError>>>,
        calls: Arc<Mutex<usize>>,
    }

    impl SeqLlm {
        fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl LlmClient for SeqLlm {
        async fn generate(&self, _req: &GenRequest) -> Result<String, LlmError> {
            *self.calls.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LlmError::Empty))
        }
    }

    fn decision_json(strategy: &str, confidence: u32) -> Result<String, LlmError> {
        Ok(format!(
            r#"{{"strategy":"{}","reasoning":"r","priority":"medium","estimatedChanges":"10%","confidence":{}}}"#,
            strategy, confidence
        ))
    }

    fn evaluation_json(score: u32) -> Result<String, LlmError> {
        Ok(format!(
            r#"{{"qualityScore":{},"changesApplied":["tightened prose"],"planElementsPresent":true,"remainingIssues":[]}}"#,
            score
        ))
    }

    fn ctx<'a>(content: &'a str, critique: &str, plan: &'a ChapterPlan) -> EditingContext<'a> {
        EditingContext {
            chapter_content: content,
            plan,
            plan_text: "plan",
            critique_notes: critique.to_string(),
            chapter_number: 3,
            on_log: None,
        }
    }

    #[test]
    fn test_fallback_heuristics() {
        assert_eq!(fallback_decision("").strategy, EditStrategy::Skip);
        assert_eq!(
            fallback_decision("Overall CHAPTER IS STRONG, well done").strategy,
            EditStrategy::Skip
        );
        assert_eq!(
            fallback_decision("The villain is flat and archetypal").strategy,
            EditStrategy::Regenerate
        );
        assert_eq!(
            fallback_decision("Too many adjectives and a mixed metaphor").strategy,
            EditStrategy::TargetedEdit
        );
        assert_eq!(
            fallback_decision("Pacing drags slightly in the middle").strategy,
            EditStrategy::Polish
        );
    }

    #[tokio::test]
    async fn test_skip_path_returns_original_unchanged() {
        // Decision call fails; critique marks the chapter strong, so the
        // fallback decides skip and no edit calls happen.
        let llm = SeqLlm::new(vec![Err(LlmError::Overloaded)]);
        let plan = ChapterPlan::default();
        let result = agent_edit_chapter(
            ctx("Original chapter text.", "CHAPTER IS STRONG", &plan),
            &llm,
            &EditingLimits::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.refined_content, "Original chapter text.");
        assert_eq!(result.decision.strategy, EditStrategy::Skip);
        assert_eq!(*llm.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_loop_bounded_at_max_iterations() {
        // Both iterations score below the gate; the loop must stop at two
        // iterations (six calls) and accept the latest draft.
        let llm = SeqLlm::new(vec![
            decision_json("polish", 80),
            Ok("draft one".into()),
            evaluation_json(50),
            decision_json("polish", 80),
            Ok("draft two".into()),
            evaluation_json(55),
        ]);
        let plan = ChapterPlan::default();
        let result = agent_edit_chapter(
            ctx("Original.", "wordy in places", &plan),
            &llm,
            &EditingLimits::default(),
        )
        .await
        .unwrap();

        assert_eq!(*llm.calls.lock().unwrap(), 6);
        assert_eq!(result.refined_content, "draft two");
        assert_eq!(result.quality_score, 55);
        assert!(!result.refined_content.is_empty());
    }

    #[tokio::test]
    async fn test_quality_gate_stops_after_first_iteration() {
        let llm = SeqLlm::new(vec![
            decision_json("targeted-edit", 85),
            Ok("surgically fixed draft".into()),
            evaluation_json(88),
        ]);
        let plan = ChapterPlan::default();
        let result = agent_edit_chapter(
            ctx("Original.", "one mixed metaphor", &plan),
            &llm,
            &EditingLimits::default(),
        )
        .await
        .unwrap();

        assert_eq!(*llm.calls.lock().unwrap(), 3);
        assert_eq!(result.refined_content, "surgically fixed draft");
        assert_eq!(result.quality_score, 88);
        assert_eq!(result.changes_applied, vec!["tightened prose".to_string()]);
    }

    #[tokio::test]
    async fn test_evaluation_failure_defaults_to_neutral_pass() {
        // Evaluation call fails; score defaults to 75 which clears the gate.
        let llm = SeqLlm::new(vec![
            decision_json("polish", 80),
            Ok("polished draft".into()),
            Err(LlmError::Timeout(30)),
        ]);
        let plan = ChapterPlan::default();
        let result = agent_edit_chapter(
            ctx("Original.", "minor issues", &plan),
            &llm,
            &EditingLimits::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.quality_score, 75);
        assert_eq!(result.refined_content, "polished draft");
    }

    #[tokio::test]
    async fn test_log_events_delivered_via_callback() {
        let events: Arc<Mutex<Vec<AgentLogEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink = move |e: &AgentLogEvent| sink_events.lock().unwrap().push(e.clone());

        let llm = SeqLlm::new(vec![
            decision_json("polish", 80),
            Ok("polished".into()),
            evaluation_json(90),
        ]);
        let plan = ChapterPlan::default();
        let context = EditingContext {
            chapter_content: "Original.",
            plan: &plan,
            plan_text: "plan",
            critique_notes: "minor".into(),
            chapter_number: 7,
            on_log: Some(&sink),
        };
        agent_edit_chapter(context, &llm, &EditingLimits::default())
            .await
            .unwrap();

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| e.kind == LogKind::Decision));
        assert!(events.iter().any(|e| e.kind == LogKind::Execution));
        assert!(events.iter().any(|e| e.kind == LogKind::Evaluation));
        assert!(events.iter().any(|e| e.kind == LogKind::Success));
        assert!(events.iter().all(|e| e.chapter == 7));
    }
}
