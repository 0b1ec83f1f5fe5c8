//! Persisted book state. Saved to `<build>/state.json` after every chapter
//! so an interrupted run resumes by skipping completed work.

use crate::context::StoryContext;
use crate::plan::{ChapterData, ChapterPlan, CharacterRoster};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct BookState {
    pub premise: String,
    pub outline: String,
    pub characters: CharacterRoster,
    #[serde(default)]
    pub world_notes: String,
    #[serde(default)]
    pub motif_notes: String,
    pub plans: Vec<ChapterPlan>,
    /// Finished chapters in order. A chapter is only pushed after the full
    /// pipeline (editing included) accepted it.
    pub chapters: Vec<ChapterData>,
    pub story: StoryContext,
    #[serde(default)]
    pub final_pass_done: bool,
}

impl BookState {
    pub fn completed_chapters(&self) -> usize {
        self.chapters.len()
    }

    pub fn has_outline(&self) -> bool {
        !self.outline.is_empty()
    }

    pub fn has_plans(&self) -> bool {
        !self.plans.is_empty()
    }
}

fn state_path(build_dir: &str) -> PathBuf {
    Path::new(build_dir).join("state.json")
}

/// Missing file means a fresh run; a present but unreadable file is an error
/// rather than a silent restart.
pub fn load_state(build_dir: &str) -> Result<BookState> {
    let path = state_path(build_dir);
    if path.exists() {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file {}", path.display()))?;
        let state: BookState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file {}", path.display()))?;
        log::info!(
            "Resuming: {} chapter(s) already completed",
            state.completed_chapters()
        );
        Ok(state)
    } else {
        Ok(BookState::default())
    }
}

pub fn save_state(build_dir: &str, state: &BookState) -> Result<()> {
    fs::create_dir_all(build_dir)
        .with_context(|| format!("Failed to create build folder {}", build_dir))?;
    let path = state_path(build_dir);
    let content = serde_json::to_string_pretty(state)?;
    fs::write(&path, content)
        .with_context(|| format!("Failed to write state file {}", path.display()))?;
    Ok(())
}
